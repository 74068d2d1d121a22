//! Credential failure taxonomy.

use switchboard_core::errors as codes;
use thiserror::Error;

/// Why a presented credential was refused.
///
/// The four variants are kept distinct internally; the wire form may fold the
/// last three into the `AUTHENTICATION_FAILED` category (see [`category`]).
///
/// [`category`]: CredentialError::category
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// Nothing was presented.
    #[error("no credential presented")]
    Missing,
    /// Not parseable as a signed token with the expected claims.
    #[error("malformed credential: {0}")]
    Malformed(String),
    /// Signature, issuer, audience, algorithm or not-before mismatch.
    #[error("invalid credential: {0}")]
    Invalid(String),
    /// Signature checks out but the token is past its expiry.
    #[error("credential expired")]
    Expired,
}

impl CredentialError {
    /// Validator-level code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Missing => codes::MISSING_CREDENTIAL,
            Self::Malformed(_) => codes::MALFORMED_CREDENTIAL,
            Self::Invalid(_) => codes::INVALID_CREDENTIAL,
            Self::Expired => codes::EXPIRED_CREDENTIAL,
        }
    }

    /// Code sent in a connection rejection.
    ///
    /// A missing credential is reported as `AUTHENTICATION_REQUIRED`; the
    /// rest keep their specific code.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Self::Missing => codes::AUTHENTICATION_REQUIRED,
            _ => self.code(),
        }
    }

    /// Coarse category sent alongside [`wire_code`](Self::wire_code).
    pub fn category(&self) -> &'static str {
        match self {
            Self::Missing => codes::AUTHENTICATION_REQUIRED,
            Self::Malformed(_) | Self::Invalid(_) | Self::Expired => codes::AUTHENTICATION_FAILED,
        }
    }
}
