//! HMAC-signed JWT validation.
//!
//! The validator is immutable after construction and holds no mutable state,
//! so one instance is shared by every connection task. Time is passed in by
//! the caller: `validate(credential, now)` is a pure function of its inputs
//! and the key material.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use switchboard_core::{Identity, Role};
use switchboard_settings::{AuthSettings, SettingsError};
use tracing::debug;

use crate::errors::CredentialError;

/// Claims read from a credential. `iss`/`aud` are checked by
/// `jsonwebtoken` against the configured values and not kept here.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Principal id.
    pub sub: String,
    /// Contact email.
    #[serde(default)]
    pub email: Option<String>,
    /// Role name (`admin`, `manager`, `agent`).
    #[serde(default)]
    pub role: Option<String>,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Not-before, seconds since the epoch.
    #[serde(default)]
    pub nbf: Option<i64>,
}

/// A successfully validated credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    /// Identity to attach to the connection.
    pub identity: Identity,
    /// `false` when the token carried no recognised role and
    /// [`Role::default`] was substituted.
    pub role_claimed: bool,
}

/// Verifies signed access credentials.
#[derive(Clone)]
pub struct CredentialValidator {
    key: DecodingKey,
    validation: Validation,
    leeway_secs: i64,
}

impl fmt::Debug for CredentialValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialValidator")
            .field("algorithms", &self.validation.algorithms)
            .field("iss", &self.validation.iss)
            .field("aud", &self.validation.aud)
            .field("leeway_secs", &self.leeway_secs)
            .finish_non_exhaustive()
    }
}

impl CredentialValidator {
    /// Validator for tokens signed with `secret` under `algorithm`.
    pub fn new(secret: &[u8], algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        // exp/nbf are checked against the caller's clock in `verify`.
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            leeway_secs: 0,
        }
    }

    /// Require the `iss` claim to equal `issuer`.
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        let _ = self.validation.required_spec_claims.insert("iss".to_owned());
        self
    }

    /// Require the `aud` claim to contain `audience`.
    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        let _ = self.validation.required_spec_claims.insert("aud".to_owned());
        self
    }

    /// Clock-skew allowance applied to `exp` and `nbf`.
    #[must_use]
    pub fn with_leeway(mut self, secs: u64) -> Self {
        self.leeway_secs = i64::try_from(secs).unwrap_or(i64::MAX);
        self
    }

    /// Build from the `auth` settings section.
    pub fn from_settings(settings: &AuthSettings) -> Result<Self, SettingsError> {
        let algorithm = Algorithm::from_str(&settings.algorithm).map_err(|_| {
            SettingsError::InvalidValue(format!("unknown algorithm {}", settings.algorithm))
        })?;
        if !matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(SettingsError::InvalidValue(format!(
                "{} is not an HMAC algorithm",
                settings.algorithm
            )));
        }
        if settings.secret.is_empty() {
            return Err(SettingsError::InvalidValue("auth.secret must be set".into()));
        }

        let mut validator =
            Self::new(settings.secret.as_bytes(), algorithm).with_leeway(settings.leeway_secs);
        if let Some(ref issuer) = settings.issuer {
            validator = validator.with_issuer(issuer);
        }
        if let Some(ref audience) = settings.audience {
            validator = validator.with_audience(audience);
        }
        Ok(validator)
    }

    /// Validate a credential, returning the identity it names.
    pub fn validate(
        &self,
        credential: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Identity, CredentialError> {
        self.verify(credential, now).map(|v| v.identity)
    }

    /// Validate a credential and report whether it carried a role.
    pub fn verify(
        &self,
        credential: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Verified, CredentialError> {
        let token = credential
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(CredentialError::Missing)?;

        let claims = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| {
                let err = classify(e.kind());
                debug!(code = err.code(), kind = ?e.kind(), "credential refused by decoder");
                err
            })?
            .claims;

        let now_ts = now.timestamp();
        if claims.exp.saturating_add(self.leeway_secs) < now_ts {
            return Err(CredentialError::Expired);
        }
        if let Some(nbf) = claims.nbf {
            if nbf > now_ts.saturating_add(self.leeway_secs) {
                return Err(CredentialError::Invalid("token not yet valid".into()));
            }
        }
        if claims.sub.trim().is_empty() {
            return Err(CredentialError::Malformed("empty subject".into()));
        }

        let expires_at = DateTime::from_timestamp(claims.exp, 0)
            .ok_or_else(|| CredentialError::Malformed("exp out of range".into()))?;
        let claimed = claims.role.as_deref().and_then(Role::from_claim);

        Ok(Verified {
            identity: Identity::new(
                claims.sub,
                claims.email,
                claimed.unwrap_or_default(),
                expires_at,
            ),
            role_claimed: claimed.is_some(),
        })
    }
}

fn classify(kind: &ErrorKind) -> CredentialError {
    match kind {
        ErrorKind::ExpiredSignature => CredentialError::Expired,
        ErrorKind::InvalidToken
        | ErrorKind::Base64(_)
        | ErrorKind::Json(_)
        | ErrorKind::Utf8(_) => CredentialError::Malformed(format!("{kind:?}")),
        // a configured issuer or audience the token does not name is a mismatch
        ErrorKind::MissingRequiredClaim(claim) if matches!(claim.as_str(), "iss" | "aud") => {
            CredentialError::Invalid(format!("missing claim {claim}"))
        }
        ErrorKind::MissingRequiredClaim(claim) => {
            CredentialError::Malformed(format!("missing claim {claim}"))
        }
        other => CredentialError::Invalid(format!("{other:?}")),
    }
}
