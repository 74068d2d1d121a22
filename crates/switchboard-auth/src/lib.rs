//! # switchboard-auth
//!
//! Credential validation for the switchboard connection manager.
//!
//! - [`CredentialValidator`]: verifies an HMAC-signed JWT against the current
//!   time and returns the [`Identity`](switchboard_core::Identity) it names.
//! - [`CredentialError`]: missing / malformed / invalid / expired.
//! - [`extract`]: picks the credential out of a handshake (auth payload or
//!   `Authorization: Bearer` header).
//!
//! Token issuance lives elsewhere; this crate only validates.

#![deny(unsafe_code)]

pub mod errors;
pub mod extract;
pub mod validator;

pub use errors::CredentialError;
pub use extract::{bearer_token, select_credential};
pub use validator::{Claims, CredentialValidator, Verified};
