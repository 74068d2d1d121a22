//! Server error types.
//!
//! Each error that reaches a client exposes `code()`, one of the constants in
//! [`switchboard_core::errors`].

use switchboard_auth::CredentialError;
use switchboard_core::ConnectionId;
use switchboard_core::errors as codes;
use switchboard_core::protocol::{ErrorBody, RejectBody};
use thiserror::Error;

/// Resource Registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The connection was never attached or has already been released.
    #[error("connection {0} is not tracked")]
    NotTracked(ConnectionId),
    /// The connection is bound to a different principal.
    #[error("connection already authenticated as {current}")]
    AlreadyAuthenticated {
        /// Principal already attached.
        current: String,
    },
}

/// Session Coordinator failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The presented credential was refused.
    #[error(transparent)]
    Credential(#[from] CredentialError),
    /// The server is draining.
    #[error("server is shutting down")]
    ShuttingDown,
    /// The connection cap was reached.
    #[error("connection limit reached")]
    ConnectionLimit,
    /// A second credential named a different identity.
    #[error("connection already authenticated as another identity")]
    AlreadyAuthenticated,
    /// The connection went away while authenticating.
    #[error("connection released during authentication")]
    ConnectionGone,
}

impl SessionError {
    /// Wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Credential(e) => e.wire_code(),
            Self::ShuttingDown => codes::SERVER_SHUTTING_DOWN,
            Self::ConnectionLimit => codes::CONNECTION_LIMIT_REACHED,
            Self::AlreadyAuthenticated => codes::ALREADY_AUTHENTICATED,
            Self::ConnectionGone => codes::INTERNAL_ERROR,
        }
    }

    /// Category sent with a rejection.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Credential(e) => e.category(),
            other => other.code(),
        }
    }

    /// Whether this error ends an unauthenticated connection attempt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Credential(_) | Self::ShuttingDown | Self::ConnectionLimit
        )
    }

    /// `connect-error` payload.
    pub fn reject_body(&self) -> RejectBody {
        RejectBody {
            error: self.code().to_owned(),
            category: self.category().to_owned(),
            message: self.to_string(),
        }
    }
}

impl From<RegistryError> for SessionError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotTracked(_) => Self::ConnectionGone,
            RegistryError::AlreadyAuthenticated { .. } => Self::AlreadyAuthenticated,
        }
    }
}

/// Collaborator failures (conversation store, role directory, message sink).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    /// The collaborator could not be reached.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    /// The collaborator refused the request.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Per-event failures. Never fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// Frame was not valid JSON or lacked a required field.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// Event name is not part of the protocol.
    #[error("unknown event")]
    UnknownEvent,
    /// Event needs an authenticated identity.
    #[error("authentication required")]
    AuthenticationRequired,
    /// The connection has been replaced by a newer session.
    #[error("session superseded by a newer connection")]
    Superseded,
    /// Rate limit for this event class exhausted.
    #[error("rate limit exceeded")]
    RateLimited,
    /// The message collaborator refused the message.
    #[error("message rejected: {0}")]
    MessageRejected(String),
    /// A state snapshot could not be built.
    #[error("sync failed: {0}")]
    SyncFailed(String),
    /// The connection is no longer tracked.
    #[error("connection no longer tracked")]
    NotTracked,
}

impl EventError {
    /// Wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => codes::INVALID_PAYLOAD,
            Self::UnknownEvent => codes::UNKNOWN_EVENT,
            Self::AuthenticationRequired => codes::AUTHENTICATION_REQUIRED,
            Self::Superseded => codes::SESSION_SUPERSEDED,
            Self::RateLimited => codes::RATE_LIMIT_EXCEEDED,
            Self::MessageRejected(_) => codes::MESSAGE_REJECTED,
            Self::SyncFailed(_) => codes::SYNC_FAILED,
            Self::NotTracked => codes::INTERNAL_ERROR,
        }
    }

    /// `error` payload scoped to the triggering event.
    pub fn to_body(&self, event_type: Option<&str>) -> ErrorBody {
        ErrorBody {
            error: self.code().to_owned(),
            event_type: event_type.map(str::to_owned),
            message: Some(self.to_string()),
        }
    }
}

impl From<RegistryError> for EventError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotTracked(_) => Self::NotTracked,
            RegistryError::AlreadyAuthenticated { .. } => Self::AuthenticationRequired,
        }
    }
}
