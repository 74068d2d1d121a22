//! Machine-readable error codes carried on the wire.

// ── Authentication ──────────────────────────────────────────────────

/// An event that needs an identity arrived before authentication completed,
/// or a connection never presented a credential.
pub const AUTHENTICATION_REQUIRED: &str = "AUTHENTICATION_REQUIRED";
/// Combined category for malformed, invalid and expired credentials.
pub const AUTHENTICATION_FAILED: &str = "AUTHENTICATION_FAILED";
/// Nothing was presented where a credential was expected.
pub const MISSING_CREDENTIAL: &str = "MISSING_CREDENTIAL";
/// The credential could not be parsed as a signed token.
pub const MALFORMED_CREDENTIAL: &str = "MALFORMED_CREDENTIAL";
/// Signature, issuer, audience or algorithm mismatch.
pub const INVALID_CREDENTIAL: &str = "INVALID_CREDENTIAL";
/// Valid signature, but past its expiry.
pub const EXPIRED_CREDENTIAL: &str = "EXPIRED_CREDENTIAL";
/// A second credential named a different identity than the one attached.
pub const ALREADY_AUTHENTICATED: &str = "ALREADY_AUTHENTICATED";

// ── Session lifecycle ───────────────────────────────────────────────

/// The connection was replaced by a newer one for the same identity.
pub const SESSION_SUPERSEDED: &str = "SESSION_SUPERSEDED";
/// The server is draining and refuses new sessions.
pub const SERVER_SHUTTING_DOWN: &str = "SERVER_SHUTTING_DOWN";
/// No liveness signal within the heartbeat timeout.
pub const HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";
/// The configured connection ceiling was reached.
pub const CONNECTION_LIMIT_REACHED: &str = "CONNECTION_LIMIT_REACHED";

// ── Events ──────────────────────────────────────────────────────────

/// Per-connection, per-event-type admission was denied.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
/// Frame was not valid JSON or lacked a required field.
pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
/// Event name is not part of the protocol.
pub const UNKNOWN_EVENT: &str = "UNKNOWN_EVENT";
/// The message collaborator refused the message.
pub const MESSAGE_REJECTED: &str = "MESSAGE_REJECTED";
/// A state snapshot could not be built.
pub const SYNC_FAILED: &str = "SYNC_FAILED";
/// Unexpected internal failure.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
