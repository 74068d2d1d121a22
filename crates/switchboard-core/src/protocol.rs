//! Named event frames exchanged over the bidirectional transport.
//!
//! Inbound frames are `{"type": <event>, "data": {...}}`. Outbound frames add
//! an RFC 3339 timestamp: `{"type": <event>, "timestamp": "...", "data": {...}}`.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound event names (client → server).
pub mod inbound {
    /// Present a credential in-band.
    pub const AUTHENTICATE: &str = "authenticate";
    /// Subscribe to a conversation room.
    pub const JOIN_CONVERSATION: &str = "join-conversation";
    /// Unsubscribe from a conversation room.
    pub const LEAVE_CONVERSATION: &str = "leave-conversation";
    /// Presence signal.
    pub const TYPING: &str = "typing";
    /// Content-bearing event.
    pub const NEW_MESSAGE: &str = "new-message";
    /// Request a state snapshot.
    pub const SYNC_STATE: &str = "sync-state";
}

/// Outbound event names (server → client).
pub mod outbound {
    /// Sent once the transport is accepted.
    pub const CONNECTION_ESTABLISHED: &str = "connection-established";
    /// Sent after a successful authentication.
    pub const AUTHENTICATED: &str = "authenticated";
    /// Sent right before a rejected connection is closed.
    pub const CONNECT_ERROR: &str = "connect-error";
    /// Tells a superseded connection to resynchronize.
    pub const SYNC_REQUIRED: &str = "sync-required";
    /// State snapshot response.
    pub const STATE_SYNCED: &str = "state-synced";
    /// Room join acknowledgement.
    pub const CONVERSATION_JOINED: &str = "conversation-joined";
    /// Room leave acknowledgement.
    pub const CONVERSATION_LEFT: &str = "conversation-left";
    /// Presence fan-out.
    pub const TYPING: &str = "typing";
    /// Transient message notification fan-out.
    pub const NEW_MESSAGE: &str = "new-message";
    /// Per-event error.
    pub const ERROR: &str = "error";
    /// Drain notification.
    pub const SERVER_SHUTDOWN: &str = "server-shutdown";
}

/// Reason carried by `sync-required` when a newer connection took over.
pub const NEW_SESSION_DETECTED: &str = "new_session_detected";

/// A frame received from a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Event name (e.g. `typing`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload; absent payloads deserialize as `null`.
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    /// Decode the payload into a typed struct.
    ///
    /// A `null` payload is treated as an empty object so optional-only
    /// payloads (e.g. `sync-state`) accept a bare frame.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.data.is_null() {
            serde_json::from_value(Value::Object(Map::new()))
        } else {
            serde_json::from_value(self.data.clone())
        }
    }
}

/// A server-pushed event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Event name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// ISO-8601 timestamp.
    pub timestamp: String,
    /// Event payload.
    pub data: Value,
}

impl ServerEvent {
    /// Create a new event with the current UTC timestamp.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: rfc3339_millis(Utc::now()),
            data,
        }
    }

    /// Build an event from any serializable payload.
    ///
    /// Payload types in this module are plain data and always serialize;
    /// a failure degrades to `null` rather than dropping the event.
    pub fn with_payload<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Self {
        Self::new(
            event_type,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }

    /// `connection-established {connectionId}`.
    pub fn connection_established(connection_id: &str) -> Self {
        Self::new(
            outbound::CONNECTION_ESTABLISHED,
            serde_json::json!({ "connectionId": connection_id }),
        )
    }

    /// `sync-required {reason}`.
    pub fn sync_required(reason: &str) -> Self {
        Self::with_payload(
            outbound::SYNC_REQUIRED,
            &SyncRequired {
                reason: reason.to_owned(),
            },
        )
    }

    /// `error {error, eventType?, message?}`.
    pub fn error(body: &ErrorBody) -> Self {
        Self::with_payload(outbound::ERROR, body)
    }

    /// `connect-error {error, category, message}`.
    pub fn connect_error(body: &RejectBody) -> Self {
        Self::with_payload(outbound::CONNECT_ERROR, body)
    }

    /// `state-synced {...snapshot}`.
    pub fn state_synced(snapshot: &StateSnapshot) -> Self {
        Self::with_payload(outbound::STATE_SYNCED, snapshot)
    }

    /// `server-shutdown {message, timestamp, reason}`.
    pub fn server_shutdown(notice: &ShutdownNotice) -> Self {
        Self::with_payload(outbound::SERVER_SHUTDOWN, notice)
    }

    /// Serialize to the JSON text sent over the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Format a timestamp the way every outbound frame does.
pub fn rfc3339_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound payloads
// ─────────────────────────────────────────────────────────────────────────────

/// `authenticate {token}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthPayload {
    /// Bearer credential.
    #[serde(default)]
    pub token: Option<String>,
}

/// Any payload naming a conversation (`join-conversation`, `typing`, ...).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    /// Conversation (room) id.
    pub conversation_id: String,
}

/// `sync-state {syncId?}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Caller-supplied correlation id, echoed verbatim.
    #[serde(default)]
    pub sync_id: Option<String>,
}

/// `new-message {conversationId, content, ...}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    /// Target conversation.
    pub conversation_id: String,
    /// Message body.
    pub content: Value,
    /// Any further fields, forwarded untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound payloads
// ─────────────────────────────────────────────────────────────────────────────

/// `sync-required` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncRequired {
    /// Machine-readable reason (e.g. `new_session_detected`).
    pub reason: String,
}

/// `error` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Machine-readable code.
    pub error: String,
    /// Event that triggered the error, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `connect-error` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RejectBody {
    /// Specific code (e.g. `EXPIRED_CREDENTIAL`).
    pub error: String,
    /// Coarse category (`AUTHENTICATION_REQUIRED` / `AUTHENTICATION_FAILED`).
    pub category: String,
    /// Human-readable detail.
    pub message: String,
}

/// `typing` fan-out payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    /// Conversation the sender is typing in.
    pub conversation_id: String,
    /// Who is typing.
    pub user_email: String,
}

/// `server-shutdown` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShutdownNotice {
    /// Human-readable notice.
    pub message: String,
    /// When the drain started.
    pub timestamp: String,
    /// Why the server is draining.
    pub reason: String,
}

/// One entry of the conversation list in a state snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Conversation id (also the room name).
    pub id: String,
    /// Display title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Last activity in the conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `state-synced` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Conversations visible to the caller.
    pub conversations: Vec<ConversationSummary>,
    /// Unread count per conversation id.
    pub unread_counts: HashMap<String, u64>,
    /// Emails of identities holding a live session.
    pub online_users: Vec<String>,
    /// Server clock at snapshot time.
    pub server_time: String,
    /// Correlation id (echoed or generated).
    pub sync_id: String,
}
