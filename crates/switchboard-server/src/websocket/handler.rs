//! Inbound event dispatch.
//!
//! Every frame is parsed as a [`ClientFrame`]. `authenticate` goes to the
//! manager; every other event passes three gates in order (identity,
//! not superseded, rate limit) before it reaches the router or the sync
//! responder. A refused event produces an `error` frame to the sender only.

use std::sync::Arc;

use metrics::counter;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use switchboard_core::protocol::{
    AuthPayload, ClientFrame, ConversationRef, NewMessage, ServerEvent, SyncRequest, TypingNotice,
    inbound, outbound,
};
use switchboard_core::{Identity, RoomId};
use tracing::{debug, instrument};

use super::connection::ClientConnection;
use crate::errors::EventError;
use crate::manager::ConnectionManager;
use crate::metrics::{EVENTS_TOTAL, RATE_LIMITED_TOTAL};
use crate::rate_limit::EventKind;
use crate::sync::SyncOrigin;

/// Handle one inbound text frame from `conn`.
#[instrument(skip_all, fields(conn_id = %conn.id, event_type))]
pub async fn handle_message(manager: &ConnectionManager, conn: &Arc<ClientConnection>, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "unparseable frame");
            send_error(conn, &EventError::InvalidPayload(e.to_string()), None);
            return;
        }
    };
    let _ = tracing::Span::current().record("event_type", frame.event_type.as_str());
    counter!(EVENTS_TOTAL, "event_type" => metric_label(&frame.event_type)).increment(1);

    if frame.event_type == inbound::AUTHENTICATE {
        match payload::<AuthPayload>(&frame) {
            Ok(auth) => {
                let _ = manager.authenticate(conn, auth.token.as_deref()).await;
            }
            Err(err) => send_error(conn, &err, Some(inbound::AUTHENTICATE)),
        }
        return;
    }

    if let Err(err) = dispatch(manager, conn, &frame).await {
        debug!(code = err.code(), "event refused");
        send_error(conn, &err, Some(&frame.event_type));
    }
}

async fn dispatch(
    manager: &ConnectionManager,
    conn: &ClientConnection,
    frame: &ClientFrame,
) -> Result<(), EventError> {
    let kind = EventKind::for_event(&frame.event_type).ok_or(EventError::UnknownEvent)?;
    let identity = conn
        .identity()
        .cloned()
        .ok_or(EventError::AuthenticationRequired)?;
    if conn.is_superseded() {
        return Err(EventError::Superseded);
    }
    if !manager.limiter().admit(conn, kind) {
        counter!(RATE_LIMITED_TOTAL, "event_type" => kind.as_str()).increment(1);
        return Err(EventError::RateLimited);
    }

    match frame.event_type.as_str() {
        inbound::JOIN_CONVERSATION => {
            let target: ConversationRef = payload(frame)?;
            let room = RoomId::for_conversation(&target.conversation_id);
            let _ = manager.router().join(conn, &room)?;
            let _ = manager.router().send_to(
                conn,
                &ServerEvent::new(
                    outbound::CONVERSATION_JOINED,
                    json!({ "conversationId": target.conversation_id }),
                ),
            );
        }
        inbound::LEAVE_CONVERSATION => {
            let target: ConversationRef = payload(frame)?;
            let room = RoomId::for_conversation(&target.conversation_id);
            let _ = manager.router().leave(conn, &room)?;
            let _ = manager.router().send_to(
                conn,
                &ServerEvent::new(
                    outbound::CONVERSATION_LEFT,
                    json!({ "conversationId": target.conversation_id }),
                ),
            );
        }
        inbound::TYPING => {
            let target: ConversationRef = payload(frame)?;
            let room = RoomId::for_conversation(&target.conversation_id);
            let notice = ServerEvent::with_payload(
                outbound::TYPING,
                &TypingNotice {
                    conversation_id: target.conversation_id,
                    user_email: identity.email.clone(),
                },
            );
            let _ = manager.router().publish(conn, &room, &notice)?;
        }
        inbound::NEW_MESSAGE => {
            let message: NewMessage = payload(frame)?;
            manager
                .messages()
                .accept(&identity, &message)
                .await
                .map_err(|e| EventError::MessageRejected(e.to_string()))?;
            let room = RoomId::for_conversation(&message.conversation_id);
            let event = ServerEvent::new(outbound::NEW_MESSAGE, message_notification(&identity, message));
            let _ = manager.router().publish(conn, &room, &event)?;
        }
        inbound::SYNC_STATE => {
            let request: SyncRequest = payload(frame)?;
            let snapshot = manager
                .sync()
                .snapshot(&identity, request.sync_id, SyncOrigin::Requested)
                .await?;
            let _ = manager
                .router()
                .send_to(conn, &ServerEvent::state_synced(&snapshot));
        }
        _ => return Err(EventError::UnknownEvent),
    }
    Ok(())
}

/// `new-message` fan-out body: the client's fields plus `senderEmail`.
fn message_notification(sender: &Identity, message: NewMessage) -> Value {
    let mut data = message.extra;
    let _ = data.insert("conversationId".into(), Value::String(message.conversation_id));
    let _ = data.insert("content".into(), message.content);
    let _ = data.insert("senderEmail".into(), Value::String(sender.email.clone()));
    Value::Object(data)
}

fn payload<T: DeserializeOwned>(frame: &ClientFrame) -> Result<T, EventError> {
    frame
        .payload()
        .map_err(|e| EventError::InvalidPayload(e.to_string()))
}

fn send_error(conn: &ClientConnection, err: &EventError, event_type: Option<&str>) {
    let _ = conn.send_event(&ServerEvent::error(&err.to_body(event_type)));
}

/// Bounded label set for the events counter.
fn metric_label(event_type: &str) -> &'static str {
    match event_type {
        inbound::AUTHENTICATE => inbound::AUTHENTICATE,
        inbound::JOIN_CONVERSATION => inbound::JOIN_CONVERSATION,
        inbound::LEAVE_CONVERSATION => inbound::LEAVE_CONVERSATION,
        inbound::TYPING => inbound::TYPING,
        inbound::NEW_MESSAGE => inbound::NEW_MESSAGE,
        inbound::SYNC_STATE => inbound::SYNC_STATE,
        _ => "unknown",
    }
}
