//! WebSocket session lifecycle: one task per client from upgrade through
//! release.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use switchboard_auth::CredentialError;
use switchboard_core::protocol::ServerEvent;
use tokio::time;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, CloseReason};
use super::handler::handle_message;
use super::heartbeat::{HeartbeatResult, MIN_TICK, run_heartbeat};
use crate::coordinator::SessionCoordinator;
use crate::errors::{EventError, SessionError};
use crate::manager::{ConnectionManager, OutboundReceiver};

/// Close-frame reasons are capped at 123 bytes by the protocol.
const MAX_CLOSE_REASON: usize = 123;

/// Run a WebSocket session for a connected client.
///
/// 1. Track the connection (refused with a close frame while draining)
/// 2. Spawn the writer and heartbeat listeners, send `connection-established`
/// 3. Authenticate with the handshake credential, if any, and arm the
///    authentication deadline
/// 4. Dispatch inbound frames in arrival order until the transport closes or
///    the connection is asked to close
/// 5. Let the writer flush, then release everything tied to the connection
#[instrument(skip_all, fields(conn_id))]
pub async fn run_ws_session(
    ws: WebSocket,
    manager: Arc<ConnectionManager>,
    handshake_credential: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (conn, rx) = match manager.open_connection() {
        Ok(pair) => pair,
        Err(err) => {
            refuse(&mut ws_tx, &err).await;
            return;
        }
    };
    let _ = tracing::Span::current().record("conn_id", conn.id.as_str());
    let config = manager.config();

    let writer = conn.spawn_listener(
        "writer",
        write_loop(ws_tx, rx, conn.clone(), config.heartbeat_interval),
    );
    let _ = conn.send_event(&ServerEvent::connection_established(conn.id.as_str()));

    let hb_conn = conn.clone();
    let (interval, timeout) = (config.heartbeat_interval, config.heartbeat_timeout);
    let _ = conn.spawn_listener("heartbeat", async move {
        let cancel = hb_conn.close_token();
        if run_heartbeat(hb_conn.clone(), interval, timeout, cancel).await
            == HeartbeatResult::TimedOut
        {
            warn!(conn_id = %hb_conn.id, idle = ?hb_conn.idle_for(), "client unresponsive, disconnecting");
            hb_conn.close(CloseReason::HeartbeatTimeout);
        }
    });

    if let Some(credential) = handshake_credential.as_deref() {
        let _ = manager.authenticate(&conn, Some(credential)).await;
    }
    if conn.identity().is_none() && !conn.is_closing() {
        arm_auth_deadline(&conn, config.auth_timeout);
    }

    let mut peer_closed = false;
    loop {
        let next = tokio::select! {
            () = conn.closed() => break,
            next = ws_rx.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                conn.mark_alive();
                handle_message(&manager, &conn, text.as_str()).await;
            }
            Some(Ok(Message::Binary(data))) => {
                conn.mark_alive();
                if let Ok(text) = std::str::from_utf8(&data) {
                    handle_message(&manager, &conn, text).await;
                } else {
                    debug!(len = data.len(), "received non-UTF8 binary frame");
                    let err = EventError::InvalidPayload("binary frame is not UTF-8".into());
                    let _ = conn.send_event(&ServerEvent::error(&err.to_body(None)));
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => conn.mark_alive(),
            Some(Ok(Message::Close(_))) | None => {
                debug!("client closed transport");
                conn.close(CloseReason::TransportClosed);
                peer_closed = true;
                break;
            }
            Some(Err(e)) => {
                debug!(error = %e, "transport error");
                conn.close(CloseReason::TransportClosed);
                peer_closed = true;
                break;
            }
        }
    }

    if time::timeout(config.close_flush, writer).await.is_err() {
        debug!("writer did not finish within close flush window");
    }
    // dropping the socket before the peer answers our close frame can reset
    // the connection and lose the frame
    if !peer_closed
        && time::timeout(config.close_flush, await_peer_close(&mut ws_rx))
            .await
            .is_err()
    {
        debug!("peer did not answer close within close flush window");
    }
    let _ = manager.release(&conn);
}

/// Read and discard frames until the peer's close frame or the end of the
/// stream.
async fn await_peer_close(ws_rx: &mut SplitStream<WebSocket>) {
    while let Some(Ok(msg)) = ws_rx.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
}

/// Reject an authentication that has not happened within `deadline`.
fn arm_auth_deadline(conn: &Arc<ClientConnection>, deadline: Duration) {
    let target = conn.clone();
    let _ = conn.spawn_listener("auth-deadline", async move {
        tokio::select! {
            () = time::sleep(deadline) => {}
            () = target.closed() => return,
        }
        if target.identity().is_none() {
            info!(conn_id = %target.id, "authentication deadline passed");
            SessionCoordinator::reject(&target, &SessionError::Credential(CredentialError::Missing));
        }
    });
}

/// Forward queued frames to the socket, pinging every `ping_every`.
///
/// Once the connection is asked to close, whatever is still queued is sent,
/// followed by a close frame carrying the close reason.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: OutboundReceiver,
    conn: Arc<ClientConnection>,
    ping_every: Duration,
) {
    let ping_every = ping_every.max(MIN_TICK);
    let mut ping = time::interval_at(time::Instant::now() + ping_every, ping_every);
    loop {
        tokio::select! {
            biased;
            msg = rx.recv() => {
                let Some(text) = msg else { break };
                if sink.send(Message::Text(text.as_str().into())).await.is_err() {
                    conn.close(CloseReason::TransportClosed);
                    return;
                }
            }
            () = conn.closed() => break,
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    conn.close(CloseReason::TransportClosed);
                    return;
                }
            }
        }
    }

    while let Ok(text) = rx.try_recv() {
        if sink.send(Message::Text(text.as_str().into())).await.is_err() {
            return;
        }
    }
    let reason = conn.close_reason().unwrap_or(CloseReason::Released);
    if reason != CloseReason::TransportClosed {
        let _ = sink.send(close_message(reason)).await;
    }
    let _ = sink.close().await;
}

/// Answer an upgrade that cannot be tracked (server draining).
async fn refuse(sink: &mut SplitSink<WebSocket, Message>, err: &SessionError) {
    if let Ok(json) = ServerEvent::connect_error(&err.reject_body()).to_json() {
        let _ = sink.send(Message::Text(json.into())).await;
    }
    let reason = match err {
        SessionError::ShuttingDown => CloseReason::Shutdown,
        SessionError::ConnectionLimit => CloseReason::Overloaded,
        other => CloseReason::Rejected(other.code()),
    };
    let _ = sink.send(close_message(reason)).await;
    let _ = sink.close().await;
}

fn close_message(reason: CloseReason) -> Message {
    let text: String = reason.reason().chars().take(MAX_CLOSE_REASON).collect();
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: text.into(),
    }))
}

#[cfg(test)]
mod tests {
    // Full sessions need a real socket; see tests/integration.rs.

    use super::*;

    #[test]
    fn close_message_carries_code_and_reason() {
        let Message::Close(Some(frame)) = close_message(CloseReason::Rejected("EXPIRED_CREDENTIAL"))
        else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 4401);
        assert_eq!(frame.reason.as_str(), "EXPIRED_CREDENTIAL");
    }

    #[test]
    fn shutdown_close_is_going_away() {
        let Message::Close(Some(frame)) = close_message(CloseReason::Shutdown) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 1001);
        assert_eq!(frame.reason.as_str(), "SERVER_SHUTTING_DOWN");
    }
}
