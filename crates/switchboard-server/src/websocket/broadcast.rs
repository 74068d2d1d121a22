//! Room-scoped event fan-out.
//!
//! Each event is serialized once and pushed onto every recipient's bounded
//! outbound queue. A sender's events are handled one at a time by its
//! session task and each queue is FIFO, so one sender's stream reaches every
//! member in order. Delivery across members is unordered and best-effort; a
//! full queue drops the frame for that member only.

use std::sync::Arc;

use metrics::counter;
use switchboard_core::protocol::ServerEvent;
use switchboard_core::{ConnectionId, RoomId};
use tracing::{debug, warn};

use super::connection::ClientConnection;
use crate::errors::EventError;
use crate::metrics::WS_BROADCAST_DROPS_TOTAL;
use crate::registry::ResourceRegistry;

/// Routes events to room members through the registry's room index.
pub struct BroadcastRouter {
    registry: Arc<ResourceRegistry>,
}

impl BroadcastRouter {
    /// Router over `registry`.
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self { registry }
    }

    /// Subscribe `conn` to `room`. Re-joining is a no-op (`Ok(false)`).
    pub fn join(&self, conn: &ClientConnection, room: &RoomId) -> Result<bool, EventError> {
        if conn.identity().is_none() {
            return Err(EventError::AuthenticationRequired);
        }
        let joined = self.registry.join(conn, room)?;
        if joined {
            debug!(conn_id = %conn.id, %room, "joined room");
        }
        Ok(joined)
    }

    /// Unsubscribe `conn` from `room`.
    pub fn leave(&self, conn: &ClientConnection, room: &RoomId) -> Result<bool, EventError> {
        if conn.identity().is_none() {
            return Err(EventError::AuthenticationRequired);
        }
        Ok(self.registry.leave(conn, room))
    }

    /// Fan an event out from `sender` to the rest of `room`.
    ///
    /// Fails with `AuthenticationRequired` (and sends nothing) when the
    /// sender has no identity.
    pub fn publish(
        &self,
        sender: &ClientConnection,
        room: &RoomId,
        event: &ServerEvent,
    ) -> Result<usize, EventError> {
        if sender.identity().is_none() {
            return Err(EventError::AuthenticationRequired);
        }
        Ok(self.broadcast(room, event, Some(&sender.id)))
    }

    /// Send `event` to every member of `room` except `exclude`.
    ///
    /// Returns how many members accepted the frame.
    pub fn broadcast(
        &self,
        room: &RoomId,
        event: &ServerEvent,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let json = match event.to_json() {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!(event_type = %event.event_type, error = %e, "failed to serialize event");
                return 0;
            }
        };
        let members = self.registry.room_members(room);
        let mut delivered = 0;
        for conn in members.iter().filter(|c| Some(&c.id) != exclude) {
            if conn.send(json.clone()) {
                delivered += 1;
            } else {
                counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
                warn!(conn_id = %conn.id, %room, event_type = %event.event_type, "failed to send event to member");
            }
        }
        debug!(event_type = %event.event_type, %room, recipients = delivered, "broadcast event to room");
        delivered
    }

    /// Send `event` to one connection.
    pub fn send_to(&self, conn: &ClientConnection, event: &ServerEvent) -> bool {
        let sent = conn.send_event(event);
        if !sent {
            counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
            debug!(conn_id = %conn.id, event_type = %event.event_type, "failed to enqueue event");
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use switchboard_core::{Identity, Role};
    use tokio::sync::mpsc;

    use super::*;

    struct Member {
        conn: Arc<ClientConnection>,
        rx: mpsc::Receiver<Arc<String>>,
    }

    fn member(reg: &ResourceRegistry, user: Option<&str>) -> Member {
        let (tx, rx) = mpsc::channel(32);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
        reg.attach(conn.clone());
        if let Some(user) = user {
            let identity = Identity::new(user, None, Role::Agent, Utc::now());
            let _ = reg.register(&conn, identity).unwrap();
        }
        Member { conn, rx }
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(serde_json::from_str(&msg).unwrap());
        }
        out
    }

    fn setup() -> (Arc<ResourceRegistry>, BroadcastRouter) {
        let reg = Arc::new(ResourceRegistry::new());
        let router = BroadcastRouter::new(reg.clone());
        (reg, router)
    }

    #[test]
    fn join_requires_identity() {
        let (reg, router) = setup();
        let anon = member(&reg, None);
        assert_eq!(
            router.join(&anon.conn, &RoomId::from("c1")),
            Err(EventError::AuthenticationRequired)
        );
        assert_eq!(reg.room_count(), 0);
    }

    #[test]
    fn rejoin_is_noop() {
        let (reg, router) = setup();
        let m = member(&reg, Some("u1"));
        let room = RoomId::from("c1");
        assert_eq!(router.join(&m.conn, &room), Ok(true));
        assert_eq!(router.join(&m.conn, &room), Ok(false));
        assert_eq!(reg.room_members(&room).len(), 1);
    }

    #[test]
    fn publish_excludes_sender() {
        let (reg, router) = setup();
        let mut a = member(&reg, Some("a"));
        let mut b = member(&reg, Some("b"));
        let mut outsider = member(&reg, Some("c"));
        let room = RoomId::from("c1");
        let _ = router.join(&a.conn, &room).unwrap();
        let _ = router.join(&b.conn, &room).unwrap();

        let event = ServerEvent::new("typing", json!({"conversationId": "c1"}));
        assert_eq!(router.publish(&a.conn, &room, &event), Ok(1));

        assert!(drain(&mut a.rx).is_empty());
        assert!(drain(&mut outsider.rx).is_empty());
        let got = drain(&mut b.rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["type"], "typing");
    }

    #[test]
    fn unauthenticated_publish_sends_nothing() {
        let (reg, router) = setup();
        let anon = member(&reg, None);
        let mut b = member(&reg, Some("b"));
        let room = RoomId::from("c1");
        let _ = router.join(&b.conn, &room).unwrap();

        let event = ServerEvent::new("typing", json!({}));
        assert_eq!(
            router.publish(&anon.conn, &room, &event),
            Err(EventError::AuthenticationRequired)
        );
        assert!(drain(&mut b.rx).is_empty());
    }

    #[test]
    fn sender_order_preserved() {
        let (reg, router) = setup();
        let a = member(&reg, Some("a"));
        let mut b = member(&reg, Some("b"));
        let room = RoomId::from("c1");
        let _ = router.join(&a.conn, &room).unwrap();
        let _ = router.join(&b.conn, &room).unwrap();

        for i in 0..10 {
            let event = ServerEvent::new("new-message", json!({ "seq": i }));
            let _ = router.publish(&a.conn, &room, &event).unwrap();
        }
        let seqs: Vec<i64> = drain(&mut b.rx)
            .iter()
            .map(|v| v["data"]["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn full_queue_drops_for_that_member_only() {
        let (reg, router) = setup();
        let (tx, _slow_rx) = mpsc::channel(1);
        let slow = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
        reg.attach(slow.clone());
        let _ = reg
            .register(&slow, Identity::new("slow", None, Role::Agent, Utc::now()))
            .unwrap();
        let mut fast = member(&reg, Some("fast"));
        let room = RoomId::from("c1");
        let _ = router.join(&slow, &room).unwrap();
        let _ = router.join(&fast.conn, &room).unwrap();

        let event = ServerEvent::new("typing", json!({}));
        assert_eq!(router.broadcast(&room, &event, None), 2);
        assert_eq!(router.broadcast(&room, &event, None), 1);
        assert_eq!(slow.drop_count(), 1);
        assert_eq!(drain(&mut fast.rx).len(), 2);
    }
}
