//! Resource Registry: the only owner of shared connection state.
//!
//! Three sharded maps:
//!
//! - `connections`: every live connection, `ConnectionId → ClientConnection`
//! - `sessions`: one current holder per identity, `user_id → ConnectionId`
//! - `rooms`: room membership, `RoomId → {ConnectionId}`
//!
//! Per-connection resources (joined rooms, listener handles, rate buckets)
//! hang off the `ClientConnection` itself, so dropping a connection from
//! `connections` and running [`ResourceRegistry::release`] leaves nothing
//! keyed by its id.
//!
//! Mutations on one identity or one room serialize on that key's shard lock.
//! A connection's own `rooms` mutex is always taken before any shard lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use switchboard_core::{ConnectionId, Identity, RoomId};
use tokio::sync::watch;
use tracing::debug;

use crate::errors::RegistryError;
use crate::websocket::connection::{ClientConnection, CloseReason};

/// What [`ResourceRegistry::release`] removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Released connection.
    pub connection_id: ConnectionId,
    /// Rooms it was removed from.
    pub rooms_left: usize,
    /// Whether it was still the session holder for its identity.
    pub session_removed: bool,
    /// Listener handles aborted.
    pub listeners_aborted: usize,
    /// Rate buckets discarded.
    pub rate_buckets_cleared: usize,
}

/// Owner of the identity, room and connection maps.
pub struct ResourceRegistry {
    connections: DashMap<ConnectionId, Arc<ClientConnection>>,
    sessions: DashMap<String, ConnectionId>,
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
    /// Live connection count, watchable for drain.
    live: watch::Sender<usize>,
    accepted_total: AtomicU64,
}

impl ResourceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        let (live, _) = watch::channel(0);
        Self {
            connections: DashMap::with_capacity(1024),
            sessions: DashMap::new(),
            rooms: DashMap::new(),
            live,
            accepted_total: AtomicU64::new(0),
        }
    }

    // ==================== Connection lifecycle ====================

    /// Track a freshly accepted connection.
    pub fn attach(&self, conn: Arc<ClientConnection>) {
        let id = conn.id.clone();
        if self.connections.insert(id.clone(), conn).is_none() {
            self.live.send_modify(|n| *n += 1);
            let _ = self.accepted_total.fetch_add(1, Ordering::Relaxed);
            debug!(conn_id = %id, "connection attached");
        }
    }

    /// Make `conn` the session holder for `identity`.
    ///
    /// The swap of the previous holder for `conn` happens under the
    /// identity's shard lock, so two concurrent registrations for one
    /// identity resolve to exactly one holder (last writer wins). The
    /// replaced connection, if any, is marked superseded and returned.
    pub fn register(
        &self,
        conn: &Arc<ClientConnection>,
        identity: Identity,
    ) -> Result<Option<Arc<ClientConnection>>, RegistryError> {
        if !self.connections.contains_key(&conn.id) {
            return Err(RegistryError::NotTracked(conn.id.clone()));
        }
        let user_id = identity.user_id.clone();
        conn.attach_identity(identity)
            .map_err(|current| RegistryError::AlreadyAuthenticated {
                current: current.user_id.clone(),
            })?;

        let previous = match self.sessions.entry(user_id.clone()) {
            // release sets the flag before it takes this shard lock
            _ if conn.is_released() => return Err(RegistryError::NotTracked(conn.id.clone())),
            Entry::Occupied(mut entry) => {
                if *entry.get() == conn.id {
                    None
                } else {
                    Some(entry.insert(conn.id.clone()))
                }
            }
            Entry::Vacant(entry) => {
                let _ = entry.insert(conn.id.clone());
                None
            }
        };

        let previous = previous.and_then(|id| self.connections.get(&id).map(|c| c.value().clone()));
        if let Some(ref prev) = previous {
            prev.mark_superseded();
            debug!(user_id, old = %prev.id, new = %conn.id, "session holder replaced");
        } else {
            debug!(user_id, conn_id = %conn.id, "session registered");
        }
        Ok(previous)
    }

    /// Drop the session entry for `user_id`, returning its holder.
    ///
    /// The holder is marked superseded but stays tracked until released.
    pub fn evict(&self, user_id: &str) -> Option<Arc<ClientConnection>> {
        let (_, holder) = self.sessions.remove(user_id)?;
        let conn = self.connections.get(&holder).map(|c| c.value().clone())?;
        conn.mark_superseded();
        debug!(user_id, conn_id = %holder, "session evicted");
        Some(conn)
    }

    /// Add `conn` to `room`. Returns `false` if it was already a member.
    pub fn join(&self, conn: &ClientConnection, room: &RoomId) -> Result<bool, RegistryError> {
        conn.with_rooms(|rooms| {
            if !rooms.insert(room.clone()) {
                return false;
            }
            let _ = self
                .rooms
                .entry(room.clone())
                .or_default()
                .insert(conn.id.clone());
            true
        })
        .ok_or_else(|| RegistryError::NotTracked(conn.id.clone()))
    }

    /// Remove `conn` from `room`. Returns `false` if it was not a member.
    pub fn leave(&self, conn: &ClientConnection, room: &RoomId) -> bool {
        conn.with_rooms(|rooms| {
            if !rooms.remove(room) {
                return false;
            }
            self.remove_member(room, &conn.id);
            true
        })
        .unwrap_or(false)
    }

    /// Remove `conn` from every room it joined.
    pub fn leave_all(&self, conn: &ClientConnection) -> Vec<RoomId> {
        conn.with_rooms(|rooms| {
            let left: Vec<RoomId> = rooms.drain().collect();
            for room in &left {
                self.remove_member(room, &conn.id);
            }
            left
        })
        .unwrap_or_default()
    }

    /// Single cleanup entry point for every disconnect cause.
    ///
    /// Removes the connection, its room memberships, its session entry (if
    /// it is still the holder), and aborts its listeners and discards its
    /// rate buckets. Idempotent: returns `None` if the connection is not
    /// tracked. Each step is an idempotent removal.
    pub fn release(&self, conn_id: &ConnectionId) -> Option<ReleaseReport> {
        let (_, conn) = self.connections.remove(conn_id)?;

        let rooms = conn.begin_release();
        for room in &rooms {
            self.remove_member(room, conn_id);
        }

        let session_removed = conn.identity().is_some_and(|identity| {
            self.sessions
                .remove_if(&identity.user_id, |_, holder| holder == conn_id)
                .is_some()
        });

        let listeners_aborted = conn.abort_listeners();
        let rate_buckets_cleared = conn.clear_rate_buckets();
        conn.close(CloseReason::Released);

        self.live.send_modify(|n| *n = n.saturating_sub(1));

        let report = ReleaseReport {
            connection_id: conn_id.clone(),
            rooms_left: rooms.len(),
            session_removed,
            listeners_aborted,
            rate_buckets_cleared,
        };
        debug!(
            conn_id = %conn_id,
            rooms = report.rooms_left,
            session_removed,
            listeners = listeners_aborted,
            "connection released"
        );
        Some(report)
    }

    fn remove_member(&self, room: &RoomId, conn_id: &ConnectionId) {
        if let Entry::Occupied(mut entry) = self.rooms.entry(room.clone()) {
            let _ = entry.get_mut().remove(conn_id);
            if entry.get().is_empty() {
                let _ = entry.remove();
            }
        }
    }

    /// Resolves once no connection is tracked.
    pub async fn wait_until_empty(&self) {
        let mut rx = self.live.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    // ==================== Queries ====================

    /// Look up a tracked connection.
    pub fn get(&self, conn_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.connections.get(conn_id).map(|c| c.value().clone())
    }

    /// Whether `conn_id` is tracked.
    pub fn is_tracked(&self, conn_id: &ConnectionId) -> bool {
        self.connections.contains_key(conn_id)
    }

    /// Current session holder for `user_id`.
    pub fn session_holder(&self, user_id: &str) -> Option<ConnectionId> {
        self.sessions.get(user_id).map(|h| h.value().clone())
    }

    /// Live members of `room`.
    pub fn room_members(&self, room: &RoomId) -> Vec<Arc<ClientConnection>> {
        let ids: Vec<ConnectionId> = match self.rooms.get(room) {
            Some(members) => members.iter().cloned().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Point-in-time copy of every tracked connection.
    pub fn connections_snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Tracked connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Sum of room sizes, and the largest room size.
    pub fn membership_totals(&self) -> (usize, usize) {
        self.rooms.iter().fold((0, 0), |(total, largest), entry| {
            let n = entry.value().len();
            (total + n, largest.max(n))
        })
    }

    /// Emails of identities currently holding a session, sorted.
    pub fn online_users(&self) -> Vec<String> {
        let holders: Vec<ConnectionId> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut users: Vec<String> = holders
            .iter()
            .filter_map(|id| self.get(id))
            .filter_map(|c| c.identity().map(|i| i.email.clone()))
            .collect();
        users.sort();
        users.dedup();
        users
    }

    /// Connections accepted since start.
    pub fn accepted_total(&self) -> u64 {
        self.accepted_total.load(Ordering::Relaxed)
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
