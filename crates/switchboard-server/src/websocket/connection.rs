//! WebSocket client connection state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use switchboard_core::errors as codes;
use switchboard_core::protocol::ServerEvent;
use switchboard_core::{ConnectionId, Identity, RoomId};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::warn;

use crate::rate_limit::{EventKind, RateBucket};

/// Why a connection is being closed. The first reason recorded wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Authentication was refused; carries the wire code.
    Rejected(&'static str),
    /// A newer connection took over this identity.
    Superseded,
    /// The server is draining.
    Shutdown,
    /// The connection cap was reached.
    Overloaded,
    /// No inbound traffic within the heartbeat timeout.
    HeartbeatTimeout,
    /// The client closed or the transport failed.
    TransportClosed,
    /// Released without a more specific reason.
    Released,
}

impl CloseReason {
    /// WebSocket close code.
    pub fn code(self) -> u16 {
        match self {
            Self::Rejected(_) => 4401,
            Self::Superseded => 4409,
            Self::Shutdown => 1001,
            Self::Overloaded => 1013,
            Self::HeartbeatTimeout => 4408,
            Self::TransportClosed | Self::Released => 1000,
        }
    }

    /// Close-frame reason text (a machine-readable code where one applies).
    pub fn reason(self) -> &'static str {
        match self {
            Self::Rejected(code) => code,
            Self::Superseded => codes::SESSION_SUPERSEDED,
            Self::Shutdown => codes::SERVER_SHUTTING_DOWN,
            Self::Overloaded => codes::CONNECTION_LIMIT_REACHED,
            Self::HeartbeatTimeout => codes::HEARTBEAT_TIMEOUT,
            Self::TransportClosed | Self::Released => "",
        }
    }
}

/// A background task tied to one connection.
///
/// Handles are returned by [`ClientConnection::spawn_listener`] and kept on
/// the connection; releasing the connection aborts them all at once.
#[derive(Debug)]
pub struct ListenerHandle {
    name: &'static str,
    abort: AbortHandle,
}

impl ListenerHandle {
    /// Listener label (`writer`, `heartbeat`, ...).
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task has completed.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }

    fn abort(&self) {
        self.abort.abort();
    }
}

/// Represents a connected WebSocket client.
///
/// Owned by the [`ResourceRegistry`](crate::registry::ResourceRegistry);
/// the transport task only holds an `Arc` to send and receive through it.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Set once, on successful authentication.
    identity: OnceLock<Identity>,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Last inbound frame of any kind.
    last_activity: Mutex<Instant>,
    /// Whether the client has shown activity since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// Count of messages dropped due to a full or closed channel.
    pub dropped_messages: AtomicU64,
    /// Rooms joined. The mutex also serializes join against release.
    rooms: Mutex<HashSet<RoomId>>,
    /// Set (under the `rooms` lock) when release begins.
    released: AtomicBool,
    /// Set when a newer connection took over this identity.
    superseded: AtomicBool,
    listeners: Mutex<Vec<ListenerHandle>>,
    rate_buckets: Mutex<HashMap<EventKind, RateBucket>>,
    close: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.identity().map(|i| i.user_id.as_str()))
            .field("closing", &self.is_closing())
            .field("close_reason", &self.close_reason())
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            id,
            identity: OnceLock::new(),
            tx,
            connected_at: now,
            last_activity: Mutex::new(now),
            is_alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
            rooms: Mutex::new(HashSet::new()),
            released: AtomicBool::new(false),
            superseded: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            rate_buckets: Mutex::new(HashMap::new()),
            close: CancellationToken::new(),
            close_reason: Mutex::new(None),
        }
    }

    // ── Identity ────────────────────────────────────────────────────

    /// The authenticated identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// Attach an identity. Fails with the already-attached identity when one
    /// naming a different principal is present.
    pub(crate) fn attach_identity(&self, identity: Identity) -> Result<(), &Identity> {
        let attached = self.identity.get_or_init(|| identity.clone());
        if attached.same_principal(&identity) {
            Ok(())
        } else {
            Err(attached)
        }
    }

    /// Whether a newer connection took over this identity.
    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_superseded(&self) {
        self.superseded.store(true, Ordering::SeqCst);
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Send a text message to the client.
    ///
    /// Returns `false` if the channel is full or closed, and increments
    /// the dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize an event and send it to the client.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match event.to_json() {
            Ok(json) => self.send(Arc::new(json)),
            Err(e) => {
                warn!(conn_id = %self.id, event_type = %event.event_type, error = %e, "failed to serialize event");
                false
            }
        }
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    // ── Liveness ────────────────────────────────────────────────────

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Time since the last inbound frame (or connection establishment).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    // ── Rooms ───────────────────────────────────────────────────────

    /// Rooms currently joined.
    pub fn rooms(&self) -> Vec<RoomId> {
        self.rooms.lock().iter().cloned().collect()
    }

    /// Run `f` on the room set unless release has begun.
    pub(crate) fn with_rooms<R>(&self, f: impl FnOnce(&mut HashSet<RoomId>) -> R) -> Option<R> {
        let mut rooms = self.rooms.lock();
        if self.released.load(Ordering::SeqCst) {
            return None;
        }
        Some(f(&mut rooms))
    }

    /// Mark released and hand back the joined rooms. Later joins fail.
    pub(crate) fn begin_release(&self) -> HashSet<RoomId> {
        let mut rooms = self.rooms.lock();
        self.released.store(true, Ordering::SeqCst);
        std::mem::take(&mut *rooms)
    }

    /// Whether release has begun.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    // ── Listener handles ────────────────────────────────────────────

    /// Spawn a task owned by this connection.
    ///
    /// If the connection is already released the task is aborted at once.
    pub fn spawn_listener<F>(&self, name: &'static str, task: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        self.track_listener(name, handle.abort_handle());
        handle
    }

    fn track_listener(&self, name: &'static str, abort: AbortHandle) {
        let listener = ListenerHandle { name, abort };
        let mut listeners = self.listeners.lock();
        if self.is_released() {
            listener.abort();
            return;
        }
        listeners.retain(|l| !l.is_finished());
        listeners.push(listener);
    }

    /// Listener handles still held.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Abort and discard every listener. Returns how many were held.
    pub(crate) fn abort_listeners(&self) -> usize {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in &listeners {
            listener.abort();
        }
        listeners.len()
    }

    // ── Rate buckets ────────────────────────────────────────────────

    /// Run `f` on the bucket for `kind`, creating it if needed.
    /// Returns `None` once release has begun.
    pub(crate) fn with_bucket<R>(
        &self,
        kind: EventKind,
        create: impl FnOnce() -> RateBucket,
        f: impl FnOnce(&mut RateBucket) -> R,
    ) -> Option<R> {
        let mut buckets = self.rate_buckets.lock();
        if self.is_released() {
            return None;
        }
        Some(f(buckets.entry(kind).or_insert_with(create)))
    }

    /// Rate buckets currently held.
    pub fn rate_bucket_count(&self) -> usize {
        self.rate_buckets.lock().len()
    }

    pub(crate) fn clear_rate_buckets(&self) -> usize {
        let mut buckets = self.rate_buckets.lock();
        let n = buckets.len();
        buckets.clear();
        n
    }

    // ── Close ───────────────────────────────────────────────────────

    /// Ask the transport to close. The outbound queue is flushed first.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.close.cancel();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close.cancelled()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closing(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Token cancelled on close, for tasks that outlive a borrow.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// The recorded close reason.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }
}
