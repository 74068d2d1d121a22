//! The connection manager: one explicitly constructed instance per server.
//!
//! Owns the registry and every component that works on it, and exposes the
//! operations the transport layer drives: open, authenticate, release, drain.

use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use serde_json::json;
use switchboard_auth::CredentialValidator;
use switchboard_core::protocol::{ErrorBody, ServerEvent, inbound, outbound};
use switchboard_core::{ConnectionId, Identity};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::coordinator::SessionCoordinator;
use crate::directory::{Collaborators, MessageSink};
use crate::errors::SessionError;
use crate::metrics::{
    AUTH_FAILURES_TOTAL, WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE,
    WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::rate_limit::RateLimiter;
use crate::registry::{ReleaseReport, ResourceRegistry};
use crate::shutdown::{DrainReport, ShutdownCoordinator};
use crate::stats::{StatsReporter, StatsSnapshot};
use crate::sync::{SyncOrigin, SyncResponder};
use crate::websocket::broadcast::BroadcastRouter;
use crate::websocket::connection::ClientConnection;

/// Receiving half of a connection's outbound queue.
pub type OutboundReceiver = mpsc::Receiver<Arc<String>>;

/// Everything the transport needs, wired around one [`ResourceRegistry`].
pub struct ConnectionManager {
    config: ServerConfig,
    registry: Arc<ResourceRegistry>,
    coordinator: SessionCoordinator,
    router: BroadcastRouter,
    limiter: RateLimiter,
    sync: SyncResponder,
    shutdown: ShutdownCoordinator,
    stats: StatsReporter,
    messages: Arc<dyn MessageSink>,
}

impl ConnectionManager {
    /// Wire a manager from its configuration, validator and collaborators.
    pub fn new(
        config: ServerConfig,
        validator: CredentialValidator,
        collaborators: Collaborators,
    ) -> Self {
        let registry = Arc::new(ResourceRegistry::new());
        let shutdown =
            ShutdownCoordinator::new(registry.clone(), config.grace_period, config.close_flush);
        let coordinator = SessionCoordinator::new(
            Arc::new(validator),
            registry.clone(),
            collaborators.roles,
            config.eviction_flush,
            shutdown.token(),
        );
        Self {
            router: BroadcastRouter::new(registry.clone()),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            sync: SyncResponder::new(registry.clone(), collaborators.conversations),
            stats: StatsReporter::new(registry.clone(), shutdown.token()),
            messages: collaborators.messages,
            coordinator,
            shutdown,
            registry,
            config,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// Runtime configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The registry.
    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Room fan-out.
    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    /// Inbound admission control.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Snapshot builder.
    pub fn sync(&self) -> &SyncResponder {
        &self.sync
    }

    /// Message collaborator.
    pub fn messages(&self) -> &Arc<dyn MessageSink> {
        &self.messages
    }

    /// Drain coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Whether a new upgrade would stay within `max_connections`.
    pub fn has_capacity(&self) -> bool {
        self.registry.connection_count() < self.config.max_connections
    }

    /// Whether a drain has started.
    pub fn is_draining(&self) -> bool {
        self.shutdown.is_draining()
    }

    /// Track a new transport connection.
    ///
    /// Returns the connection and the receiver its writer task drains.
    pub fn open_connection(
        &self,
    ) -> Result<(Arc<ClientConnection>, OutboundReceiver), SessionError> {
        if self.is_draining() {
            return Err(SessionError::ShuttingDown);
        }
        let (tx, rx) = mpsc::channel(self.config.send_queue_capacity);
        let conn = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
        self.registry.attach(conn.clone());

        // a drain that started after the first check has already taken its
        // snapshot and would not notify this connection
        if self.is_draining() {
            let _ = self.registry.release(&conn.id);
            return Err(SessionError::ShuttingDown);
        }
        // upgrades that raced past the handler's capacity check
        if self.registry.connection_count() > self.config.max_connections {
            let _ = self.registry.release(&conn.id);
            warn!(
                max = self.config.max_connections,
                "connection limit reached, refusing"
            );
            return Err(SessionError::ConnectionLimit);
        }

        counter!(WS_CONNECTIONS_TOTAL).increment(1);
        self.update_active_gauge();
        info!(conn_id = %conn.id, "client connected");
        Ok((conn, rx))
    }

    /// Authenticate `conn` with `credential` and reply on it.
    ///
    /// Success sends `authenticated`, then the initial `state-synced` the
    /// first time the connection takes on its identity. A fatal failure on a
    /// connection with no identity sends `connect-error` and closes it; any
    /// other failure is reported as an `error` event.
    pub async fn authenticate(
        &self,
        conn: &Arc<ClientConnection>,
        credential: Option<&str>,
    ) -> Result<Identity, SessionError> {
        match self.coordinator.authenticate(conn, credential).await {
            Ok(auth) => {
                let _ = conn.send_event(&ServerEvent::new(
                    outbound::AUTHENTICATED,
                    json!({
                        "userId": auth.identity.user_id,
                        "email": auth.identity.email,
                        "role": auth.identity.role,
                    }),
                ));
                if auth.newly_registered {
                    self.initial_sync(conn, &auth.identity).await;
                }
                Ok(auth.identity)
            }
            Err(err) => {
                counter!(AUTH_FAILURES_TOTAL, "code" => err.code()).increment(1);
                if err.is_fatal() && conn.identity().is_none() {
                    SessionCoordinator::reject(conn, &err);
                } else {
                    let _ = conn.send_event(&ServerEvent::error(&ErrorBody {
                        error: err.code().to_owned(),
                        event_type: Some(inbound::AUTHENTICATE.to_owned()),
                        message: Some(err.to_string()),
                    }));
                }
                Err(err)
            }
        }
    }

    async fn initial_sync(&self, conn: &ClientConnection, identity: &Identity) {
        match self.sync.snapshot(identity, None, SyncOrigin::Initial).await {
            Ok(snapshot) => {
                let _ = conn.send_event(&ServerEvent::state_synced(&snapshot));
            }
            Err(err) => {
                warn!(conn_id = %conn.id, error = %err, "initial sync failed");
                let _ = conn.send_event(&ServerEvent::error(&err.to_body(Some(inbound::AUTHENTICATE))));
            }
        }
    }

    /// Release everything tied to `conn`. Called once by its transport task
    /// when the transport is gone, whatever the cause.
    pub fn release(&self, conn: &ClientConnection) -> Option<ReleaseReport> {
        let report = self.registry.release(&conn.id);
        counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
        histogram!(WS_CONNECTION_DURATION_SECONDS).record(conn.age().as_secs_f64());
        self.update_active_gauge();
        info!(
            conn_id = %conn.id,
            reason = ?conn.close_reason(),
            dropped = conn.drop_count(),
            "client disconnected"
        );
        report
    }

    /// Drain every connection; see [`ShutdownCoordinator::drain`].
    pub async fn drain(&self, reason: &str) -> Option<DrainReport> {
        let report = self.shutdown.drain(reason).await;
        self.update_active_gauge();
        report
    }

    /// Current stats snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.stats()
    }

    #[allow(clippy::cast_precision_loss)]
    fn update_active_gauge(&self) {
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.registry.connection_count() as f64);
    }
}
