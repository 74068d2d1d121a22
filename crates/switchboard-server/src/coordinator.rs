//! Session Coordinator: one live connection per identity.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use switchboard_auth::CredentialValidator;
use switchboard_core::Identity;
use switchboard_core::protocol::{NEW_SESSION_DETECTED, ServerEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::RoleDirectory;
use crate::errors::SessionError;
use crate::metrics::SESSIONS_SUPERSEDED_TOTAL;
use crate::registry::ResourceRegistry;
use crate::websocket::connection::{ClientConnection, CloseReason};

/// Result of a successful [`SessionCoordinator::authenticate`].
#[derive(Clone, Debug)]
pub struct Authenticated {
    /// Identity now attached to the connection.
    pub identity: Identity,
    /// `false` when the connection already held this identity.
    pub newly_registered: bool,
    /// Whether an older connection was superseded.
    pub superseded_previous: bool,
}

/// Validates credentials and swaps session holders.
pub struct SessionCoordinator {
    validator: Arc<CredentialValidator>,
    registry: Arc<ResourceRegistry>,
    roles: Arc<dyn RoleDirectory>,
    eviction_flush: Duration,
    draining: CancellationToken,
}

impl SessionCoordinator {
    /// Build a coordinator. Authentication is refused once `draining` is
    /// cancelled.
    pub fn new(
        validator: Arc<CredentialValidator>,
        registry: Arc<ResourceRegistry>,
        roles: Arc<dyn RoleDirectory>,
        eviction_flush: Duration,
        draining: CancellationToken,
    ) -> Self {
        Self {
            validator,
            registry,
            roles,
            eviction_flush,
            draining,
        }
    }

    /// Validate `credential` and make `conn` the session holder for the
    /// identity it names.
    ///
    /// Any previous holder gets `sync-required {reason: new_session_detected}`,
    /// loses its room memberships at once and is closed after the eviction
    /// flush window. The holder swap itself is one atomic registry update.
    pub async fn authenticate(
        &self,
        conn: &Arc<ClientConnection>,
        credential: Option<&str>,
    ) -> Result<Authenticated, SessionError> {
        if self.draining.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }
        let verified = self.validator.verify(credential, Utc::now())?;
        let mut identity = verified.identity;

        if let Some(current) = conn.identity() {
            if current.same_principal(&identity) {
                return Ok(Authenticated {
                    identity: current.clone(),
                    newly_registered: false,
                    superseded_previous: false,
                });
            }
            return Err(SessionError::AlreadyAuthenticated);
        }

        if !verified.role_claimed {
            match self.roles.role_of(&identity.user_id).await {
                Ok(Some(role)) => identity.role = role,
                Ok(None) => {}
                Err(e) => {
                    warn!(user_id = %identity.user_id, error = %e, "role lookup failed, using default role");
                }
            }
        }

        // the drain may have started during the role lookup
        if self.draining.is_cancelled() {
            return Err(SessionError::ShuttingDown);
        }

        let previous = self.registry.register(conn, identity.clone())?;
        let superseded_previous = previous.is_some();
        if let Some(previous) = previous {
            self.supersede(&previous, conn);
        }

        info!(conn_id = %conn.id, user_id = %identity.user_id, role = %identity.role, "connection authenticated");
        Ok(Authenticated {
            identity,
            newly_registered: true,
            superseded_previous,
        })
    }

    fn supersede(&self, previous: &Arc<ClientConnection>, replacement: &ClientConnection) {
        counter!(SESSIONS_SUPERSEDED_TOTAL).increment(1);
        let _ = previous.send_event(&ServerEvent::sync_required(NEW_SESSION_DETECTED));
        let rooms = self.registry.leave_all(previous);
        info!(
            old = %previous.id,
            new = %replacement.id,
            rooms = rooms.len(),
            flush_ms = u64::try_from(self.eviction_flush.as_millis()).unwrap_or(u64::MAX),
            "superseding previous connection"
        );

        let target = previous.clone();
        let flush = self.eviction_flush;
        let _ = previous.spawn_listener("supersede", async move {
            tokio::select! {
                () = tokio::time::sleep(flush) => {}
                () = target.closed() => {}
            }
            target.close(CloseReason::Superseded);
            debug!(conn_id = %target.id, "superseded connection closed");
        });
    }

    /// Send `connect-error` and close the transport with the error's code.
    pub fn reject(conn: &ClientConnection, err: &SessionError) {
        let _ = conn.send_event(&ServerEvent::connect_error(&err.reject_body()));
        let reason = match err {
            SessionError::ShuttingDown => CloseReason::Shutdown,
            other => CloseReason::Rejected(other.code()),
        };
        conn.close(reason);
        info!(conn_id = %conn.id, code = err.code(), "connection rejected");
    }
}
