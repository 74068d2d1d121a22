//! Graceful drain of the connection pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use switchboard_core::protocol::{ServerEvent, ShutdownNotice, rfc3339_millis};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::DRAINS_TOTAL;
use crate::registry::ResourceRegistry;
use crate::websocket::connection::CloseReason;

/// Text of the `server-shutdown` notice.
pub const SHUTDOWN_MESSAGE: &str = "Server is shutting down";

/// What a drain did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainReport {
    /// Reason passed to [`ShutdownCoordinator::drain`].
    pub reason: String,
    /// Connections that were sent `server-shutdown`.
    pub notified: usize,
    /// Connections still open after the grace period and closed by force.
    pub closed: usize,
    /// Connections released directly because their transport did not finish
    /// closing within the close-flush window.
    pub force_released: usize,
}

/// Coordinates the drain sequence.
///
/// The cancellation token is shared with the session coordinator (which
/// refuses new authentications) and the HTTP listener (which stops accepting).
pub struct ShutdownCoordinator {
    token: CancellationToken,
    draining: AtomicBool,
    registry: Arc<ResourceRegistry>,
    grace_period: Duration,
    close_flush: Duration,
}

impl ShutdownCoordinator {
    /// Create a coordinator draining `registry`.
    pub fn new(registry: Arc<ResourceRegistry>, grace_period: Duration, close_flush: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            draining: AtomicBool::new(false),
            registry,
            grace_period,
            close_flush,
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether a drain has started.
    pub fn is_draining(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Drain every connection.
    ///
    /// 1. Flip the draining flag (new authentications and upgrades refused)
    /// 2. Send one `server-shutdown` to every connection tracked right now
    /// 3. Wait up to the grace period for clients to disconnect
    /// 4. Close the rest, wait up to the close-flush window for their
    ///    transports, then release whatever is left
    ///
    /// The registry is empty when this returns. A second call returns `None`
    /// at once without notifying anyone.
    pub async fn drain(&self, reason: &str) -> Option<DrainReport> {
        if self.draining.swap(true, Ordering::SeqCst) {
            return None;
        }
        counter!(DRAINS_TOTAL).increment(1);
        self.token.cancel();

        let snapshot = self.registry.connections_snapshot();
        let notice = ServerEvent::server_shutdown(&ShutdownNotice {
            message: SHUTDOWN_MESSAGE.to_owned(),
            timestamp: rfc3339_millis(Utc::now()),
            reason: reason.to_owned(),
        });
        let notified = snapshot.iter().filter(|c| c.send_event(&notice)).count();
        info!(
            reason,
            connections = snapshot.len(),
            notified,
            grace_ms = u64::try_from(self.grace_period.as_millis()).unwrap_or(u64::MAX),
            "drain started"
        );

        let _ = tokio::time::timeout(self.grace_period, self.registry.wait_until_empty()).await;

        let remaining = self.registry.connections_snapshot();
        for conn in &remaining {
            conn.close(CloseReason::Shutdown);
        }
        let closed = remaining.len();

        let mut force_released = 0;
        if tokio::time::timeout(self.close_flush, self.registry.wait_until_empty())
            .await
            .is_err()
        {
            for conn in self.registry.connections_snapshot() {
                if self.registry.release(&conn.id).is_some() {
                    force_released += 1;
                }
            }
            warn!(force_released, "connections released without a clean close");
        }

        info!(reason, notified, closed, force_released, "drain complete");
        Some(DrainReport {
            reason: reason.to_owned(),
            notified,
            closed,
            force_released,
        })
    }

    /// Wait up to `timeout` for `handles` to finish.
    pub async fn await_tasks(handles: Vec<JoinHandle<()>>, timeout: Duration) {
        info!(task_count = handles.len(), timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "waiting for tasks to complete");
        let all = futures::future::join_all(handles);
        if tokio::time::timeout(timeout, all).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, some tasks may still be running");
        }
    }
}
