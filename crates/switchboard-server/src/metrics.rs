//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup before
/// any metric is recorded.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// A handle backed by a recorder that is not installed globally.
///
/// Renders nothing; used by tests and embedders that do not export metrics.
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

// Metric name constants.

/// WebSocket connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket connections released (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Outbound frames dropped because a queue was full or closed (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Inbound events by type (counter, labels: `event_type`).
pub const EVENTS_TOTAL: &str = "events_total";
/// Authentication failures (counter, labels: `code`).
pub const AUTH_FAILURES_TOTAL: &str = "auth_failures_total";
/// Sessions replaced by a newer connection for the same identity (counter).
pub const SESSIONS_SUPERSEDED_TOTAL: &str = "sessions_superseded_total";
/// Events refused by the rate limiter (counter, labels: `event_type`).
pub const RATE_LIMITED_TOTAL: &str = "rate_limited_total";
/// Drains started (counter).
pub const DRAINS_TOTAL: &str = "drains_total";
