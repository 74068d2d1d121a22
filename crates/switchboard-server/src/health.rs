//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"`, or `"draining"` once a drain has started.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Tracked WebSocket connections.
    pub connections: usize,
    /// Registered sessions.
    pub active_sessions: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    sessions: usize,
    draining: bool,
) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        active_sessions: sessions,
    }
}
