//! Runtime server configuration.

use std::time::Duration;

use switchboard_settings::{RateLimitSettings, SwitchboardSettings};

/// Duration-typed projection of [`SwitchboardSettings`] used at runtime.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Upgrades beyond this many live connections get HTTP 503.
    pub max_connections: usize,
    /// Interval between server pings.
    pub heartbeat_interval: Duration,
    /// Close a connection after this long without any inbound frame.
    pub heartbeat_timeout: Duration,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue depth.
    pub send_queue_capacity: usize,
    /// Deadline for an unauthenticated connection.
    pub auth_timeout: Duration,
    /// Flush window granted to a superseded connection.
    pub eviction_flush: Duration,
    /// Wait after `server-shutdown` before forcing connections closed.
    pub grace_period: Duration,
    /// Wait for close frames to flush before releasing stragglers.
    pub close_flush: Duration,
    /// Per-event-class admission rules.
    pub rate_limits: RateLimitSettings,
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &SwitchboardSettings) -> Self {
        let s = &settings.server;
        Self {
            host: s.host.clone(),
            port: s.port,
            max_connections: s.max_connections,
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(s.heartbeat_timeout_ms),
            max_message_size: s.max_message_size,
            send_queue_capacity: s.send_queue_capacity.max(1),
            auth_timeout: Duration::from_millis(s.auth_timeout_ms),
            eviction_flush: Duration::from_millis(settings.sessions.eviction_flush_ms),
            grace_period: Duration::from_millis(settings.shutdown.grace_period_ms),
            close_flush: Duration::from_millis(settings.shutdown.close_flush_ms),
            rate_limits: settings.rate_limits.clone(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut config = Self::from_settings(&SwitchboardSettings::default());
        config.port = 0;
        config
    }
}
