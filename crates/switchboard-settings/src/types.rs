//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file only needs the keys it overrides.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "auth": { "secret": "..." },
///   "rateLimits": { "typing": { "maxEvents": 3, "windowMs": 1000 } }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchboardSettings {
    /// Listener and transport settings.
    pub server: ServerSettings,
    /// Credential validation settings.
    pub auth: AuthSettings,
    /// Session takeover settings.
    pub sessions: SessionSettings,
    /// Drain settings.
    pub shutdown: ShutdownSettings,
    /// Per-event-class admission rules.
    pub rate_limits: RateLimitSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl SwitchboardSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.secret.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "auth.secret must be set".into(),
            ));
        }
        if !matches!(self.auth.algorithm.as_str(), "HS256" | "HS384" | "HS512") {
            return Err(SettingsError::InvalidValue(format!(
                "auth.algorithm must be HS256, HS384 or HS512 (got {})",
                self.auth.algorithm
            )));
        }
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_ms == 0 || self.server.heartbeat_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs and server.heartbeatTimeoutMs must be at least 1".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueCapacity must be at least 1".into(),
            ));
        }
        for (name, rule) in self.rate_limits.rules() {
            if rule.max_events == 0 || rule.window_ms == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "rateLimits.{name} needs maxEvents >= 1 and windowMs >= 1"
                )));
            }
        }
        Ok(())
    }
}

/// Listener and transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` = auto-assign).
    pub port: u16,
    /// Maximum concurrent live connections.
    pub max_connections: usize,
    /// Interval between server pings in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Close a connection after this long without any inbound frame.
    pub heartbeat_timeout_ms: u64,
    /// Max inbound frame size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue depth.
    pub send_queue_capacity: usize,
    /// How long an unauthenticated connection may stay open.
    pub auth_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            max_connections: 10_000,
            heartbeat_interval_ms: 25_000,
            heartbeat_timeout_ms: 60_000,
            max_message_size: 1024 * 1024,
            send_queue_capacity: 256,
            auth_timeout_ms: 10_000,
        }
    }
}

/// Credential validation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HMAC signing secret shared with the token issuer.
    pub secret: String,
    /// JWT algorithm (`HS256`, `HS384`, `HS512`).
    pub algorithm: String,
    /// Expected `iss` claim, if enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Expected `aud` claim, if enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    /// Clock-skew allowance for `exp`/`nbf` in seconds.
    pub leeway_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            algorithm: "HS256".to_string(),
            issuer: None,
            audience: None,
            leeway_secs: 5,
        }
    }
}

/// Session takeover settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Flush window granted to a superseded connection before it is closed.
    pub eviction_flush_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            eviction_flush_ms: 250,
        }
    }
}

/// Drain settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownSettings {
    /// Wait after the shutdown notice before forcing connections closed.
    pub grace_period_ms: u64,
    /// Wait for close frames to flush before releasing what is left.
    pub close_flush_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            close_flush_ms: 1_000,
        }
    }
}

/// A fixed-window admission rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateRule {
    /// Events admitted per window.
    pub max_events: u32,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl RateRule {
    /// Build a rule.
    pub const fn new(max_events: u32, window_ms: u64) -> Self {
        Self {
            max_events,
            window_ms,
        }
    }
}

/// Per-event-class admission rules.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// `typing` presence events.
    pub typing: RateRule,
    /// `new-message` events.
    pub message: RateRule,
    /// `join-conversation` / `leave-conversation`.
    pub join: RateRule,
    /// `sync-state`.
    pub sync: RateRule,
}

impl RateLimitSettings {
    /// All rules with their settings key.
    pub fn rules(&self) -> [(&'static str, RateRule); 4] {
        [
            ("typing", self.typing),
            ("message", self.message),
            ("join", self.join),
            ("sync", self.sync),
        ]
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            typing: RateRule::new(5, 1_000),
            message: RateRule::new(20, 10_000),
            join: RateRule::new(20, 10_000),
            sync: RateRule::new(5, 10_000),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `tracing` filter directive (e.g. `info`, `switchboard_server=debug`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
