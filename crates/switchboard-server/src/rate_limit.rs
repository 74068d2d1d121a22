//! Per-connection, per-event-class admission control.
//!
//! Each (connection, event class) pair owns a fixed-window bucket. Buckets
//! live on the [`ClientConnection`] so they are discarded with it; the
//! limiter itself only holds the rules.

use std::time::{Duration, Instant};

use switchboard_core::protocol::inbound;
use switchboard_settings::{RateLimitSettings, RateRule};

use crate::websocket::connection::ClientConnection;

/// Event classes with independent buckets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `typing`.
    Typing,
    /// `new-message`.
    Message,
    /// `join-conversation`, `leave-conversation`.
    Join,
    /// `sync-state`.
    Sync,
}

impl EventKind {
    /// Class for an inbound event name. `None` for events that are not
    /// rate-limited or not part of the protocol.
    pub fn for_event(event_type: &str) -> Option<Self> {
        match event_type {
            inbound::TYPING => Some(Self::Typing),
            inbound::NEW_MESSAGE => Some(Self::Message),
            inbound::JOIN_CONVERSATION | inbound::LEAVE_CONVERSATION => Some(Self::Join),
            inbound::SYNC_STATE => Some(Self::Sync),
            _ => None,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Typing => "typing",
            Self::Message => "message",
            Self::Join => "join",
            Self::Sync => "sync",
        }
    }
}

/// A fixed-window counter.
#[derive(Clone, Debug)]
pub struct RateBucket {
    count: u32,
    window_start: Instant,
}

impl RateBucket {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn admit(&mut self, rule: RateRule, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= Duration::from_millis(rule.window_ms) {
            self.count = 0;
            self.window_start = now;
        }
        if self.count < rule.max_events {
            self.count += 1;
            true
        } else {
            false
        }
    }
}

/// Admission control over the buckets held by each connection.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    rules: RateLimitSettings,
}

impl RateLimiter {
    /// Limiter enforcing `rules`.
    pub fn new(rules: RateLimitSettings) -> Self {
        Self { rules }
    }

    /// Rule applied to `kind`.
    pub fn rule(&self, kind: EventKind) -> RateRule {
        match kind {
            EventKind::Typing => self.rules.typing,
            EventKind::Message => self.rules.message,
            EventKind::Join => self.rules.join,
            EventKind::Sync => self.rules.sync,
        }
    }

    /// Admit one `kind` event from `conn` now.
    pub fn admit(&self, conn: &ClientConnection, kind: EventKind) -> bool {
        self.admit_at(conn, kind, Instant::now())
    }

    /// Admit one `kind` event from `conn` at `now`.
    ///
    /// A released connection admits nothing.
    pub fn admit_at(&self, conn: &ClientConnection, kind: EventKind, now: Instant) -> bool {
        let rule = self.rule(kind);
        conn.with_bucket(kind, || RateBucket::new(now), |bucket| bucket.admit(rule, now))
            .unwrap_or(false)
    }
}
