//! Stats Reporter: read-only view over the registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::registry::ResourceRegistry;

/// Connection counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Tracked connections, authenticated or not.
    pub total: usize,
    /// Connections with an identity attached.
    pub authenticated: usize,
    /// Authenticated connections per role.
    pub by_role: BTreeMap<String, usize>,
}

/// Room counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStats {
    /// Non-empty rooms.
    pub total: usize,
    /// Sum of memberships across rooms.
    pub memberships: usize,
    /// Members in the largest room.
    pub largest: usize,
}

/// Per-connection resources still held.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    /// Entries in the connection map.
    pub tracked_connections: usize,
    /// Rate buckets across all connections.
    pub rate_buckets: usize,
    /// Listener handles across all connections.
    pub listener_handles: usize,
}

/// Throughput figures.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    /// Accepted connections per second since start.
    pub connections_per_second: f64,
    /// Seconds since the reporter was created.
    pub uptime_secs: u64,
    /// Connections accepted since start.
    pub total_accepted: u64,
}

/// Point-in-time stats snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Connection counts.
    pub connections: ConnectionStats,
    /// Room counts.
    pub rooms: RoomStats,
    /// Registered sessions.
    pub sessions: usize,
    /// Resources held.
    pub memory: MemoryStats,
    /// Throughput.
    pub performance: PerformanceStats,
    /// Whether a drain is in progress.
    pub draining: bool,
}

/// Aggregates registry state without mutating it.
pub struct StatsReporter {
    registry: Arc<ResourceRegistry>,
    started: Instant,
    draining: CancellationToken,
}

impl StatsReporter {
    /// Reporter over `registry`; uptime counts from now.
    pub fn new(registry: Arc<ResourceRegistry>, draining: CancellationToken) -> Self {
        Self {
            registry,
            started: Instant::now(),
            draining,
        }
    }

    /// Take a snapshot. Counts are eventually consistent across shards.
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> StatsSnapshot {
        let mut connections = ConnectionStats::default();
        let mut memory = MemoryStats::default();
        for conn in self.registry.connections_snapshot() {
            connections.total += 1;
            memory.rate_buckets += conn.rate_bucket_count();
            memory.listener_handles += conn.listener_count();
            if let Some(identity) = conn.identity() {
                connections.authenticated += 1;
                *connections
                    .by_role
                    .entry(identity.role.as_str().to_owned())
                    .or_default() += 1;
            }
        }
        memory.tracked_connections = self.registry.connection_count();

        let (memberships, largest) = self.registry.membership_totals();
        let rooms = RoomStats {
            total: self.registry.room_count(),
            memberships,
            largest,
        };

        let elapsed = self.started.elapsed();
        let total_accepted = self.registry.accepted_total();
        let secs = elapsed.as_secs_f64();
        let performance = PerformanceStats {
            connections_per_second: if secs > 0.0 {
                total_accepted as f64 / secs
            } else {
                0.0
            },
            uptime_secs: elapsed.as_secs(),
            total_accepted,
        };

        StatsSnapshot {
            connections,
            rooms,
            sessions: self.registry.session_count(),
            memory,
            performance,
            draining: self.draining.is_cancelled(),
        }
    }
}
