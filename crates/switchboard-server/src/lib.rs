//! # switchboard-server
//!
//! Real-time connection and session manager behind an Axum WebSocket
//! endpoint.
//!
//! - [`registry::ResourceRegistry`]: sole owner of the identity, room and
//!   connection maps; `release` is the single cleanup entry point
//! - [`coordinator::SessionCoordinator`]: one live connection per identity,
//!   superseding older connections after a bounded flush window
//! - [`websocket::broadcast::BroadcastRouter`]: room fan-out preserving each
//!   sender's order
//! - [`rate_limit::RateLimiter`]: fixed-window admission per connection and
//!   event class
//! - [`sync::SyncResponder`]: `state-synced` snapshots with correlation ids
//! - [`shutdown::ShutdownCoordinator`]: idempotent drain
//! - [`stats::StatsReporter`]: read-only aggregation
//! - [`manager::ConnectionManager`] wires them together; [`server::SwitchboardServer`]
//!   serves `/ws`, `/health`, `/stats` and `/metrics`

#![deny(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod directory;
pub mod errors;
pub mod health;
pub mod manager;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod stats;
pub mod sync;
pub mod websocket;

pub use config::ServerConfig;
pub use directory::{Collaborators, ConversationStore, InMemoryDirectory, MessageSink, RoleDirectory};
pub use manager::ConnectionManager;
pub use server::SwitchboardServer;
