//! WebSocket transport: connection state, heartbeat, inbound dispatch and
//! room fan-out.

pub mod broadcast;
pub mod connection;
pub mod handler;
pub mod heartbeat;
pub mod session;
