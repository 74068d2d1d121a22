//! # switchboard-core
//!
//! Foundation types shared by every switchboard crate:
//!
//! - **Branded IDs**: [`ConnectionId`], [`RoomId`] as newtypes for type safety
//! - **Identity**: the authenticated principal ([`Identity`], [`Role`])
//! - **Errors**: machine-readable wire codes ([`errors`])
//! - **Protocol**: named event frames exchanged over the transport ([`protocol`])
//! - **Logging**: `tracing` subscriber initialisation ([`logging`])

#![deny(unsafe_code)]

pub mod errors;
pub mod identity;
pub mod ids;
pub mod logging;
pub mod protocol;

pub use identity::{Identity, Role};
pub use ids::{ConnectionId, RoomId};
