//! # switchboard-settings
//!
//! Layered configuration for the switchboard server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SwitchboardSettings::default()`]
//! 2. **Settings file**: `~/.switchboard/settings.json` or an explicit path
//! 3. **Environment variables**: `SWITCHBOARD_*` overrides
//!
//! The loaded value is passed explicitly to whatever needs it; there is no
//! process-wide settings instance.
//!
//! ```no_run
//! use switchboard_settings::load_settings;
//!
//! let settings = load_settings().unwrap_or_default();
//! println!("listening on port {}", settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
