//! # warden-settings
//!
//! Configuration for the Warden arbiter, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`WardenSettings::default()`]
//! 2. **User file**: `~/.warden/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `WARDEN_*` overrides (highest priority)
//!
//! Settings only size timeouts, storage, and hosting. Which capabilities
//! exist and which scopes they require is decided by the capability table
//! the host registers, not by configuration.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, load_settings, load_settings_from_path, permission_db_path, settings_path,
    warden_home,
};
pub use types::*;
