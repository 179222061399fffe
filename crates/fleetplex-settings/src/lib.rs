//! # fleetplex-settings
//!
//! Configuration for the fleetplex broker, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`FleetplexSettings::default()`]
//! 2. **Settings file**: `~/.fleetplex/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `FLEETPLEX_*` overrides

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{FleetplexSettings, LoggingSettings, ServerSettings, SpoolSettings};
