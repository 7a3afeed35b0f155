//! # conduit-settings
//!
//! Layered configuration for the Conduit runtime.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`ConduitSettings::default()`]
//! 2. **Settings file**: `~/.conduit/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `CONDUIT_*` overrides (highest priority)
//!
//! There is no process-wide instance. Callers load settings once at startup
//! and pass the value (or the pieces they need) down explicitly.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
