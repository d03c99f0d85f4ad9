//! # parley-settings
//!
//! Layered configuration for the runtime.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** via [`ParleySettings::default()`]
//! 2. **Settings file**, `~/.parley/settings.json` or an explicit path, deep-merged over defaults
//! 3. **Environment variables**, `PARLEY_*` overrides (highest priority)
//!
//! There is no process-wide instance. The binary loads settings once and
//! hands the relevant sections to the bus, orchestrator and agents.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
