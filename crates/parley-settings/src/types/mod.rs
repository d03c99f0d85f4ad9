//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement [`Default`]
//! with production values. `#[serde(default)]` lets a settings file name only
//! the fields it changes.

mod runtime;

pub use runtime::*;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "session": { "inputAckTimeoutMs": 5000 },
///   "logging": { "level": "debug", "json": false }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParleySettings {
    /// Settings schema version.
    pub version: String,
    /// Message bus sizing.
    pub bus: BusSettings,
    /// Orchestrator timeouts and bookkeeping limits.
    pub session: SessionSettings,
    /// Agent worker behavior.
    pub agent: AgentSettings,
    /// Conversation memory.
    pub memory: MemorySettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for ParleySettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            bus: BusSettings::default(),
            session: SessionSettings::default(),
            agent: AgentSettings::default(),
            memory: MemorySettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Base level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// JSON lines when true, human-readable output otherwise.
    pub json: bool,
    /// Per-module level overrides, e.g. `{"parley_bus": "debug"}`.
    pub module_levels: HashMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
            module_levels: HashMap::new(),
        }
    }
}
