//! Bus, session, agent and memory runtime settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Message bus settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// Bounded queue size. Publishers wait once it is full.
    pub queue_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
        }
    }
}

/// Orchestrator settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// How long a routed turn may wait for INPUT_ACK.
    pub input_ack_timeout_ms: u64,
    /// How long a cancel may wait for CANCEL_ACK.
    pub cancel_ack_timeout_ms: u64,
    /// Inflight turns kept before the oldest are pruned.
    pub max_inflight_history: usize,
}

impl SessionSettings {
    pub fn input_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.input_ack_timeout_ms)
    }

    pub fn cancel_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_ack_timeout_ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            input_ack_timeout_ms: 2_000,
            cancel_ack_timeout_ms: 2_000,
            max_inflight_history: 2_000,
        }
    }
}

/// Agent worker settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Expected heartbeat period. Gaps beyond 1.5x count as missed.
    pub heartbeat_interval_ms: u64,
    /// Per-turn chunk channel capacity.
    pub chunk_buffer: usize,
    /// Average latency above this lowers the health score.
    pub slow_call_threshold_ms: u64,
}

impl AgentSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 60_000,
            chunk_buffer: 64,
            slow_call_threshold_ms: 10_000,
        }
    }
}

/// Conversation memory settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemorySettings {
    /// One `<session_id>.json` file per session lives here. Memory is
    /// process-local when unset.
    pub dir: Option<PathBuf>,
    /// Write a session's memory out when the session closes.
    pub auto_flush: bool,
    /// Short-term items a session may hold before the newest are promoted.
    pub promote_threshold: usize,
    /// How many of the newest short-term items one promotion moves.
    pub promote_count: usize,
    /// Short-term items handed to a behavior at the start of a turn.
    pub recall_short_term: usize,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            dir: None,
            auto_flush: true,
            promote_threshold: 20,
            promote_count: 5,
            recall_short_term: 10,
        }
    }
}
