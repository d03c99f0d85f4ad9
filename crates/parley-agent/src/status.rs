use std::time::Duration;

use parley_core::{AgentId, SessionId};
use serde::Serialize;

use crate::heartbeat::HeartbeatStats;
use crate::state::{CognitiveState, RunState};

/// Call counters kept under the agent's metrics lock.
#[derive(Clone, Debug, Default)]
pub(crate) struct CallMetrics {
    pub total_calls: u64,
    pub total_errors: u64,
    pub total_latency: Duration,
}

impl CallMetrics {
    pub fn record(&mut self, elapsed: Duration, failed: bool) {
        self.total_calls += 1;
        self.total_latency += elapsed;
        if failed {
            self.total_errors += 1;
        }
    }

    pub fn snapshot(&self) -> CallStats {
        CallStats {
            total_calls: self.total_calls,
            total_errors: self.total_errors,
            total_latency_ms: self.total_latency.as_millis() as u64,
            avg_latency_ms: (self.total_calls > 0)
                .then(|| self.total_latency.as_secs_f64() * 1000.0 / self.total_calls as f64),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CallStats {
    pub total_calls: u64,
    pub total_errors: u64,
    pub total_latency_ms: u64,
    pub avg_latency_ms: Option<f64>,
}

impl CallStats {
    pub fn error_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.total_errors as f64 / self.total_calls as f64
        }
    }
}

/// Point-in-time view of an agent, safe to serialize onto the bus.
#[derive(Clone, Debug, Serialize)]
pub struct AgentStatus {
    pub agent_id: AgentId,
    pub session_id: Option<SessionId>,
    pub run_state: RunState,
    pub cognitive_state: CognitiveState,
    pub active: bool,
    pub speaking: bool,
    pub initialized: bool,
    pub persona_id: Option<String>,
    pub memory_scope_id: Option<String>,
    pub calls: CallStats,
    pub heartbeat: HeartbeatStats,
    pub alive: bool,
    pub health_score: u8,
}

pub(crate) struct HealthInputs<'a> {
    pub run_state: RunState,
    pub alive: bool,
    pub initialized: bool,
    pub calls: &'a CallStats,
    pub slow_call_threshold: Duration,
}

/// 0..=100. Closed agents score 0.
pub(crate) fn health_score(inputs: &HealthInputs<'_>) -> u8 {
    if inputs.run_state == RunState::Closed {
        return 0;
    }
    let mut score: i32 = 100;
    if inputs.run_state == RunState::Error {
        score -= 30;
    }
    if !inputs.alive {
        score -= 30;
    }
    let error_rate = inputs.calls.error_rate();
    if error_rate > 0.2 {
        score -= 30;
    } else if error_rate > 0.1 {
        score -= 15;
    }
    let slow_ms = inputs.slow_call_threshold.as_secs_f64() * 1000.0;
    if inputs.calls.avg_latency_ms.is_some_and(|avg| avg > slow_ms) {
        score -= 10;
    }
    if !inputs.initialized {
        score -= 10;
    }
    score.clamp(0, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calls(total: u64, errors: u64, avg_ms: f64) -> CallStats {
        CallStats {
            total_calls: total,
            total_errors: errors,
            total_latency_ms: (avg_ms * total as f64) as u64,
            avg_latency_ms: (total > 0).then_some(avg_ms),
        }
    }

    fn score(run_state: RunState, alive: bool, initialized: bool, calls: &CallStats) -> u8 {
        health_score(&HealthInputs {
            run_state,
            alive,
            initialized,
            calls,
            slow_call_threshold: Duration::from_secs(10),
        })
    }

    #[test]
    fn healthy_agent_scores_full() {
        assert_eq!(score(RunState::Idle, true, true, &calls(10, 0, 50.0)), 100);
    }

    #[test]
    fn penalties_stack() {
        assert_eq!(score(RunState::Idle, true, false, &CallStats::default()), 90);
        assert_eq!(score(RunState::Error, true, true, &calls(10, 1, 50.0)), 70);
        assert_eq!(score(RunState::Idle, true, true, &calls(10, 2, 50.0)), 85);
        assert_eq!(score(RunState::Idle, true, true, &calls(10, 3, 50.0)), 70);
        assert_eq!(score(RunState::Idle, true, true, &calls(10, 0, 20_000.0)), 90);
        assert_eq!(score(RunState::Error, false, false, &calls(10, 9, 20_000.0)), 0);
    }

    #[test]
    fn closed_scores_zero() {
        assert_eq!(score(RunState::Closed, true, true, &calls(10, 0, 1.0)), 0);
    }

    #[test]
    fn call_metrics_average() {
        let mut m = CallMetrics::default();
        m.record(Duration::from_millis(100), false);
        m.record(Duration::from_millis(300), true);
        let s = m.snapshot();
        assert_eq!(s.total_calls, 2);
        assert_eq!(s.total_errors, 1);
        assert_eq!(s.avg_latency_ms, Some(200.0));
        assert_eq!(s.error_rate(), 0.5);
    }
}
