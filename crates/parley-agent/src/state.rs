use serde::{Deserialize, Serialize};

/// Coarse run state of a worker. `Closed` is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Error,
    Closed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Finer-grained substate inside a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CognitiveState {
    #[default]
    None,
    Thinking,
    Processing,
    Planning,
    Reflecting,
    WaitingTool,
    Ready,
    Error,
}

impl CognitiveState {
    /// States in which the agent is producing or about to produce output.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Thinking
                | Self::Processing
                | Self::Planning
                | Self::Reflecting
                | Self::WaitingTool
        )
    }

    pub fn is_active_state(&self) -> bool {
        self.is_running() || matches!(self, Self::Ready)
    }
}
