use std::fmt;
use std::time::Duration;

use parley_agent::AgentError;
use parley_bus::BusError;
use parley_core::{AgentId, ErrorCategory, ErrorCode, HandlerError, SessionId};

/// Which acknowledgement a timed-out wait was for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckKind {
    Input,
    Cancel,
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "INPUT_ACK",
            Self::Cancel => "CANCEL_ACK",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no agent available to take the input")]
    NoRoutableAgent,

    #[error("agent {0} is not part of this session")]
    UnknownAgent(AgentId),

    #[error("agent {agent_id} did not send {kind} within {timeout:?}")]
    AckTimeout {
        kind: AckKind,
        agent_id: AgentId,
        timeout: Duration,
    },

    #[error("agent {claimant} produced output while {holder} is speaking")]
    SpeakingConflict { holder: AgentId, claimant: AgentId },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoRoutableAgent | Self::UnknownAgent(_) | Self::SessionNotFound(_) => {
                ErrorCategory::Routing
            }
            Self::AckTimeout { .. } => ErrorCategory::AckTimeout,
            Self::SpeakingConflict { .. } => ErrorCategory::ConcurrencyViolation,
            Self::InvalidRequest(_) => ErrorCategory::Protocol,
            Self::Bus(e) => e.category(),
            Self::Agent(e) => e.category(),
        }
    }

    /// Code carried by the ERROR sent to the frontend.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoRoutableAgent
            | Self::UnknownAgent(_)
            | Self::InvalidRequest(_)
            | Self::SessionNotFound(_) => ErrorCode::ValidationError,
            Self::AckTimeout {
                kind: AckKind::Input,
                ..
            } => ErrorCode::RouteTimeout,
            Self::AckTimeout {
                kind: AckKind::Cancel,
                ..
            } => ErrorCode::CancelTimeout,
            Self::SpeakingConflict { .. } => ErrorCode::SpeakingConflict,
            Self::Bus(_) => ErrorCode::InternalError,
            Self::Agent(e) => e.code(),
        }
    }
}

impl From<SessionError> for HandlerError {
    fn from(err: SessionError) -> Self {
        HandlerError::new(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_codes() {
        let input = SessionError::AckTimeout {
            kind: AckKind::Input,
            agent_id: AgentId::from_raw("alpha"),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(input.code(), ErrorCode::RouteTimeout);
        assert_eq!(input.category(), ErrorCategory::AckTimeout);
        assert_eq!(input.to_string(), "agent alpha did not send INPUT_ACK within 2s");

        let cancel = SessionError::AckTimeout {
            kind: AckKind::Cancel,
            agent_id: AgentId::from_raw("alpha"),
            timeout: Duration::from_secs(2),
        };
        assert_eq!(cancel.code(), ErrorCode::CancelTimeout);
    }

    #[test]
    fn conflict_is_concurrency_violation() {
        let err = SessionError::SpeakingConflict {
            holder: AgentId::from_raw("a"),
            claimant: AgentId::from_raw("b"),
        };
        assert_eq!(err.category(), ErrorCategory::ConcurrencyViolation);
        assert_eq!(err.code(), ErrorCode::SpeakingConflict);
        let handler: HandlerError = err.into();
        assert_eq!(handler.code, ErrorCode::SpeakingConflict);
    }

    #[test]
    fn routing_failures_are_validation_errors() {
        assert_eq!(SessionError::NoRoutableAgent.code(), ErrorCode::ValidationError);
        assert_eq!(
            SessionError::UnknownAgent(AgentId::from_raw("x")).category(),
            ErrorCategory::Routing
        );
    }
}
