use parley_core::{ErrorCategory, MessageId, SessionId};

/// Rejections returned synchronously to the publisher.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("message for session {got} published on bus for session {expected}")]
    SessionMismatch { expected: SessionId, got: SessionId },

    #[error("message {message_id} targets AGENT without a target_id")]
    MissingTargetId { message_id: MessageId },

    #[error("bus for session {0} is closed")]
    Closed(SessionId),
}

impl BusError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SessionMismatch { .. } | Self::MissingTargetId { .. } => ErrorCategory::Protocol,
            Self::Closed(_) => ErrorCategory::AgentLifecycle,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SessionMismatch { .. } => "session_mismatch",
            Self::MissingTargetId { .. } => "missing_target_id",
            Self::Closed(_) => "bus_closed",
        }
    }
}
