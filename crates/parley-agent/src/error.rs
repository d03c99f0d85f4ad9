use parley_bus::BusError;
use parley_core::{AgentId, ErrorCategory, ErrorCode, HandlerError, PersonaError};

#[derive(Clone, Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent {0} is closed")]
    Closed(AgentId),

    #[error("agent {0} is speaking")]
    SpeakingLocked(AgentId),

    #[error("agent {0} is not active")]
    NotActive(AgentId),

    #[error("agent {0} has not joined a session")]
    NoSession(AgentId),

    #[error("agent {0} has no persona attached")]
    NoPersona(AgentId),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("turn canceled")]
    Canceled,

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("persona error: {0}")]
    Persona(#[from] PersonaError),
}

impl AgentError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidInput(_) => ErrorCategory::Protocol,
            Self::Handler(_) => ErrorCategory::Handler,
            Self::Bus(e) => e.category(),
            Self::Persona(e) => e.category(),
            Self::Closed(_)
            | Self::SpeakingLocked(_)
            | Self::NotActive(_)
            | Self::NoSession(_)
            | Self::NoPersona(_)
            | Self::Canceled => ErrorCategory::AgentLifecycle,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed(_) => "closed",
            Self::SpeakingLocked(_) => "speaking_locked",
            Self::NotActive(_) => "not_active",
            Self::NoSession(_) => "no_session",
            Self::NoPersona(_) => "no_persona",
            Self::InvalidInput(_) => "invalid_input",
            Self::Canceled => "canceled",
            Self::Handler(_) => "handler",
            Self::Bus(e) => e.error_kind(),
            Self::Persona(e) => e.error_kind(),
        }
    }

    /// Code carried by the ERROR message this failure turns into.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Handler(e) => e.code,
            Self::InvalidInput(_) | Self::Persona(_) => ErrorCode::ValidationError,
            _ => ErrorCode::InternalError,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<AgentError> for HandlerError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Handler(e) => e,
            other => HandlerError::new(other.code(), other.to_string()),
        }
    }
}
