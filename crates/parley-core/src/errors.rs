use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure classes shared by every crate in the runtime.
/// Each crate-level error maps onto exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Session id mismatch or malformed routing, rejected at publish time.
    Protocol,
    /// No resolvable target agent, or a mention of an unknown agent.
    Routing,
    /// INPUT_ACK or CANCEL_ACK not received in time.
    AckTimeout,
    /// Two agents claiming the speaking right at once.
    ConcurrencyViolation,
    /// Operation on a closed agent, or a state switch while speaking.
    AgentLifecycle,
    /// Uncaught failure inside a message handler.
    Handler,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::Routing => "routing",
            Self::AckTimeout => "ack_timeout",
            Self::ConcurrencyViolation => "concurrency_violation",
            Self::AgentLifecycle => "agent_lifecycle",
            Self::Handler => "handler",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Codes carried in the `subtype` of ERROR messages and in their `{code, message}` payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ModelError,
    ToolError,
    ValidationError,
    InternalError,
    RouteTimeout,
    CancelTimeout,
    SpeakingConflict,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelError => "MODEL_ERROR",
            Self::ToolError => "TOOL_ERROR",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::RouteTimeout => "ROUTE_TIMEOUT",
            Self::CancelTimeout => "CANCEL_TIMEOUT",
            Self::SpeakingConflict => "SPEAKING_CONFLICT",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RouteTimeout | Self::CancelTimeout => ErrorCategory::AckTimeout,
            Self::SpeakingConflict => ErrorCategory::ConcurrencyViolation,
            Self::ValidationError => ErrorCategory::Routing,
            Self::ModelError | Self::ToolError | Self::InternalError => ErrorCategory::Handler,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by an `OnMessage` implementation that could not handle a message.
/// The bus logs it; it never escapes the delivery loop.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}
