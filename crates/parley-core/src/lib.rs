pub mod errors;
pub mod factory;
pub mod ids;
pub mod message;
pub mod persona;

pub use errors::{ErrorCategory, ErrorCode, HandlerError};
pub use factory::TurnTag;
pub use ids::{AgentId, MemoryId, MessageId, SessionId, TraceId, TurnId};
pub use message::{
    ControlSubtype, Message, MessageEvent, MessageMeta, MessageTarget, Payload, SenderType,
    StreamInfo, Visibility, ROUTED_BY_SESSION,
};
pub use persona::{PersonaError, PersonaMatrix, PersonaStatus, PersonaSwitchPolicy, PromptTemplate};
