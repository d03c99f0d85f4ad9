use std::sync::Arc;

use async_trait::async_trait;
use parley_bus::{MessageBus, OnMessage};
use parley_core::{AgentId, SessionId};

use crate::error::AgentError;

/// What the orchestrator needs from a registered agent.
#[async_trait]
pub trait SessionMember: OnMessage {
    fn agent_id(&self) -> &AgentId;

    /// Binds the member to a session and its bus. Members start active.
    fn join_session(&self, session_id: SessionId, bus: Arc<MessageBus>) -> Result<(), AgentError>;

    /// Unbinds and drops active/speaking.
    fn leave_session(&self);

    /// Stops any in-flight output and clears the speaking flag.
    fn release_speaking(&self);

    fn into_handler(self: Arc<Self>) -> Arc<dyn OnMessage>;

    async fn close(&self);
}
