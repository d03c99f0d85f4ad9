use std::time::Duration;

use async_trait::async_trait;
use parley_core::AgentId;

use crate::error::AgentError;
use crate::turn::{TurnContext, TurnInput, TurnSink};

/// The generation strategy plugged into an [`crate::Agent`].
///
/// The runtime owns state, locking, metrics and bus traffic. A behavior only
/// turns input into text, pushing deltas through the sink as it goes.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// One-time setup, run under the agent's initialization lock.
    async fn setup(&self, _agent_id: &AgentId) -> Result<(), AgentError> {
        Ok(())
    }

    /// When false, deltas are collapsed into the single final output.
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Produces the turn. `Ok(None)` makes the final output the concatenation
    /// of everything sent through the sink.
    async fn generate(
        &self,
        input: &TurnInput,
        ctx: &TurnContext,
        sink: &mut TurnSink,
    ) -> Result<Option<String>, AgentError>;

    /// Called atomically with persona attach (`Some`) and detach (`None`).
    fn on_memory_scope(&self, _scope: Option<&str>) {}

    async fn teardown(&self, _agent_id: &AgentId) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Replies with the input prefixed by the persona name, one word per delta.
#[derive(Clone, Debug, Default)]
pub struct EchoBehavior {
    chunk_delay: Duration,
    streaming: bool,
}

impl EchoBehavior {
    pub fn new() -> Self {
        Self {
            chunk_delay: Duration::ZERO,
            streaming: true,
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    fn reply(input: &TurnInput, ctx: &TurnContext) -> String {
        match &input.handover {
            Some(h) if !h.from_agent.is_empty() => {
                format!("{} (after {}): {}", ctx.persona.name, h.from_agent, input.text)
            }
            _ => format!("{}: {}", ctx.persona.name, input.text),
        }
    }
}

#[async_trait]
impl AgentBehavior for EchoBehavior {
    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn generate(
        &self,
        input: &TurnInput,
        ctx: &TurnContext,
        sink: &mut TurnSink,
    ) -> Result<Option<String>, AgentError> {
        let reply = Self::reply(input, ctx);
        for word in reply.split_inclusive(' ') {
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            sink.send(word).await?;
        }
        Ok(None)
    }
}
