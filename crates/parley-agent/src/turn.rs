//! Per-turn input, context and output channel.
//!
//! A turn produces zero or more `Delta` chunks numbered from 0 followed by
//! exactly one `Final`, or ends with an error. Nothing follows a `Final`.

use std::sync::Arc;

use parley_core::{AgentId, Message, Payload, PersonaMatrix, SessionId, TurnTag};
use parley_memory::{AgentMemory, MemoryItem};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

/// Context handed over from a previous agent after a confirmed handover.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverContext {
    #[serde(default)]
    pub from_agent: String,
    #[serde(default)]
    pub prev_output: String,
    #[serde(default)]
    pub reason: String,
}

impl HandoverContext {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            from_agent: msg.payload.get_str("from_agent").unwrap_or_default().to_owned(),
            prev_output: msg.payload.get_str("prev_output").unwrap_or_default().to_owned(),
            reason: msg.payload.get_str("reason").unwrap_or_default().to_owned(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TurnInput {
    pub text: String,
    pub payload: Payload,
    pub tag: TurnTag,
    pub handover: Option<HandoverContext>,
}

impl TurnInput {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            payload: Payload::Text(text.clone()),
            text,
            tag: TurnTag::none(),
            handover: None,
        }
    }

    pub fn from_message(msg: &Message) -> Self {
        let text = match msg.payload.get_str("text") {
            Some(text) => text.to_owned(),
            None => msg.payload.to_text_lossy(),
        };
        Self {
            text,
            payload: msg.payload.clone(),
            tag: TurnTag::of(msg),
            handover: None,
        }
    }

    pub fn with_tag(mut self, tag: TurnTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_handover(mut self, handover: Option<HandoverContext>) -> Self {
        self.handover = handover;
        self
    }
}

/// What the behavior knows about the agent for this turn.
#[derive(Clone, Debug)]
pub struct TurnContext {
    pub agent_id: AgentId,
    pub session_id: Option<SessionId>,
    pub persona: Arc<PersonaMatrix>,
    pub system_prompt: String,
    /// Memory of the persona's scope; `None` when the session keeps none.
    pub memory: Option<AgentMemory>,
}

impl TurnContext {
    pub fn memory_scope_id(&self) -> &str {
        &self.persona.memory_scope_id
    }

    /// Long-term facts of the scope plus the newest short-term items the
    /// agent can see, oldest first.
    pub fn recall(&self) -> Vec<MemoryItem> {
        self.memory
            .as_ref()
            .map(AgentMemory::recall)
            .unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnChunk {
    Delta { seq: u64, text: String },
    Final { text: String },
}

pub type TurnItem = Result<TurnChunk, AgentError>;

/// Write side of a turn. Numbers deltas and stops accepting them once the
/// turn is canceled or the reader goes away.
pub struct TurnSink {
    tx: mpsc::Sender<TurnItem>,
    cancel: CancellationToken,
    streaming: bool,
    seq: u64,
    text: String,
}

impl TurnSink {
    pub(crate) fn new(
        tx: mpsc::Sender<TurnItem>,
        cancel: CancellationToken,
        streaming: bool,
    ) -> Self {
        Self {
            tx,
            cancel,
            streaming,
            seq: 0,
            text: String::new(),
        }
    }

    /// Emits one delta. Non-streaming sinks only accumulate.
    pub async fn send(&mut self, delta: impl Into<String>) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Canceled);
        }
        let delta = delta.into();
        self.text.push_str(&delta);
        if !self.streaming {
            return Ok(());
        }
        let seq = self.seq;
        self.seq += 1;
        self.tx
            .send(Ok(TurnChunk::Delta { seq, text: delta }))
            .await
            .map_err(|_| AgentError::Canceled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn chunks_sent(&self) -> u64 {
        self.seq
    }

    /// Everything sent so far, concatenated.
    pub fn text(&self) -> &str {
        &self.text
    }
}
