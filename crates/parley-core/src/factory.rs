//! Constructors for every message the runtime publishes.
//!
//! Components never assemble metadata by hand; each function here fixes the
//! event, subtype, stream marker, visibility and default target for one kind
//! of message.

use serde_json::{json, Value};

use crate::errors::ErrorCode;
use crate::ids::{AgentId, SessionId, TraceId, TurnId};
use crate::message::{
    ControlSubtype, Message, MessageEvent, MessageMeta, MessageTarget, Payload, SenderType,
    StreamInfo, Visibility,
};

/// Output subtype for plain-text agent output.
pub const OUTPUT_TEXT: &str = "TEXT";

/// Trace/turn correlation carried from one message to the next.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TurnTag {
    pub trace_id: Option<TraceId>,
    pub turn_id: Option<TurnId>,
}

impl TurnTag {
    pub fn new(trace_id: TraceId, turn_id: TurnId) -> Self {
        Self {
            trace_id: Some(trace_id),
            turn_id: Some(turn_id),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn of(msg: &Message) -> Self {
        Self {
            trace_id: msg.metadata.trace_id.clone(),
            turn_id: msg.metadata.turn_id.clone(),
        }
    }

    fn apply(&self, meta: MessageMeta) -> MessageMeta {
        meta.trace(self.trace_id.clone()).turn(self.turn_id.clone())
    }
}

/// User text from the frontend, addressed to the orchestrator.
pub fn user_input(
    session_id: SessionId,
    user_id: impl Into<String>,
    payload: impl Into<Payload>,
) -> Message {
    let meta = MessageMeta::new(MessageEvent::UserInput)
        .persist(true)
        .origin("frontend");
    Message::new(
        session_id,
        user_id,
        SenderType::User,
        MessageTarget::System,
        payload,
        meta,
    )
}

/// One numbered streaming chunk. Goes to SESSION, never straight to the frontend.
pub fn agent_chunk(
    session_id: SessionId,
    agent_id: &AgentId,
    text: impl Into<String>,
    seq: u64,
    tag: &TurnTag,
) -> Message {
    let meta = tag.apply(
        MessageMeta::new(MessageEvent::AgentOutput)
            .subtype(OUTPUT_TEXT)
            .stream(StreamInfo::chunk(seq))
            .visibility(Visibility::Internal)
            .origin("agent"),
    );
    Message::new(
        session_id,
        agent_id.as_str(),
        SenderType::Agent,
        MessageTarget::Session,
        text.into(),
        meta,
    )
}

/// Terminal output of a turn. Persisted by default.
pub fn agent_final(
    session_id: SessionId,
    agent_id: &AgentId,
    payload: impl Into<Payload>,
    tag: &TurnTag,
) -> Message {
    let meta = tag.apply(
        MessageMeta::new(MessageEvent::AgentOutput)
            .subtype(OUTPUT_TEXT)
            .stream(StreamInfo::final_marker())
            .visibility(Visibility::Internal)
            .persist(true)
            .origin("agent"),
    );
    Message::new(
        session_id,
        agent_id.as_str(),
        SenderType::Agent,
        MessageTarget::Session,
        payload,
        meta,
    )
}

pub fn control(
    session_id: SessionId,
    sender_id: impl Into<String>,
    sender_type: SenderType,
    subtype: ControlSubtype,
    payload: impl Into<Payload>,
    target: MessageTarget,
    tag: &TurnTag,
) -> Message {
    let meta = tag.apply(
        MessageMeta::new(MessageEvent::Control)
            .subtype(subtype.as_str())
            .visibility(Visibility::Internal),
    );
    Message::new(session_id, sender_id, sender_type, target, payload, meta)
}

pub fn handover_request(
    session_id: SessionId,
    from_agent: &AgentId,
    reason: &str,
    to_agent: Option<&AgentId>,
    next_persona_id: Option<&str>,
    tag: &TurnTag,
) -> Message {
    let mut payload = serde_json::Map::new();
    payload.insert("from_agent".into(), json!(from_agent));
    payload.insert("reason".into(), json!(reason));
    if let Some(to) = to_agent {
        payload.insert("to_agent".into(), json!(to));
    }
    if let Some(persona) = next_persona_id {
        payload.insert("next_persona_id".into(), json!(persona));
    }
    control(
        session_id,
        from_agent.as_str(),
        SenderType::Agent,
        ControlSubtype::HandoverRequest,
        payload,
        MessageTarget::Session,
        tag,
    )
}

fn ack(
    session_id: SessionId,
    agent_id: &AgentId,
    subtype: ControlSubtype,
    tag: &TurnTag,
) -> Message {
    control(
        session_id,
        agent_id.as_str(),
        SenderType::Control,
        subtype,
        json!({"ok": true}),
        MessageTarget::Session,
        tag,
    )
}

/// Receipt of a directed USER_INPUT. Must precede any output for the turn.
pub fn input_ack(session_id: SessionId, agent_id: &AgentId, tag: &TurnTag) -> Message {
    ack(session_id, agent_id, ControlSubtype::InputAck, tag)
}

pub fn cancel_ack(session_id: SessionId, agent_id: &AgentId, tag: &TurnTag) -> Message {
    ack(session_id, agent_id, ControlSubtype::CancelAck, tag)
}

pub fn tool_call(
    session_id: SessionId,
    agent_id: &AgentId,
    name: &str,
    arguments: Value,
    tag: &TurnTag,
) -> Message {
    let meta = tag.apply(
        MessageMeta::new(MessageEvent::ToolCall)
            .subtype(name)
            .visibility(Visibility::Internal)
            .origin("agent"),
    );
    Message::new(
        session_id,
        agent_id.as_str(),
        SenderType::Agent,
        MessageTarget::System,
        json!({"name": name, "arguments": arguments}),
        meta,
    )
}

pub fn tool_result(
    session_id: SessionId,
    sender_id: impl Into<String>,
    name: &str,
    result: Value,
    target: MessageTarget,
    tag: &TurnTag,
) -> Message {
    let meta = tag.apply(
        MessageMeta::new(MessageEvent::ToolResult)
            .subtype(name)
            .visibility(Visibility::Internal),
    );
    Message::new(
        session_id,
        sender_id,
        SenderType::Event,
        target,
        json!({"name": name, "result": result}),
        meta,
    )
}

/// ERROR with `{code, message}` payload and the code as subtype.
pub fn error(
    session_id: SessionId,
    sender_id: impl Into<String>,
    code: ErrorCode,
    message: impl Into<String>,
    target: MessageTarget,
    tag: &TurnTag,
) -> Message {
    let message = message.into();
    let meta = tag.apply(MessageMeta::new(MessageEvent::Error).subtype(code.as_str()));
    Message::new(
        session_id,
        sender_id,
        SenderType::System,
        target,
        json!({"code": code.as_str(), "message": message}),
        meta,
    )
}

/// Observation/notification. Defaults to the logger.
pub fn event(
    session_id: SessionId,
    sender_id: impl Into<String>,
    name: &str,
    payload: impl Into<Payload>,
    tag: &TurnTag,
) -> Message {
    let meta = tag.apply(MessageMeta::new(MessageEvent::Event).subtype(name));
    Message::new(
        session_id,
        sender_id,
        SenderType::Event,
        MessageTarget::Logger,
        payload,
        meta,
    )
}
