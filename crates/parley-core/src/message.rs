//! The routed event every component exchanges over the bus.
//!
//! A [`Message`] is immutable once published. The orchestrator never edits a
//! message in place; it builds a new one (see [`Message::forwarded_to_frontend`]).
//!
//! Metadata wire contract (field names are reproduced exactly):
//!
//! - `event`: USER_INPUT | AGENT_OUTPUT | CONTROL | TOOL_CALL | TOOL_RESULT | ERROR | EVENT
//! - `subtype`: control subtype, error code, event name or tool name
//! - `stream`: `{is_chunk, seq, final}`
//! - `persist` (default false), `visibility` (default both), `origin`
//! - `trace_id`, `turn_id`, `routed_by`, `mentioned_agent_id`
//! - anything else is kept in `extra` and flattened on the wire

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{AgentId, MessageId, SessionId, TraceId, TurnId};

/// Value of `routed_by` on everything the orchestrator republishes.
pub const ROUTED_BY_SESSION: &str = "session_runtime";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Agent,
    System,
    Session,
    Control,
    Event,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageTarget {
    Broadcast,
    Agent,
    System,
    Session,
    Frontend,
    Logger,
}

impl MessageTarget {
    /// Subscriber id that receives this target, for the single-owner targets.
    pub fn reserved_subscriber(&self) -> Option<&'static str> {
        match self {
            Self::System => Some("system"),
            Self::Session => Some("session"),
            Self::Frontend => Some("frontend"),
            Self::Logger => Some("logger"),
            Self::Broadcast | Self::Agent => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageEvent {
    UserInput,
    AgentOutput,
    Control,
    ToolCall,
    ToolResult,
    Error,
    /// Observation/notification. Never drives a state machine.
    Event,
}

impl MessageEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserInput => "USER_INPUT",
            Self::AgentOutput => "AGENT_OUTPUT",
            Self::Control => "CONTROL",
            Self::ToolCall => "TOOL_CALL",
            Self::ToolResult => "TOOL_RESULT",
            Self::Error => "ERROR",
            Self::Event => "EVENT",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Frontend,
    Internal,
    #[default]
    Both,
}

/// Streaming position of an AGENT_OUTPUT message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub is_chunk: bool,
    pub seq: Option<u64>,
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl StreamInfo {
    pub fn chunk(seq: u64) -> Self {
        Self {
            is_chunk: true,
            seq: Some(seq),
            is_final: false,
        }
    }

    pub fn final_marker() -> Self {
        Self {
            is_chunk: false,
            seq: None,
            is_final: true,
        }
    }
}

/// CONTROL subtypes. Unknown strings survive as `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ControlSubtype {
    Cancel,
    Interrupt,
    Retry,
    SwitchAgent,
    SetPersona,
    ClearContext,
    HandoverRequest,
    HandoverUiPrompt,
    HandoverConfirm,
    HandoverReject,
    HandoverContext,
    InputAck,
    CancelAck,
    RequestSessionOpen,
    SessionOpened,
    RequestSessionClose,
    SessionClosed,
    InviteAgent,
    RequestAddAgent,
    AddAgentDone,
    AddAgentFailed,
    RemoveAgent,
    RequestRemoveAgent,
    RemoveAgentDone,
    RemoveAgentFailed,
    Other(String),
}

impl ControlSubtype {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Cancel => "CANCEL",
            Self::Interrupt => "INTERRUPT",
            Self::Retry => "RETRY",
            Self::SwitchAgent => "SWITCH_AGENT",
            Self::SetPersona => "SET_PERSONA",
            Self::ClearContext => "CLEAR_CONTEXT",
            Self::HandoverRequest => "HANDOVER_REQUEST",
            Self::HandoverUiPrompt => "HANDOVER_UI_PROMPT",
            Self::HandoverConfirm => "HANDOVER_CONFIRM",
            Self::HandoverReject => "HANDOVER_REJECT",
            Self::HandoverContext => "HANDOVER_CONTEXT",
            Self::InputAck => "INPUT_ACK",
            Self::CancelAck => "CANCEL_ACK",
            Self::RequestSessionOpen => "REQUEST_SESSION_OPEN",
            Self::SessionOpened => "SESSION_OPENED",
            Self::RequestSessionClose => "REQUEST_SESSION_CLOSE",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::InviteAgent => "INVITE_AGENT",
            Self::RequestAddAgent => "REQUEST_ADD_AGENT",
            Self::AddAgentDone => "ADD_AGENT_DONE",
            Self::AddAgentFailed => "ADD_AGENT_FAILED",
            Self::RemoveAgent => "REMOVE_AGENT",
            Self::RequestRemoveAgent => "REQUEST_REMOVE_AGENT",
            Self::RemoveAgentDone => "REMOVE_AGENT_DONE",
            Self::RemoveAgentFailed => "REMOVE_AGENT_FAILED",
            Self::Other(s) => s,
        }
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, Self::Cancel | Self::Interrupt)
    }
}

impl FromStr for ControlSubtype {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CANCEL" => Self::Cancel,
            "INTERRUPT" => Self::Interrupt,
            "RETRY" => Self::Retry,
            "SWITCH_AGENT" => Self::SwitchAgent,
            "SET_PERSONA" => Self::SetPersona,
            "CLEAR_CONTEXT" => Self::ClearContext,
            "HANDOVER_REQUEST" => Self::HandoverRequest,
            "HANDOVER_UI_PROMPT" => Self::HandoverUiPrompt,
            "HANDOVER_CONFIRM" => Self::HandoverConfirm,
            "HANDOVER_REJECT" => Self::HandoverReject,
            "HANDOVER_CONTEXT" => Self::HandoverContext,
            "INPUT_ACK" => Self::InputAck,
            "CANCEL_ACK" => Self::CancelAck,
            "REQUEST_SESSION_OPEN" => Self::RequestSessionOpen,
            "SESSION_OPENED" => Self::SessionOpened,
            "REQUEST_SESSION_CLOSE" => Self::RequestSessionClose,
            "SESSION_CLOSED" => Self::SessionClosed,
            "INVITE_AGENT" => Self::InviteAgent,
            "REQUEST_ADD_AGENT" => Self::RequestAddAgent,
            "ADD_AGENT_DONE" => Self::AddAgentDone,
            "ADD_AGENT_FAILED" => Self::AddAgentFailed,
            "REMOVE_AGENT" => Self::RemoveAgent,
            "REQUEST_REMOVE_AGENT" => Self::RequestRemoveAgent,
            "REMOVE_AGENT_DONE" => Self::RemoveAgentDone,
            "REMOVE_AGENT_FAILED" => Self::RemoveAgentFailed,
            other => Self::Other(other.to_owned()),
        })
    }
}

impl fmt::Display for ControlSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body. Text, a structured map, or any other JSON value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Map(Map<String, Value>),
    Value(Value),
}

impl Default for Payload {
    fn default() -> Self {
        Self::Value(Value::Null)
    }
}

impl Payload {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// String field of a map payload.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.as_map()?.get(key)?.as_str()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map()?.get(key)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Value(Value::Null))
    }

    /// Text payloads verbatim, anything else as compact JSON.
    pub fn to_text_lossy(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Map(m) => Value::Object(m.clone()).to_string(),
            Self::Value(v) => v.to_string(),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(m: Map<String, Value>) -> Self {
        Self::Map(m)
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => Self::Text(s),
            Value::Object(m) => Self::Map(m),
            other => Self::Value(other),
        }
    }
}

fn default_origin() -> String {
    "system".into()
}

/// Semantic metadata attached to every message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub event: MessageEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamInfo>,
    #[serde(default)]
    pub persist: bool,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<TurnId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentioned_agent_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageMeta {
    pub fn new(event: MessageEvent) -> Self {
        Self {
            event,
            subtype: None,
            stream: None,
            persist: false,
            visibility: Visibility::Both,
            origin: default_origin(),
            trace_id: None,
            turn_id: None,
            routed_by: None,
            mentioned_agent_id: None,
            extra: Map::new(),
        }
    }

    pub fn subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn stream(mut self, stream: StreamInfo) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn trace(mut self, trace_id: Option<TraceId>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn turn(mut self, turn_id: Option<TurnId>) -> Self {
        self.turn_id = turn_id;
        self
    }

    pub fn routed_by_session(mut self) -> Self {
        self.routed_by = Some(ROUTED_BY_SESSION.into());
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender_id: String,
    pub sender_type: SenderType,
    pub target: MessageTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<AgentId>,
    #[serde(default)]
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    pub metadata: MessageMeta,
}

impl Message {
    pub fn new(
        session_id: SessionId,
        sender_id: impl Into<String>,
        sender_type: SenderType,
        target: MessageTarget,
        payload: impl Into<Payload>,
        metadata: MessageMeta,
    ) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            sender_id: sender_id.into(),
            sender_type,
            target,
            target_id: None,
            payload: payload.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }

    /// Address this message to a single agent.
    pub fn to_agent(mut self, agent_id: AgentId) -> Self {
        self.target = MessageTarget::Agent;
        self.target_id = Some(agent_id);
        self
    }

    pub fn with_target(mut self, target: MessageTarget) -> Self {
        self.target = target;
        self
    }

    pub fn event(&self) -> MessageEvent {
        self.metadata.event
    }

    pub fn subtype(&self) -> Option<&str> {
        self.metadata.subtype.as_deref()
    }

    /// Parsed subtype, only for CONTROL messages.
    pub fn control_subtype(&self) -> Option<ControlSubtype> {
        if self.metadata.event != MessageEvent::Control {
            return None;
        }
        self.subtype().and_then(|s| s.parse().ok())
    }

    pub fn trace_id(&self) -> Option<&TraceId> {
        self.metadata.trace_id.as_ref()
    }

    pub fn turn_id(&self) -> Option<&TurnId> {
        self.metadata.turn_id.as_ref()
    }

    pub fn is_chunk(&self) -> bool {
        self.metadata.stream.is_some_and(|s| s.is_chunk)
    }

    /// The `final` flag when a stream marker is present, otherwise "not a chunk".
    pub fn is_final(&self) -> bool {
        match self.metadata.stream {
            Some(stream) => stream.is_final,
            None => true,
        }
    }

    pub fn should_persist(&self) -> bool {
        self.metadata.persist
    }

    pub fn visibility(&self) -> Visibility {
        self.metadata.visibility
    }

    pub fn is_frontend_visible(&self) -> bool {
        matches!(self.metadata.visibility, Visibility::Frontend | Visibility::Both)
    }

    pub fn is_routed_by_session(&self) -> bool {
        self.metadata.routed_by.as_deref() == Some(ROUTED_BY_SESSION)
    }

    /// Copy addressed to FRONTEND. Payload, sender and timestamp are unchanged;
    /// the copy is tagged `routed_by=session_runtime` and made frontend-visible.
    pub fn forwarded_to_frontend(&self) -> Message {
        let mut metadata = self.metadata.clone();
        metadata.routed_by = Some(ROUTED_BY_SESSION.into());
        metadata.visibility = Visibility::Frontend;
        Message {
            id: MessageId::new(),
            session_id: self.session_id.clone(),
            sender_id: self.sender_id.clone(),
            sender_type: self.sender_type,
            target: MessageTarget::Frontend,
            target_id: None,
            payload: self.payload.clone(),
            timestamp: self.timestamp,
            metadata,
        }
    }
}
