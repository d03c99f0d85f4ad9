//! Turn routing, acknowledgement supervision, cancellation and hand-off for
//! one session.
//!
//! The orchestrator is subscribed as `system` and `session`. It never blocks
//! the bus loop on an acknowledgement: every wait runs in its own task and
//! the turn status decides which side (ACK or timeout) wins.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use parley_agent::SessionMember;
use parley_bus::{Delivery, MessageBus, OnMessage};
use parley_core::factory::{self, TurnTag};
use parley_core::{
    AgentId, ControlSubtype, HandlerError, Message, MessageEvent, MessageId, MessageTarget, Payload,
    SenderType, SessionId, TraceId, TurnId, Visibility, ROUTED_BY_SESSION,
};
use parley_settings::SessionSettings;
use parley_telemetry::{names, MetricsRecorder};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::context::{PendingHandover, SessionContext};
use crate::error::{AckKind, SessionError};
use crate::inflight::{InflightTable, InflightTurn, TurnStatus};
use crate::mention;

/// Turn states a cancel or a failure may still close.
const OPEN_TURN: [TurnStatus; 2] = [TurnStatus::Routing, TurnStatus::Running];

type AckWaiters = DashMap<TurnId, oneshot::Sender<()>>;

/// A REMOVE_AGENT held back until the removed agent's cancel settles.
struct DeferredRemoval {
    reason: String,
    tag: TurnTag,
}

pub struct SessionOrchestrator {
    session_id: SessionId,
    bus: Arc<MessageBus>,
    settings: SessionSettings,
    context: Mutex<SessionContext>,
    turns: Mutex<InflightTable>,
    input_acks: AckWaiters,
    cancel_acks: AckWaiters,
    metrics: Option<Arc<MetricsRecorder>>,
    weak: Weak<Self>,
}

impl SessionOrchestrator {
    /// Creates the orchestrator and subscribes it as `system` and `session`.
    pub fn new(bus: Arc<MessageBus>, settings: SessionSettings) -> Arc<Self> {
        Self::with_metrics(bus, settings, None)
    }

    pub fn with_metrics(
        bus: Arc<MessageBus>,
        settings: SessionSettings,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Arc<Self> {
        let orchestrator = Arc::new_cyclic(|weak| Self {
            session_id: bus.session_id().clone(),
            turns: Mutex::new(InflightTable::new(settings.max_inflight_history)),
            bus,
            settings,
            context: Mutex::new(SessionContext::default()),
            input_acks: DashMap::new(),
            cancel_acks: DashMap::new(),
            metrics,
            weak: weak.clone(),
        });
        let handler: Arc<dyn OnMessage> = orchestrator.clone();
        orchestrator.bus.subscribe("system", handler.clone(), Delivery::Directed);
        orchestrator.bus.subscribe("session", handler, Delivery::Directed);
        info!(session_id = %orchestrator.session_id, "session orchestrator started");
        orchestrator
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn active_agent(&self) -> Option<AgentId> {
        self.context.lock().active().cloned()
    }

    pub fn speaking_agent(&self) -> Option<AgentId> {
        self.context.lock().speaking().cloned()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.context.lock().agent_ids()
    }

    pub fn member(&self, agent_id: &AgentId) -> Option<Arc<dyn SessionMember>> {
        self.context.lock().member(agent_id)
    }

    pub fn turn(&self, turn_id: &TurnId) -> Option<InflightTurn> {
        self.turns.lock().get(turn_id).cloned()
    }

    pub fn inflight_len(&self) -> usize {
        self.turns.lock().len()
    }

    // ── Membership ──────────────────────────────────────────────────────

    /// Binds the member to this session and subscribes it under its id.
    /// It becomes the active agent if asked to or if none is active.
    /// Registering an id twice is a no-op.
    pub async fn register_agent(
        &self,
        member: Arc<dyn SessionMember>,
        make_active: bool,
    ) -> Result<(), SessionError> {
        let agent_id = member.agent_id().clone();
        let becomes_active = {
            let mut ctx = self.context.lock();
            if ctx.contains(&agent_id) {
                debug!(session_id = %self.session_id, %agent_id, "agent already registered");
                return Ok(());
            }
            member.join_session(self.session_id.clone(), self.bus.clone())?;
            ctx.add(member.clone());
            make_active || ctx.active().is_none()
        };
        self.bus
            .subscribe(agent_id.as_str(), member.into_handler(), Delivery::Directed);
        info!(session_id = %self.session_id, %agent_id, "agent registered");

        if becomes_active {
            self.switch_active(agent_id, "register", &TurnTag::none())
                .await?;
        }
        Ok(())
    }

    /// Unsubscribes and detaches the member. Unknown ids are a no-op.
    pub fn unregister_agent(&self, agent_id: &AgentId) -> Option<Arc<dyn SessionMember>> {
        let member = self.context.lock().remove(agent_id)?;
        self.bus.unsubscribe(agent_id.as_str());
        member.leave_session();
        info!(session_id = %self.session_id, %agent_id, "agent unregistered");
        Some(member)
    }

    /// Detaches every member and drops pending acknowledgement waits.
    pub fn shutdown(&self) -> Vec<Arc<dyn SessionMember>> {
        let ids = self.agent_ids();
        let members = ids
            .iter()
            .filter_map(|id| self.unregister_agent(id))
            .collect();
        self.input_acks.clear();
        self.cancel_acks.clear();
        info!(session_id = %self.session_id, "session orchestrator stopped");
        members
    }

    // ── Outbound helpers ────────────────────────────────────────────────

    fn frontend_event(&self, name: &str, payload: impl Into<Payload>, tag: &TurnTag) -> Message {
        let mut msg = factory::event(self.session_id.clone(), ROUTED_BY_SESSION, name, payload, tag)
            .with_target(MessageTarget::Frontend);
        msg.sender_type = SenderType::Session;
        msg.metadata.visibility = Visibility::Frontend;
        msg.metadata.routed_by = Some(ROUTED_BY_SESSION.into());
        msg
    }

    fn session_control(
        &self,
        subtype: ControlSubtype,
        payload: impl Into<Payload>,
        target: MessageTarget,
        tag: &TurnTag,
    ) -> Message {
        let mut msg = factory::control(
            self.session_id.clone(),
            ROUTED_BY_SESSION,
            SenderType::Session,
            subtype,
            payload,
            target,
            tag,
        );
        msg.metadata.routed_by = Some(ROUTED_BY_SESSION.into());
        msg
    }

    async fn emit_error(&self, tag: &TurnTag, err: &SessionError) -> Result<(), SessionError> {
        let mut msg = factory::error(
            self.session_id.clone(),
            ROUTED_BY_SESSION,
            err.code(),
            err.to_string(),
            MessageTarget::Frontend,
            tag,
        );
        msg.metadata.routed_by = Some(ROUTED_BY_SESSION.into());
        self.bus.publish(msg).await?;
        Ok(())
    }

    fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(name, &[("session_id", self.session_id.as_str())], 1);
        }
    }

    async fn switch_active(
        &self,
        to: AgentId,
        reason: &str,
        tag: &TurnTag,
    ) -> Result<(), SessionError> {
        let from = self.context.lock().set_active(to.clone());
        if from.as_ref() == Some(&to) {
            return Ok(());
        }
        info!(session_id = %self.session_id, from = ?from, %to, reason, "active agent changed");
        self.bus
            .publish(self.session_control(
                ControlSubtype::SwitchAgent,
                json!({"from": from, "to": to, "reason": reason}),
                MessageTarget::System,
                tag,
            ))
            .await?;
        self.bus
            .publish(self.frontend_event(
                "ACTIVE_AGENT_CHANGED",
                json!({"active_agent_id": to, "previous_agent_id": from, "reason": reason}),
                tag,
            ))
            .await?;
        Ok(())
    }

    // ── USER_INPUT ──────────────────────────────────────────────────────

    /// Mention first, then the active agent, then the first registered one.
    fn resolve_target(&self, msg: &Message) -> Result<(AgentId, bool), SessionError> {
        let ctx = self.context.lock();
        if let Some(mentioned) = mention::extract_mention(msg) {
            let agent_id = AgentId::from_raw(mentioned);
            if !ctx.contains(&agent_id) {
                return Err(SessionError::UnknownAgent(agent_id));
            }
            return Ok((agent_id, true));
        }
        if let Some(active) = ctx.active() {
            return Ok((active.clone(), false));
        }
        ctx.first_agent()
            .map(|id| (id, false))
            .ok_or(SessionError::NoRoutableAgent)
    }

    async fn handle_user_input(&self, msg: &Message) -> Result<(), SessionError> {
        if !matches!(msg.target, MessageTarget::Session | MessageTarget::System) {
            return Ok(());
        }
        let trace_id = msg.trace_id().cloned().unwrap_or_else(TraceId::new);
        let turn_id = msg.turn_id().cloned().unwrap_or_else(TurnId::new);
        let tag = TurnTag::new(trace_id.clone(), turn_id.clone());

        let (target, mentioned) = match self.resolve_target(msg) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(session_id = %self.session_id, %turn_id, error = %err, "input not routable");
                return self.emit_error(&tag, &err).await;
            }
        };
        if mentioned && self.active_agent().as_ref() != Some(&target) {
            self.switch_active(target.clone(), "mention_user_input", &tag)
                .await?;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut turns = self.turns.lock();
            turns.insert(InflightTurn::new(
                turn_id.clone(),
                trace_id.clone(),
                target.clone(),
                TurnStatus::Routing,
            ));
            let dropped = turns.gc();
            if dropped > 0 {
                debug!(session_id = %self.session_id, dropped, "inflight turns collected");
            }
        }
        self.input_acks.insert(turn_id.clone(), tx);
        self.count(names::SESSION_TURNS_ACCEPTED);
        info!(
            session_id = %self.session_id,
            %turn_id,
            %trace_id,
            agent_id = %target,
            "turn accepted"
        );

        self.bus
            .publish(self.frontend_event(
                "TURN_ACCEPTED",
                json!({"turn_id": turn_id, "trace_id": trace_id, "target_agent_id": target}),
                &tag,
            ))
            .await?;

        let mut routed = msg.clone();
        routed.id = MessageId::new();
        routed.target = MessageTarget::Agent;
        routed.target_id = Some(target.clone());
        routed.metadata.trace_id = Some(trace_id);
        routed.metadata.turn_id = Some(turn_id);
        routed.metadata.routed_by = Some(ROUTED_BY_SESSION.into());
        routed.metadata.visibility = Visibility::Internal;
        self.bus.publish(routed).await?;

        self.spawn_input_ack_wait(rx, tag, target);
        Ok(())
    }

    fn spawn_input_ack_wait(&self, rx: oneshot::Receiver<()>, tag: TurnTag, agent_id: AgentId) {
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        let timeout = self.settings.input_ack_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!(turn_id = ?tag.turn_id, "input ack wait abandoned"),
                Err(_) => this.fail_unacked_turn(tag, agent_id, timeout).await,
            }
        });
    }

    async fn fail_unacked_turn(&self, tag: TurnTag, agent_id: AgentId, timeout: Duration) {
        let Some(turn_id) = tag.turn_id.clone() else {
            return;
        };
        self.input_acks.remove(&turn_id);
        let failed = self
            .turns
            .lock()
            .transition(&turn_id, TurnStatus::Failed, &[TurnStatus::Routing])
            .is_some();
        if !failed {
            return;
        }
        self.count(names::SESSION_TURNS_FAILED);
        let err = SessionError::AckTimeout {
            kind: AckKind::Input,
            agent_id,
            timeout,
        };
        warn!(session_id = %self.session_id, %turn_id, error = %err, "turn failed");
        if let Err(e) = self.emit_error(&tag, &err).await {
            warn!(session_id = %self.session_id, error = %e, "could not report route timeout");
        }
    }

    async fn handle_input_ack(&self, msg: &Message) -> Result<(), SessionError> {
        let Some(turn_id) = msg.turn_id().cloned() else {
            debug!(
                session_id = %self.session_id,
                sender = %msg.sender_id,
                "INPUT_ACK without turn_id"
            );
            return Ok(());
        };
        let started = self
            .turns
            .lock()
            .transition(&turn_id, TurnStatus::Running, &[TurnStatus::Routing])
            .is_some();
        if let Some((_, tx)) = self.input_acks.remove(&turn_id) {
            let _ = tx.send(());
        }
        if !started {
            debug!(session_id = %self.session_id, %turn_id, "late INPUT_ACK ignored");
            return Ok(());
        }
        debug!(session_id = %self.session_id, %turn_id, agent_id = %msg.sender_id, "agent started");
        self.bus
            .publish(self.frontend_event(
                "AGENT_STARTED",
                json!({"turn_id": turn_id, "trace_id": msg.trace_id(), "agent_id": msg.sender_id}),
                &TurnTag::of(msg),
            ))
            .await?;
        Ok(())
    }

    // ── AGENT_OUTPUT ────────────────────────────────────────────────────

    async fn handle_agent_output(&self, msg: &Message) -> Result<(), SessionError> {
        let agent_id = AgentId::from_raw(msg.sender_id.clone());
        let turn_id = msg.turn_id().cloned();

        if let Some(turn_id) = &turn_id {
            let mut turns = self.turns.lock();
            if let Some(turn) = turns.get_mut(turn_id) {
                match turn.status {
                    TurnStatus::Failed | TurnStatus::Canceled => {
                        debug!(
                            session_id = %self.session_id,
                            %turn_id,
                            %agent_id,
                            "output for closed turn dropped"
                        );
                        return Ok(());
                    }
                    TurnStatus::Routing => {
                        warn!(
                            session_id = %self.session_id,
                            %turn_id,
                            %agent_id,
                            "output before INPUT_ACK dropped"
                        );
                        return Ok(());
                    }
                    TurnStatus::Running | TurnStatus::Completed => {}
                }
                turn.last_output_at = Some(Utc::now());
                if msg.is_final() {
                    if let Some(text) = msg.payload.as_text() {
                        turn.last_agent_output_final = Some(text.to_owned());
                    }
                }
            }
        }

        let floor = {
            let mut ctx = self.context.lock();
            if msg.is_chunk() {
                ctx.claim_speaking(&agent_id)
            } else {
                ctx.finish_speaking(&agent_id)
            }
        };
        if let Err(holder) = floor {
            let err = SessionError::SpeakingConflict {
                holder,
                claimant: agent_id,
            };
            warn!(session_id = %self.session_id, error = %err, "speaking conflict");
            return self.emit_error(&TurnTag::of(msg), &err).await;
        }

        if msg.is_final() {
            if let Some(turn_id) = &turn_id {
                let completed = self
                    .turns
                    .lock()
                    .transition(turn_id, TurnStatus::Completed, &[TurnStatus::Running])
                    .is_some();
                if completed {
                    self.count(names::SESSION_TURNS_COMPLETED);
                    debug!(session_id = %self.session_id, %turn_id, "turn completed");
                }
            }
        }

        self.bus.publish(msg.forwarded_to_frontend()).await?;
        Ok(())
    }

    // ── ERROR ───────────────────────────────────────────────────────────

    /// Agent-reported failures end the turn and reach the frontend.
    async fn handle_error(&self, msg: &Message) -> Result<(), SessionError> {
        if msg.sender_type == SenderType::Agent {
            let agent_id = AgentId::from_raw(msg.sender_id.clone());
            self.context.lock().release_if_speaking(&agent_id);
            if let Some(turn_id) = msg.turn_id() {
                let failed = self
                    .turns
                    .lock()
                    .transition(turn_id, TurnStatus::Failed, &OPEN_TURN)
                    .is_some();
                if let Some((_, tx)) = self.input_acks.remove(turn_id) {
                    let _ = tx.send(());
                }
                if failed {
                    self.count(names::SESSION_TURNS_FAILED);
                    warn!(
                        session_id = %self.session_id,
                        %turn_id,
                        %agent_id,
                        "turn failed in agent"
                    );
                }
            }
        }
        self.bus.publish(msg.forwarded_to_frontend()).await?;
        Ok(())
    }

    // ── CONTROL ─────────────────────────────────────────────────────────

    async fn handle_control(&self, msg: &Message) -> Result<(), SessionError> {
        let Some(subtype) = msg.control_subtype() else {
            return Ok(());
        };
        match subtype {
            ControlSubtype::Cancel | ControlSubtype::Interrupt => {
                self.cancel_current(msg, None).await
            }
            ControlSubtype::InputAck => self.handle_input_ack(msg).await,
            ControlSubtype::CancelAck => {
                self.handle_cancel_ack(msg);
                Ok(())
            }
            ControlSubtype::SwitchAgent => self.handle_switch_request(msg).await,
            ControlSubtype::InviteAgent | ControlSubtype::RequestAddAgent => {
                self.request_add_agent(msg).await
            }
            ControlSubtype::RemoveAgent | ControlSubtype::RequestRemoveAgent => {
                self.request_remove_agent(msg).await
            }
            ControlSubtype::HandoverRequest => self.prompt_handover(msg).await,
            ControlSubtype::HandoverConfirm => self.confirm_handover(msg).await,
            ControlSubtype::HandoverReject => self.reject_handover(msg).await,
            other => {
                debug!(session_id = %self.session_id, subtype = other.as_str(), "control ignored");
                Ok(())
            }
        }
    }

    /// Sends CANCEL to the speaking agent and finishes the turn once the
    /// agent acknowledges or the wait times out. A deferred removal runs
    /// after that, so the agent is still subscribed when the CANCEL lands.
    async fn cancel_current(
        &self,
        msg: &Message,
        then_remove: Option<DeferredRemoval>,
    ) -> Result<(), SessionError> {
        let Some((agent_id, member)) = ({
            let ctx = self.context.lock();
            ctx.speaking().map(|id| (id.clone(), ctx.member(id)))
        }) else {
            return self
                .bus
                .publish(self.frontend_event(
                    "NO_SPEAKING_AGENT",
                    json!({"reason": "no agent is speaking"}),
                    &TurnTag::of(msg),
                ))
                .await
                .map_err(Into::into);
        };

        let tag = {
            let mut turns = self.turns.lock();
            match turns.latest_open_for(&agent_id) {
                Some(turn) => TurnTag::new(turn.trace_id.clone(), turn.turn_id.clone()),
                None => {
                    let trace_id = msg.trace_id().cloned().unwrap_or_else(TraceId::new);
                    let turn_id = TurnId::new();
                    turns.insert(InflightTurn::new(
                        turn_id.clone(),
                        trace_id.clone(),
                        agent_id.clone(),
                        TurnStatus::Running,
                    ));
                    TurnTag::new(trace_id, turn_id)
                }
            }
        };
        let Some(turn_id) = tag.turn_id.clone() else {
            return Ok(());
        };

        let (tx, rx) = oneshot::channel();
        self.cancel_acks.insert(turn_id.clone(), tx);
        info!(session_id = %self.session_id, %turn_id, %agent_id, "cancel requested");

        let cancel = self
            .session_control(
                ControlSubtype::Cancel,
                json!({"reason": "user_interrupt", "turn_id": turn_id}),
                MessageTarget::Agent,
                &tag,
            )
            .to_agent(agent_id.clone());
        if let Err(e) = self.bus.publish(cancel).await {
            self.cancel_acks.remove(&turn_id);
            return Err(e.into());
        }

        let Some(this) = self.weak.upgrade() else {
            return Ok(());
        };
        let timeout = self.settings.cancel_ack_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    debug!(%turn_id, "cancel ack wait abandoned");
                    return;
                }
                Err(_) => {
                    this.cancel_acks.remove(&turn_id);
                    let err = SessionError::AckTimeout {
                        kind: AckKind::Cancel,
                        agent_id: agent_id.clone(),
                        timeout,
                    };
                    warn!(
                        session_id = %this.session_id,
                        %turn_id,
                        error = %err,
                        "cancel not acknowledged"
                    );
                    if let Err(e) = this.emit_error(&tag, &err).await {
                        warn!(
                            session_id = %this.session_id,
                            error = %e,
                            "could not report cancel timeout"
                        );
                    }
                }
            }
            this.finish_cancel(&agent_id, member, &tag).await;
            if let Some(removal) = then_remove {
                let removed = this
                    .complete_removal(&agent_id, &removal.reason, &removal.tag)
                    .await;
                if let Err(e) = removed {
                    warn!(
                        session_id = %this.session_id,
                        %agent_id,
                        error = %e,
                        "deferred removal failed"
                    );
                }
            }
        });
        Ok(())
    }

    /// Runs whether or not the agent acknowledged. A turn that already
    /// reached a terminal status keeps it and is not reported as canceled.
    async fn finish_cancel(
        &self,
        agent_id: &AgentId,
        member: Option<Arc<dyn SessionMember>>,
        tag: &TurnTag,
    ) {
        let Some(turn_id) = tag.turn_id.clone() else {
            return;
        };
        let canceled = {
            let mut turns = self.turns.lock();
            let canceled = turns
                .transition(&turn_id, TurnStatus::Canceled, &OPEN_TURN)
                .is_some();
            turns.gc();
            canceled
        };
        if !canceled {
            debug!(
                session_id = %self.session_id,
                %turn_id,
                %agent_id,
                "turn ended before cancel settled"
            );
            return;
        }
        self.context.lock().release_if_speaking(agent_id);
        if let Some(member) = member {
            member.release_speaking();
        }
        self.count(names::SESSION_TURNS_CANCELED);
        info!(session_id = %self.session_id, %turn_id, %agent_id, "turn canceled");
        let event = self.frontend_event(
            "TURN_CANCELED",
            json!({"turn_id": turn_id, "trace_id": tag.trace_id}),
            tag,
        );
        if let Err(e) = self.bus.publish(event).await {
            warn!(session_id = %self.session_id, error = %e, "could not report canceled turn");
        }
    }

    fn handle_cancel_ack(&self, msg: &Message) {
        let turn_id = msg
            .turn_id()
            .cloned()
            .or_else(|| msg.payload.get_str("turn_id").map(TurnId::from_raw));
        let Some(turn_id) = turn_id else {
            debug!(
                session_id = %self.session_id,
                sender = %msg.sender_id,
                "CANCEL_ACK without turn_id"
            );
            return;
        };
        match self.cancel_acks.remove(&turn_id) {
            Some((_, tx)) => {
                let _ = tx.send(());
            }
            None => debug!(session_id = %self.session_id, %turn_id, "late CANCEL_ACK ignored"),
        }
    }

    async fn handle_switch_request(&self, msg: &Message) -> Result<(), SessionError> {
        let tag = TurnTag::of(msg);
        let target = msg
            .payload
            .get_str("to")
            .or_else(|| msg.payload.get_str("agent_id"))
            .or_else(|| msg.metadata.extra.get("to_agent_id").and_then(Value::as_str))
            .map(AgentId::from_raw);
        let Some(target) = target else {
            let err = SessionError::InvalidRequest("SWITCH_AGENT requires a target agent".into());
            return self.emit_error(&tag, &err).await;
        };
        if !self.context.lock().contains(&target) {
            return self.emit_error(&tag, &SessionError::UnknownAgent(target)).await;
        }
        let reason = msg.payload.get_str("reason").unwrap_or("user_switch");
        self.switch_active(target, reason, &tag).await
    }

    // ── Lifecycle requests ──────────────────────────────────────────────

    async fn request_add_agent(&self, msg: &Message) -> Result<(), SessionError> {
        let tag = TurnTag::of(msg);
        let payload: Map<String, Value> = match &msg.payload {
            Payload::Map(map) => map.clone(),
            Payload::Text(id) => {
                let mut map = Map::new();
                map.insert("agent_id".into(), json!(id));
                map
            }
            Payload::Value(_) => Map::new(),
        };
        if !payload.get("agent_id").and_then(Value::as_str).is_some_and(|id| !id.is_empty()) {
            let err = SessionError::InvalidRequest("REQUEST_ADD_AGENT requires agent_id".into());
            return self.emit_error(&tag, &err).await;
        }
        self.bus
            .publish(self.session_control(
                ControlSubtype::RequestAddAgent,
                payload,
                MessageTarget::System,
                &tag,
            ))
            .await?;
        Ok(())
    }

    async fn request_remove_agent(&self, msg: &Message) -> Result<(), SessionError> {
        let tag = TurnTag::of(msg);
        let agent_id = msg
            .payload
            .get_str("agent_id")
            .or_else(|| msg.payload.get_str("id"))
            .filter(|id| !id.is_empty())
            .map(AgentId::from_raw);
        let Some(agent_id) = agent_id else {
            let err = SessionError::InvalidRequest("REMOVE_AGENT requires agent_id".into());
            return self.emit_error(&tag, &err).await;
        };
        if !self.context.lock().contains(&agent_id) {
            return self.emit_error(&tag, &SessionError::UnknownAgent(agent_id)).await;
        }
        let reason = msg.payload.get_str("reason").unwrap_or("user_remove");

        if self.speaking_agent().as_ref() == Some(&agent_id) {
            let pre_cancel = self.session_control(
                ControlSubtype::Cancel,
                json!({"reason": "remove_agent_pre_cancel"}),
                MessageTarget::System,
                &tag,
            );
            let removal = DeferredRemoval {
                reason: reason.to_owned(),
                tag,
            };
            return self.cancel_current(&pre_cancel, Some(removal)).await;
        }
        self.complete_removal(&agent_id, reason, &tag).await
    }

    /// Asks SYSTEM to destroy the worker, then drops it locally.
    async fn complete_removal(
        &self,
        agent_id: &AgentId,
        reason: &str,
        tag: &TurnTag,
    ) -> Result<(), SessionError> {
        self.bus
            .publish(self.session_control(
                ControlSubtype::RequestRemoveAgent,
                json!({"agent_id": agent_id, "reason": reason}),
                MessageTarget::System,
                tag,
            ))
            .await?;

        self.unregister_agent(agent_id);

        self.bus
            .publish(self.frontend_event(
                "AGENT_REMOVED_LOCAL",
                json!({"agent_id": agent_id}),
                &TurnTag::none(),
            ))
            .await?;
        Ok(())
    }

    // ── Hand-off ────────────────────────────────────────────────────────

    async fn prompt_handover(&self, msg: &Message) -> Result<(), SessionError> {
        let from_agent = AgentId::from_raw(msg.sender_id.clone());
        let request = PendingHandover {
            from_agent: from_agent.clone(),
            turn_id: msg.turn_id().cloned(),
            requested_at: Utc::now(),
        };
        let offered = self.context.lock().offer_handover(request);
        if let Err(existing) = offered {
            info!(
                session_id = %self.session_id,
                %from_agent,
                pending_from = %existing.from_agent,
                "handover request rejected, another is pending"
            );
            let mut rejected = factory::event(
                self.session_id.clone(),
                ROUTED_BY_SESSION,
                "HANDOVER_REJECTED",
                json!({
                    "from_agent": from_agent,
                    "reason": "handover_pending",
                    "pending_from": existing.from_agent,
                    "request": msg.payload,
                }),
                &TurnTag::of(msg),
            );
            rejected.metadata.visibility = Visibility::Internal;
            rejected.metadata.routed_by = Some(ROUTED_BY_SESSION.into());
            self.bus.publish(rejected).await?;
            return Ok(());
        }

        let mut prompt = self.session_control(
            ControlSubtype::HandoverUiPrompt,
            json!({
                "from_agent": from_agent,
                "request": msg.payload,
                "trace_id": msg.trace_id(),
                "turn_id": msg.turn_id(),
            }),
            MessageTarget::Frontend,
            &TurnTag::of(msg),
        );
        prompt.metadata.visibility = Visibility::Frontend;
        self.bus.publish(prompt).await?;
        Ok(())
    }

    async fn reject_handover(&self, msg: &Message) -> Result<(), SessionError> {
        let pending = self.context.lock().take_handover();
        info!(
            session_id = %self.session_id,
            from_agent = ?pending.map(|p| p.from_agent),
            "handover rejected"
        );
        let mut rejected = factory::event(
            self.session_id.clone(),
            ROUTED_BY_SESSION,
            "HANDOVER_REJECTED",
            msg.payload.clone(),
            &TurnTag::of(msg),
        );
        rejected.metadata.visibility = Visibility::Internal;
        rejected.metadata.routed_by = Some(ROUTED_BY_SESSION.into());
        self.bus.publish(rejected).await?;
        Ok(())
    }

    async fn confirm_handover(&self, msg: &Message) -> Result<(), SessionError> {
        let to_agent = msg
            .payload
            .get_str("to_agent")
            .or_else(|| msg.payload.get_str("to"))
            .filter(|id| !id.is_empty())
            .map(AgentId::from_raw);
        let Some(to_agent) = to_agent else {
            let err = SessionError::InvalidRequest("HANDOVER_CONFIRM requires to_agent".into());
            return self.emit_error(&TurnTag::of(msg), &err).await;
        };
        let tag = TurnTag::new(
            msg.trace_id().cloned().unwrap_or_else(TraceId::new),
            msg.turn_id().cloned().unwrap_or_else(TurnId::new),
        );
        let pending = {
            let mut ctx = self.context.lock();
            if ctx.contains(&to_agent) {
                Ok(ctx.take_handover())
            } else {
                Err(to_agent.clone())
            }
        };
        let pending = match pending {
            Ok(pending) => pending,
            Err(unknown) => {
                return self
                    .emit_error(&tag, &SessionError::UnknownAgent(unknown))
                    .await;
            }
        };
        let from_agent = msg
            .payload
            .get_str("from_agent")
            .map(AgentId::from_raw)
            .or_else(|| pending.map(|p| p.from_agent));
        self.switch_active(to_agent.clone(), "handover_confirmed", &tag)
            .await?;

        let prev_output = msg
            .payload
            .get_str("prev_output")
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .or_else(|| {
                from_agent
                    .as_ref()
                    .and_then(|from| self.turns.lock().latest_final_output(from))
            });

        let context = self
            .session_control(
                ControlSubtype::HandoverContext,
                json!({
                    "from_agent": from_agent,
                    "prev_output": prev_output,
                    "reason": msg.payload.get_str("reason"),
                }),
                MessageTarget::Agent,
                &tag,
            )
            .to_agent(to_agent.clone());
        self.bus.publish(context).await?;
        info!(
            session_id = %self.session_id,
            from_agent = ?from_agent,
            %to_agent,
            "handover applied"
        );
        Ok(())
    }
}

#[async_trait]
impl OnMessage for SessionOrchestrator {
    async fn on_message(&self, msg: &Message) -> Result<(), HandlerError> {
        if msg.session_id != self.session_id || msg.is_routed_by_session() {
            return Ok(());
        }
        let result = match msg.event() {
            MessageEvent::UserInput => self.handle_user_input(msg).await,
            MessageEvent::AgentOutput => self.handle_agent_output(msg).await,
            MessageEvent::Control => self.handle_control(msg).await,
            MessageEvent::Error => self.handle_error(msg).await,
            other => {
                debug!(session_id = %self.session_id, event = other.as_str(), "message ignored");
                Ok(())
            }
        };
        result.map_err(HandlerError::from)
    }
}
