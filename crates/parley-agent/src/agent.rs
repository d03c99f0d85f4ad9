//! Agent worker runtime.
//!
//! Wraps an [`AgentBehavior`] with the lifecycle every agent shares: run
//! state, persona binding, speaking lock, one run at a time, heartbeat,
//! metrics and the bus protocol (INPUT_ACK before output, CANCEL_ACK on
//! cancel).

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use parley_bus::{MessageBus, OnMessage};
use parley_core::factory::{self, TurnTag};
use parley_core::{
    AgentId, ControlSubtype, HandlerError, Message, MessageEvent, MessageTarget, PersonaMatrix,
    SenderType, SessionId, TurnId,
};
use parley_memory::{AgentMemory, MemoryManager, MEMORY_SCOPE_KEY};
use parley_settings::AgentSettings;
use parley_telemetry::{names, MetricsRecorder};
use serde_json::{json, Value};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::behavior::AgentBehavior;
use crate::error::AgentError;
use crate::heartbeat::{Beat, Heartbeat, HeartbeatStats};
use crate::member::SessionMember;
use crate::state::{CognitiveState, RunState};
use crate::status::{health_score, AgentStatus, CallMetrics, CallStats, HealthInputs};
use crate::turn::{HandoverContext, TurnChunk, TurnContext, TurnInput, TurnItem, TurnSink};

#[derive(Default)]
struct AgentState {
    run_state: RunState,
    cognitive: CognitiveState,
    active: bool,
    speaking: bool,
    initialized: bool,
    session_id: Option<SessionId>,
    persona: Option<Arc<PersonaMatrix>>,
    handover: Option<HandoverContext>,
    memory: Option<AgentMemory>,
}

impl AgentState {
    fn is_closed(&self) -> bool {
        self.run_state == RunState::Closed
    }
}

pub struct Agent {
    agent_id: AgentId,
    behavior: Arc<dyn AgentBehavior>,
    settings: AgentSettings,
    state: RwLock<AgentState>,
    bus: RwLock<Option<Arc<MessageBus>>>,
    memory_manager: RwLock<Option<Arc<MemoryManager>>>,
    init_lock: tokio::sync::Mutex<()>,
    run_lock: Arc<tokio::sync::Mutex<()>>,
    metrics: Mutex<CallMetrics>,
    heartbeat: Heartbeat,
    turn_cancel: Mutex<CancellationToken>,
    recorder: Option<Arc<MetricsRecorder>>,
    weak: Weak<Agent>,
}

impl Agent {
    pub fn new(
        agent_id: AgentId,
        behavior: Arc<dyn AgentBehavior>,
        settings: AgentSettings,
    ) -> Arc<Self> {
        Self::with_metrics(agent_id, behavior, settings, None)
    }

    pub fn with_metrics(
        agent_id: AgentId,
        behavior: Arc<dyn AgentBehavior>,
        settings: AgentSettings,
        recorder: Option<Arc<MetricsRecorder>>,
    ) -> Arc<Self> {
        let heartbeat = Heartbeat::new(settings.heartbeat_interval());
        Arc::new_cyclic(|weak| Self {
            agent_id,
            behavior,
            settings,
            state: RwLock::new(AgentState::default()),
            bus: RwLock::new(None),
            memory_manager: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
            run_lock: Arc::new(tokio::sync::Mutex::new(())),
            metrics: Mutex::new(CallMetrics::default()),
            heartbeat,
            turn_cancel: Mutex::new(CancellationToken::new()),
            recorder,
            weak: weak.clone(),
        })
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn run_state(&self) -> RunState {
        self.state.read().run_state
    }

    pub fn cognitive_state(&self) -> CognitiveState {
        self.state.read().cognitive
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().is_closed()
    }

    pub fn is_active(&self) -> bool {
        self.state.read().active
    }

    pub fn is_speaking(&self) -> bool {
        self.state.read().speaking
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().initialized
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.state.read().session_id.clone()
    }

    pub fn persona(&self) -> Option<Arc<PersonaMatrix>> {
        self.state.read().persona.clone()
    }

    pub fn memory_scope_id(&self) -> Option<String> {
        self.state
            .read()
            .persona
            .as_ref()
            .map(|p| p.memory_scope_id.clone())
    }

    /// The memory view of the current persona's scope.
    pub fn memory(&self) -> Option<AgentMemory> {
        self.state.read().memory.clone()
    }

    /// Where persona scopes resolve to. Takes effect on the next
    /// [`Agent::attach_persona`].
    pub fn set_memory_manager(&self, manager: Arc<MemoryManager>) {
        *self.memory_manager.write() = Some(manager);
    }

    fn bus(&self) -> Option<Arc<MessageBus>> {
        self.bus.read().clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Runs the behavior's setup once. Later calls log and return.
    pub async fn initialize(&self) -> Result<(), AgentError> {
        let _guard = self.init_lock.lock().await;
        {
            let state = self.state.read();
            if state.is_closed() {
                return Err(AgentError::Closed(self.agent_id.clone()));
            }
            if state.initialized {
                warn!(agent_id = %self.agent_id, "agent already initialized");
                return Ok(());
            }
        }
        if let Err(e) = self.behavior.setup(&self.agent_id).await {
            let mut state = self.state.write();
            if !state.is_closed() {
                state.run_state = RunState::Error;
                state.cognitive = CognitiveState::Error;
            }
            warn!(agent_id = %self.agent_id, error = %e, "agent setup failed");
            return Err(e);
        }
        self.state.write().initialized = true;
        info!(agent_id = %self.agent_id, "agent initialized");
        Ok(())
    }

    /// Terminal. Teardown runs exactly once however often this is called.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            if state.is_closed() {
                debug!(agent_id = %self.agent_id, "agent already closed");
                return;
            }
            state.run_state = RunState::Closed;
            state.cognitive = CognitiveState::None;
            state.active = false;
            state.speaking = false;
        }
        self.cancel_turn();
        if let Err(e) = self.behavior.teardown(&self.agent_id).await {
            warn!(agent_id = %self.agent_id, error = %e, "agent teardown failed");
        }
        *self.bus.write() = None;
        info!(agent_id = %self.agent_id, "agent closed");
    }

    pub fn switch_active(&self, active: bool) -> Result<(), AgentError> {
        let mut state = self.state.write();
        if state.is_closed() {
            return Err(AgentError::Closed(self.agent_id.clone()));
        }
        if state.speaking {
            return Err(AgentError::SpeakingLocked(self.agent_id.clone()));
        }
        state.active = active;
        debug!(agent_id = %self.agent_id, active, "active flag changed");
        Ok(())
    }

    // ── Persona ─────────────────────────────────────────────────────────

    /// Binds a persona and switches the memory scope in the same step.
    pub fn attach_persona(
        &self,
        persona: impl Into<Arc<PersonaMatrix>>,
    ) -> Result<(), AgentError> {
        let persona = persona.into();
        persona.validate()?;
        let manager = self.memory_manager.read().clone();
        let mut state = self.state.write();
        if state.is_closed() {
            return Err(AgentError::Closed(self.agent_id.clone()));
        }
        if state.speaking {
            return Err(AgentError::SpeakingLocked(self.agent_id.clone()));
        }
        let Some(session_id) = state.session_id.clone() else {
            return Err(AgentError::NoSession(self.agent_id.clone()));
        };
        state.memory = manager
            .map(|m| m.agent_view(&session_id, &self.agent_id, &persona.memory_scope_id));
        self.behavior.on_memory_scope(Some(&persona.memory_scope_id));
        info!(
            agent_id = %self.agent_id,
            persona_id = %persona.persona_id,
            memory_scope_id = %persona.memory_scope_id,
            "persona attached"
        );
        state.persona = Some(persona);
        Ok(())
    }

    pub fn detach_persona(&self) -> Result<Option<Arc<PersonaMatrix>>, AgentError> {
        let mut state = self.state.write();
        if state.speaking {
            return Err(AgentError::SpeakingLocked(self.agent_id.clone()));
        }
        let previous = state.persona.take();
        state.memory = None;
        if previous.is_some() {
            self.behavior.on_memory_scope(None);
            info!(agent_id = %self.agent_id, "persona detached");
        }
        Ok(previous)
    }

    // ── Processing ──────────────────────────────────────────────────────

    /// Runs one turn to completion and returns the final text.
    pub async fn process(&self, input: TurnInput) -> Result<String, AgentError> {
        let mut stream = self.process_stream(input).await?;
        let mut final_text = None;
        let mut failure = None;
        // Drain fully so state is restored before returning.
        while let Some(item) = stream.next().await {
            match item {
                Ok(TurnChunk::Final { text }) => final_text = Some(text),
                Ok(TurnChunk::Delta { .. }) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        match (failure, final_text) {
            (Some(e), _) => Err(e),
            (None, Some(text)) => Ok(text),
            (None, None) => Err(AgentError::Canceled),
        }
    }

    /// Starts a turn and returns its chunk stream. Waits for any run in
    /// progress; preflight errors are returned before anything is streamed.
    pub async fn process_stream(
        &self,
        input: TurnInput,
    ) -> Result<ReceiverStream<TurnItem>, AgentError> {
        self.open_turn(input).await.map(|(stream, _)| stream)
    }

    /// Starts a run and hands back its output stream with the token that
    /// cancels it.
    async fn open_turn(
        &self,
        input: TurnInput,
    ) -> Result<(ReceiverStream<TurnItem>, CancellationToken), AgentError> {
        let this = self
            .weak
            .upgrade()
            .ok_or_else(|| AgentError::Closed(self.agent_id.clone()))?;
        if !self.is_initialized() {
            self.initialize().await?;
        }
        let guard = Arc::clone(&self.run_lock).lock_owned().await;
        let (ctx, cancel) = self.begin_run(&input)?;
        let (tx, rx) = mpsc::channel(self.settings.chunk_buffer.max(1));
        tokio::spawn(this.run_turn(input, ctx, tx, cancel.clone(), guard));
        Ok((ReceiverStream::new(rx), cancel))
    }

    fn preflight(
        &self,
        state: &AgentState,
        input: &TurnInput,
    ) -> Result<Arc<PersonaMatrix>, AgentError> {
        if state.is_closed() {
            return Err(AgentError::Closed(self.agent_id.clone()));
        }
        if !state.active {
            return Err(AgentError::NotActive(self.agent_id.clone()));
        }
        if input.text.trim().is_empty() {
            return Err(AgentError::InvalidInput("input text is empty".into()));
        }
        state
            .persona
            .clone()
            .ok_or_else(|| AgentError::NoPersona(self.agent_id.clone()))
    }

    fn begin_run(&self, input: &TurnInput) -> Result<(TurnContext, CancellationToken), AgentError> {
        let mut state = self.state.write();
        let persona = self.preflight(&state, input)?;
        state.run_state = RunState::Running;
        state.cognitive = CognitiveState::Thinking;
        state.speaking = true;
        let session_id = state.session_id.clone();
        let memory = state.memory.clone();

        let cancel = CancellationToken::new();
        *self.turn_cancel.lock() = cancel.clone();
        drop(state);

        let mut vars = HashMap::new();
        vars.insert("agent_id".to_owned(), self.agent_id.to_string());
        vars.insert("persona_name".to_owned(), persona.name.clone());
        if let Some(sid) = &session_id {
            vars.insert("session_id".to_owned(), sid.to_string());
        }
        if let Some(h) = &input.handover {
            vars.insert("handover_from".to_owned(), h.from_agent.clone());
        }
        let system_prompt = persona.build_system_prompt(&vars);
        let ctx = TurnContext {
            agent_id: self.agent_id.clone(),
            session_id,
            persona,
            system_prompt,
            memory,
        };
        Ok((ctx, cancel))
    }

    async fn run_turn(
        self: Arc<Self>,
        input: TurnInput,
        ctx: TurnContext,
        tx: mpsc::Sender<TurnItem>,
        cancel: CancellationToken,
        _guard: OwnedMutexGuard<()>,
    ) {
        let started = Instant::now();
        self.emit_process_event("START_PROCESS", &ctx, &input.tag, json!({}))
            .await;
        self.set_cognitive(CognitiveState::Processing);

        let streaming = self.behavior.supports_streaming();
        let mut sink = TurnSink::new(tx.clone(), cancel.clone(), streaming);
        let generated = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AgentError::Canceled),
            result = self.behavior.generate(&input, &ctx, &mut sink) => result,
        };
        let outcome = match generated {
            Ok(_) if cancel.is_cancelled() => Err(AgentError::Canceled),
            Ok(text) => {
                let text = text.unwrap_or_else(|| sink.text().to_owned());
                match tx.send(Ok(TurnChunk::Final { text: text.clone() })).await {
                    Ok(()) => Ok(text),
                    Err(_) => Err(AgentError::Canceled),
                }
            }
            Err(e) => Err(e),
        };
        drop(sink);
        if let Err(e) = &outcome {
            let _ = tx.send(Err(e.clone())).await;
        }

        let elapsed = started.elapsed();
        self.end_run(&outcome, elapsed);

        let mut summary = json!({
            "ok": outcome.is_ok(),
            "latency_ms": elapsed.as_millis() as u64,
        });
        if let Err(e) = &outcome {
            summary["error"] = json!(e.to_string());
        }
        self.emit_process_event("END_PROCESS", &ctx, &input.tag, summary)
            .await;
    }

    fn end_run(&self, outcome: &Result<String, AgentError>, elapsed: Duration) {
        let failed = matches!(outcome, Err(e) if !e.is_canceled());
        {
            let mut state = self.state.write();
            state.speaking = false;
            if !state.is_closed() {
                let (run_state, cognitive) = match outcome {
                    Ok(_) => (RunState::Idle, CognitiveState::Ready),
                    Err(e) if e.is_canceled() => (RunState::Idle, CognitiveState::None),
                    Err(_) => (RunState::Error, CognitiveState::Error),
                };
                state.run_state = run_state;
                state.cognitive = cognitive;
            }
        }
        self.metrics.lock().record(elapsed, failed);

        if let Some(rec) = &self.recorder {
            let labels = [("agent_id", self.agent_id.as_str())];
            rec.counter_inc(names::AGENT_CALLS_TOTAL, &labels, 1);
            if failed {
                rec.counter_inc(names::AGENT_ERRORS_TOTAL, &labels, 1);
            }
            rec.histogram_observe(
                names::AGENT_CALL_DURATION_MS,
                &labels,
                elapsed.as_secs_f64() * 1000.0,
            );
        }
        match outcome {
            Ok(_) => debug!(
                agent_id = %self.agent_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "turn completed"
            ),
            Err(e) if e.is_canceled() => debug!(agent_id = %self.agent_id, "turn canceled"),
            Err(e) => warn!(
                agent_id = %self.agent_id,
                error = %e,
                kind = e.error_kind(),
                "turn failed"
            ),
        }
    }

    fn set_cognitive(&self, cognitive: CognitiveState) {
        let mut state = self.state.write();
        if !state.is_closed() {
            state.cognitive = cognitive;
        }
    }

    /// Cancels the current turn, if any.
    pub fn cancel_turn(&self) {
        self.turn_cancel.lock().cancel();
    }

    // ── Health ──────────────────────────────────────────────────────────

    pub fn heartbeat(&self) -> Beat {
        let beat = self.heartbeat.beat();
        if beat.missed {
            if let Some(rec) = &self.recorder {
                let labels = [("agent_id", self.agent_id.as_str())];
                rec.counter_inc(names::AGENT_HEARTBEATS_MISSED, &labels, 1);
            }
            let agent_id = self.agent_id.clone();
            let elapsed_ms = beat.elapsed.unwrap_or_default().as_millis() as u64;
            let interval_ms = self.heartbeat.interval().as_millis() as u64;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        warn!(%agent_id, elapsed_ms, interval_ms, "heartbeat missed");
                    });
                }
                Err(_) => warn!(%agent_id, elapsed_ms, interval_ms, "heartbeat missed"),
            }
        }
        beat
    }

    pub fn is_alive(&self) -> bool {
        !self.is_closed() && self.heartbeat.is_alive()
    }

    pub fn heartbeat_stats(&self) -> HeartbeatStats {
        self.heartbeat.stats()
    }

    pub fn call_stats(&self) -> CallStats {
        self.metrics.lock().snapshot()
    }

    pub fn health_score(&self) -> u8 {
        let (run_state, initialized) = {
            let state = self.state.read();
            (state.run_state, state.initialized)
        };
        let calls = self.call_stats();
        health_score(&HealthInputs {
            run_state,
            alive: self.is_alive(),
            initialized,
            calls: &calls,
            slow_call_threshold: Duration::from_millis(self.settings.slow_call_threshold_ms),
        })
    }

    pub fn status(&self) -> AgentStatus {
        let calls = self.call_stats();
        let alive = self.is_alive();
        let state = self.state.read();
        let health = health_score(&HealthInputs {
            run_state: state.run_state,
            alive,
            initialized: state.initialized,
            calls: &calls,
            slow_call_threshold: Duration::from_millis(self.settings.slow_call_threshold_ms),
        });
        AgentStatus {
            agent_id: self.agent_id.clone(),
            session_id: state.session_id.clone(),
            run_state: state.run_state,
            cognitive_state: state.cognitive,
            active: state.active,
            speaking: state.speaking,
            initialized: state.initialized,
            persona_id: state.persona.as_ref().map(|p| p.persona_id.clone()),
            memory_scope_id: state.persona.as_ref().map(|p| p.memory_scope_id.clone()),
            calls,
            heartbeat: self.heartbeat.stats(),
            alive,
            health_score: health,
        }
    }

    // ── Bus protocol ────────────────────────────────────────────────────

    async fn publish(&self, msg: Message) -> Result<(), AgentError> {
        let bus = self
            .bus()
            .ok_or_else(|| AgentError::NoSession(self.agent_id.clone()))?;
        bus.publish(msg).await?;
        Ok(())
    }

    async fn emit_process_event(&self, name: &str, ctx: &TurnContext, tag: &TurnTag, extra: Value) {
        let Some(bus) = self.bus() else {
            return;
        };
        let mut payload = json!({
            "agent_id": self.agent_id,
            "persona_id": ctx.persona.persona_id,
            "memory_scope_id": ctx.persona.memory_scope_id,
        });
        if let (Some(map), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            map.extend(extra);
        }
        let session_id = bus.session_id().clone();
        let msg = factory::event(session_id, self.agent_id.as_str(), name, payload, tag);
        if let Err(e) = bus.publish(msg).await {
            debug!(agent_id = %self.agent_id, event = name, error = %e, "process event dropped");
        }
    }

    /// Turns a failure into an ERROR for the orchestrator.
    async fn report_error(&self, tag: &TurnTag, err: &AgentError) {
        let Some(bus) = self.bus() else {
            warn!(agent_id = %self.agent_id, error = %err, "turn failed outside a session");
            return;
        };
        let mut msg = factory::error(
            bus.session_id().clone(),
            self.agent_id.as_str(),
            err.code(),
            err.to_string(),
            MessageTarget::System,
            tag,
        );
        msg.sender_type = SenderType::Agent;
        if let Err(e) = bus.publish(msg).await {
            warn!(agent_id = %self.agent_id, error = %e, "failed to report turn error");
        }
    }

    async fn accept_user_input(&self, msg: &Message) -> Result<(), HandlerError> {
        let tag = TurnTag::of(msg);
        let Some(this) = self.weak.upgrade() else {
            return Ok(());
        };
        let input = TurnInput::from_message(msg);
        let ready = {
            let state = self.state.read();
            self.preflight(&state, &input).map(|_| ())
        };
        if let Err(err) = ready {
            self.report_error(&tag, &err).await;
            return Ok(());
        }

        self.publish(factory::input_ack(msg.session_id.clone(), &self.agent_id, &tag))
            .await?;

        let handover = self.state.write().handover.take();
        let input = input.with_handover(handover);
        debug!(agent_id = %self.agent_id, turn_id = ?tag.turn_id, "input acknowledged");
        tokio::spawn(this.drive_turn(input));
        Ok(())
    }

    async fn drive_turn(self: Arc<Self>, input: TurnInput) {
        let tag = input.tag.clone();
        let (mut stream, cancel) = match self.open_turn(input).await {
            Ok(opened) => opened,
            Err(err) => {
                self.report_error(&tag, &err).await;
                return;
            }
        };
        // The persona is locked while speaking, so the scope holds for the run.
        let scope = self.memory_scope_id();
        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                // Deltas buffered before the cancel are drained, not sent.
                continue;
            }
            let Some(bus) = self.bus() else {
                debug!(agent_id = %self.agent_id, "left session mid-turn");
                self.cancel_turn();
                break;
            };
            let session_id = bus.session_id().clone();
            let msg = match item {
                Ok(TurnChunk::Delta { seq, text }) => {
                    factory::agent_chunk(session_id, &self.agent_id, text, seq, &tag)
                }
                Ok(TurnChunk::Final { text }) => {
                    let mut msg = factory::agent_final(session_id, &self.agent_id, text, &tag);
                    if let Some(scope) = &scope {
                        msg.metadata
                            .extra
                            .insert(MEMORY_SCOPE_KEY.into(), Value::String(scope.clone()));
                    }
                    msg
                }
                Err(err) if err.is_canceled() => continue,
                Err(err) => {
                    self.report_error(&tag, &err).await;
                    continue;
                }
            };
            if let Err(e) = bus.publish(msg).await {
                warn!(agent_id = %self.agent_id, error = %e, "failed to publish turn output");
                self.cancel_turn();
            }
        }
    }

    async fn acknowledge_cancel(&self, msg: &Message) -> Result<(), HandlerError> {
        self.cancel_turn();
        let mut tag = TurnTag::of(msg);
        if tag.turn_id.is_none() {
            tag.turn_id = msg.payload.get_str("turn_id").map(TurnId::from_raw);
        }
        info!(agent_id = %self.agent_id, turn_id = ?tag.turn_id, "cancel requested");
        self.publish(factory::cancel_ack(msg.session_id.clone(), &self.agent_id, &tag))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OnMessage for Agent {
    async fn on_message(&self, msg: &Message) -> Result<(), HandlerError> {
        if msg.target != MessageTarget::Agent || msg.target_id.as_ref() != Some(&self.agent_id) {
            return Ok(());
        }
        if self.session_id().as_ref() != Some(&msg.session_id) {
            debug!(
                agent_id = %self.agent_id,
                session_id = %msg.session_id,
                "message for another session"
            );
            return Ok(());
        }
        match msg.event() {
            MessageEvent::UserInput => self.accept_user_input(msg).await,
            MessageEvent::Control => match msg.control_subtype() {
                Some(subtype) if subtype.is_cancel() => self.acknowledge_cancel(msg).await,
                Some(ControlSubtype::HandoverContext) => {
                    let ctx = HandoverContext::from_message(msg);
                    debug!(
                        agent_id = %self.agent_id,
                        from_agent = %ctx.from_agent,
                        "handover context received"
                    );
                    self.state.write().handover = Some(ctx);
                    Ok(())
                }
                other => {
                    debug!(agent_id = %self.agent_id, subtype = ?other, "control ignored");
                    Ok(())
                }
            },
            other => {
                debug!(agent_id = %self.agent_id, event = other.as_str(), "message ignored");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl SessionMember for Agent {
    fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    fn join_session(&self, session_id: SessionId, bus: Arc<MessageBus>) -> Result<(), AgentError> {
        let mut state = self.state.write();
        if state.is_closed() {
            return Err(AgentError::Closed(self.agent_id.clone()));
        }
        info!(agent_id = %self.agent_id, %session_id, "joined session");
        state.session_id = Some(session_id);
        state.active = true;
        *self.bus.write() = Some(bus);
        Ok(())
    }

    fn leave_session(&self) {
        self.cancel_turn();
        let session_id = {
            let mut state = self.state.write();
            state.active = false;
            state.speaking = false;
            state.handover = None;
            state.memory = None;
            state.session_id.take()
        };
        *self.bus.write() = None;
        if let Some(session_id) = session_id {
            info!(agent_id = %self.agent_id, %session_id, "left session");
        }
    }

    fn release_speaking(&self) {
        self.cancel_turn();
        self.state.write().speaking = false;
    }

    fn into_handler(self: Arc<Self>) -> Arc<dyn OnMessage> {
        self
    }

    async fn close(&self) {
        Agent::close(self).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parley_bus::{Delivery, FnSubscriber};
    use parley_settings::BusSettings;
    use tokio::sync::{mpsc::UnboundedReceiver, Notify};

    use super::*;
    use crate::behavior::EchoBehavior;

    /// Holds every turn until released; counts concurrency and teardowns.
    #[derive(Default)]
    struct Gate {
        release: Notify,
        running: AtomicUsize,
        max_running: AtomicUsize,
        teardowns: AtomicUsize,
        scopes: parking_lot::Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl AgentBehavior for Gate {
        async fn generate(
            &self,
            input: &TurnInput,
            _ctx: &TurnContext,
            sink: &mut TurnSink,
        ) -> Result<Option<String>, AgentError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            sink.send("partial").await?;
            self.release.notified().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(format!("done: {}", input.text)))
        }

        fn on_memory_scope(&self, scope: Option<&str>) {
            self.scopes.lock().push(scope.map(str::to_owned));
        }

        async fn teardown(&self, _agent_id: &AgentId) -> Result<(), AgentError> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Queues a few deltas at once, then cancels its own agent before the
    /// output loop gets to run.
    #[derive(Default)]
    struct Burst {
        agent: parking_lot::Mutex<Weak<Agent>>,
    }

    #[async_trait]
    impl AgentBehavior for Burst {
        async fn generate(
            &self,
            _input: &TurnInput,
            _ctx: &TurnContext,
            sink: &mut TurnSink,
        ) -> Result<Option<String>, AgentError> {
            for part in ["one ", "two ", "three"] {
                sink.send(part).await?;
            }
            if let Some(agent) = self.agent.lock().upgrade() {
                agent.cancel_turn();
            }
            Ok(Some("never sent".into()))
        }
    }

    /// Answers with what memory recalls for the turn.
    struct Recalling;

    #[async_trait]
    impl AgentBehavior for Recalling {
        async fn generate(
            &self,
            _input: &TurnInput,
            ctx: &TurnContext,
            _sink: &mut TurnSink,
        ) -> Result<Option<String>, AgentError> {
            let recalled: Vec<String> = ctx.recall().into_iter().map(|m| m.content).collect();
            Ok(Some(recalled.join("|")))
        }
    }

    struct Failing;

    #[async_trait]
    impl AgentBehavior for Failing {
        async fn generate(
            &self,
            _input: &TurnInput,
            _ctx: &TurnContext,
            _sink: &mut TurnSink,
        ) -> Result<Option<String>, AgentError> {
            Err(HandlerError::new(parley_core::ErrorCode::ModelError, "model unavailable").into())
        }
    }

    fn persona(id: &str) -> PersonaMatrix {
        PersonaMatrix::new(id, format!("Persona {id}"), format!("scope-{id}"))
    }

    fn session() -> (SessionId, Arc<MessageBus>) {
        let sid = SessionId::from_raw("s1");
        let bus = MessageBus::new(sid.clone(), &BusSettings::default());
        (sid, bus)
    }

    async fn ready_agent(
        id: &str,
        behavior: Arc<dyn AgentBehavior>,
    ) -> (Arc<Agent>, Arc<MessageBus>) {
        let (sid, bus) = session();
        let agent = Agent::new(AgentId::from_raw(id), behavior, AgentSettings::default());
        agent.join_session(sid, bus.clone()).unwrap();
        agent.attach_persona(persona(id)).unwrap();
        (agent, bus)
    }

    fn observe(bus: &MessageBus) -> UnboundedReceiver<Message> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(
            "observer",
            FnSubscriber::new(move |m: &Message| {
                let _ = tx.send(m.clone());
            }),
            Delivery::Broadcast,
        );
        rx
    }

    async fn next_from(rx: &mut UnboundedReceiver<Message>, sender: &str) -> Message {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for message")
                .expect("observer closed");
            if msg.sender_id == sender && msg.event() != MessageEvent::Event {
                return msg;
            }
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn process_requires_persona_and_session() {
        let agent = Agent::new(
            AgentId::from_raw("a"),
            Arc::new(EchoBehavior::new()),
            AgentSettings::default(),
        );
        assert!(matches!(agent.attach_persona(persona("a")), Err(AgentError::NoSession(_))));

        let (sid, bus) = session();
        agent.join_session(sid, bus).unwrap();
        assert!(matches!(
            agent.process(TurnInput::new("hi")).await,
            Err(AgentError::NoPersona(_))
        ));

        agent.attach_persona(persona("a")).unwrap();
        assert_eq!(agent.process(TurnInput::new("hi")).await.unwrap(), "Persona a: hi");
        assert_eq!(agent.run_state(), RunState::Idle);
        assert_eq!(agent.cognitive_state(), CognitiveState::Ready);
        assert!(agent.is_initialized());
    }

    #[tokio::test]
    async fn preflight_rejects_empty_and_inactive() {
        let (agent, _bus) = ready_agent("a", Arc::new(EchoBehavior::new())).await;
        assert!(matches!(
            agent.process(TurnInput::new("   ")).await,
            Err(AgentError::InvalidInput(_))
        ));
        agent.switch_active(false).unwrap();
        assert!(matches!(
            agent.process(TurnInput::new("hi")).await,
            Err(AgentError::NotActive(_))
        ));
        assert_eq!(agent.call_stats().total_calls, 0);
    }

    #[tokio::test]
    async fn persona_is_locked_while_speaking() {
        let gate = Arc::new(Gate::default());
        let (agent, _bus) = ready_agent("a", gate.clone()).await;

        let mut stream = agent.process_stream(TurnInput::new("hi")).await.unwrap();
        assert!(agent.is_speaking());
        assert!(matches!(agent.attach_persona(persona("b")), Err(AgentError::SpeakingLocked(_))));
        assert!(matches!(agent.detach_persona(), Err(AgentError::SpeakingLocked(_))));
        assert!(matches!(agent.switch_active(false), Err(AgentError::SpeakingLocked(_))));
        assert_eq!(agent.memory_scope_id().as_deref(), Some("scope-a"));

        gate.release.notify_one();
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item.unwrap());
        }
        assert_eq!(
            items,
            vec![
                TurnChunk::Delta { seq: 0, text: "partial".into() },
                TurnChunk::Final { text: "done: hi".into() },
            ]
        );
        assert!(!agent.is_speaking());

        agent.attach_persona(persona("b")).unwrap();
        assert_eq!(agent.memory_scope_id().as_deref(), Some("scope-b"));
        assert_eq!(
            *gate.scopes.lock(),
            vec![Some("scope-a".to_owned()), Some("scope-b".to_owned())]
        );
    }

    #[tokio::test]
    async fn persona_switch_changes_memory_scope() {
        let (sid, bus) = session();
        let manager = Arc::new(MemoryManager::in_process());
        let agent =
            Agent::new(AgentId::from_raw("a"), Arc::new(Recalling), AgentSettings::default());
        agent.set_memory_manager(manager.clone());
        agent.join_session(sid.clone(), bus).unwrap();

        agent.attach_persona(persona("a")).unwrap();
        let view = agent.memory().unwrap();
        assert_eq!(view.scope_id(), "scope-a");
        view.remember_long_term("likes tea");
        manager
            .load_session(&sid)
            .remember(parley_memory::MemoryItem::new("u1", parley_memory::SESSION_SCOPE, "hello"));
        assert_eq!(agent.process(TurnInput::new("hi")).await.unwrap(), "likes tea|hello");

        agent.attach_persona(persona("b")).unwrap();
        let view = agent.memory().unwrap();
        assert_eq!(view.scope_id(), "scope-b");
        assert!(view.memories().is_empty());
        assert_eq!(agent.process(TurnInput::new("hi")).await.unwrap(), "hello");

        agent.detach_persona().unwrap();
        assert!(agent.memory().is_none());
        agent.attach_persona(persona("a")).unwrap();
        assert_eq!(agent.memory().unwrap().long_term()[0].content, "likes tea");
        agent.leave_session();
        assert!(agent.memory().is_none());
    }

    #[tokio::test]
    async fn runs_are_serialized() {
        let gate = Arc::new(Gate::default());
        let (agent, _bus) = ready_agent("a", gate.clone()).await;

        let first = tokio::spawn({
            let agent = agent.clone();
            async move { agent.process(TurnInput::new("one")).await }
        });
        let second = tokio::spawn({
            let agent = agent.clone();
            async move { agent.process(TurnInput::new("two")).await }
        });

        wait_until(|| gate.running.load(Ordering::SeqCst) == 1).await;
        gate.release.notify_one();
        wait_until(|| agent.call_stats().total_calls == 1).await;
        wait_until(|| gate.running.load(Ordering::SeqCst) == 1).await;
        gate.release.notify_one();

        let mut outputs = vec![first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        outputs.sort();
        assert_eq!(outputs, vec!["done: one", "done: two"]);
        assert_eq!(gate.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(agent.call_stats().total_calls, 2);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let gate = Arc::new(Gate::default());
        let (agent, _bus) = ready_agent("a", gate.clone()).await;
        agent.close().await;
        agent.close().await;
        assert_eq!(gate.teardowns.load(Ordering::SeqCst), 1);
        assert_eq!(agent.run_state(), RunState::Closed);
        assert!(!agent.is_active());
        assert!(!agent.is_alive());
        assert_eq!(agent.health_score(), 0);
        assert!(matches!(
            agent.process(TurnInput::new("hi")).await,
            Err(AgentError::Closed(_))
        ));
        assert!(matches!(agent.switch_active(true), Err(AgentError::Closed(_))));
    }

    #[tokio::test]
    async fn failure_sets_error_state_and_counts() {
        let (agent, _bus) = ready_agent("a", Arc::new(Failing)).await;
        let err = agent.process(TurnInput::new("hi")).await.unwrap_err();
        assert!(matches!(err, AgentError::Handler(_)));
        assert_eq!(agent.run_state(), RunState::Error);
        assert_eq!(agent.cognitive_state(), CognitiveState::Error);
        let stats = agent.call_stats();
        assert_eq!((stats.total_calls, stats.total_errors), (1, 1));
        assert_eq!(agent.health_score(), 40);
    }

    #[tokio::test]
    async fn non_streaming_behavior_yields_single_final() {
        let behavior = Arc::new(EchoBehavior::new().with_streaming(false));
        let (agent, _bus) = ready_agent("a", behavior).await;
        let mut stream = agent.process_stream(TurnInput::new("hello world")).await.unwrap();
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item.unwrap());
        }
        assert_eq!(items, vec![TurnChunk::Final { text: "Persona a: hello world".into() }]);
    }

    #[tokio::test]
    async fn user_input_is_acked_before_output() {
        let (agent, bus) = ready_agent("alpha", Arc::new(EchoBehavior::new())).await;
        bus.subscribe("alpha", agent.clone().into_handler(), Delivery::Directed);
        let mut rx = observe(&bus);

        let tag = TurnTag::new(parley_core::TraceId::new(), TurnId::from_raw("turn_1"));
        let mut msg = factory::user_input(bus.session_id().clone(), "u1", "hi there")
            .to_agent(AgentId::from_raw("alpha"));
        msg.metadata.trace_id = tag.trace_id.clone();
        msg.metadata.turn_id = tag.turn_id.clone();
        bus.publish(msg).await.unwrap();

        let ack = next_from(&mut rx, "alpha").await;
        assert_eq!(ack.control_subtype(), Some(ControlSubtype::InputAck));
        assert_eq!(ack.turn_id(), tag.turn_id.as_ref());

        let mut seqs = Vec::new();
        let final_msg = loop {
            let m = next_from(&mut rx, "alpha").await;
            assert_eq!(m.event(), MessageEvent::AgentOutput);
            assert_eq!(m.turn_id(), tag.turn_id.as_ref());
            if m.is_final() {
                break m;
            }
            seqs.push(m.metadata.stream.as_ref().and_then(|s| s.seq).unwrap());
        };
        assert_eq!(seqs, vec![0, 1, 2, 3]);
        assert_eq!(final_msg.payload.as_text(), Some("Persona alpha: hi there"));
        assert!(final_msg.should_persist());
        assert_eq!(final_msg.metadata.extra[MEMORY_SCOPE_KEY], "scope-alpha");
    }

    #[tokio::test]
    async fn cancel_is_acked_and_suppresses_final() {
        let gate = Arc::new(Gate::default());
        let (agent, bus) = ready_agent("alpha", gate.clone()).await;
        bus.subscribe("alpha", agent.clone().into_handler(), Delivery::Directed);
        let mut rx = observe(&bus);
        let sid = bus.session_id().clone();
        let alpha = AgentId::from_raw("alpha");

        bus.publish(factory::user_input(sid.clone(), "u1", "hi").to_agent(alpha.clone()))
            .await
            .unwrap();
        let ack = next_from(&mut rx, "alpha").await;
        assert_eq!(ack.control_subtype(), Some(ControlSubtype::InputAck));
        let chunk = next_from(&mut rx, "alpha").await;
        assert!(chunk.is_chunk());

        let tag = TurnTag {
            trace_id: None,
            turn_id: Some(TurnId::from_raw("turn_9")),
        };
        bus.publish(
            factory::control(
                sid,
                "session_runtime",
                SenderType::System,
                ControlSubtype::Cancel,
                json!({"reason": "user_interrupt"}),
                MessageTarget::Agent,
                &tag,
            )
            .to_agent(alpha),
        )
        .await
        .unwrap();

        let cancel_ack = next_from(&mut rx, "alpha").await;
        assert_eq!(cancel_ack.control_subtype(), Some(ControlSubtype::CancelAck));
        assert_eq!(cancel_ack.turn_id().map(TurnId::as_str), Some("turn_9"));

        wait_until(|| !agent.is_speaking() && agent.run_state() == RunState::Idle).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(m) = rx.try_recv() {
            assert!(
                !(m.sender_id == "alpha" && m.event() == MessageEvent::AgentOutput && m.is_final()),
                "final emitted after cancel"
            );
        }
        assert_eq!(agent.call_stats().total_errors, 0);
    }

    #[tokio::test]
    async fn buffered_deltas_are_not_sent_after_cancel() {
        let burst = Arc::new(Burst::default());
        let (agent, bus) = ready_agent("alpha", burst.clone()).await;
        *burst.agent.lock() = Arc::downgrade(&agent);
        bus.subscribe("alpha", agent.clone().into_handler(), Delivery::Directed);
        let mut rx = observe(&bus);

        let go = factory::user_input(bus.session_id().clone(), "u1", "go")
            .to_agent(AgentId::from_raw("alpha"));
        bus.publish(go).await.unwrap();
        let ack = next_from(&mut rx, "alpha").await;
        assert_eq!(ack.control_subtype(), Some(ControlSubtype::InputAck));

        wait_until(|| agent.run_state() == RunState::Idle && !agent.is_speaking()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(m) = rx.try_recv() {
            assert_ne!(
                m.event(),
                MessageEvent::AgentOutput,
                "output sent after cancel: {:?}",
                m.payload
            );
        }
        assert_eq!(agent.call_stats().total_errors, 0);
    }

    #[tokio::test]
    async fn handover_context_feeds_next_turn() {
        let (agent, bus) = ready_agent("alpha", Arc::new(EchoBehavior::new())).await;
        bus.subscribe("alpha", agent.clone().into_handler(), Delivery::Directed);
        let mut rx = observe(&bus);
        let sid = bus.session_id().clone();
        let alpha = AgentId::from_raw("alpha");

        bus.publish(
            factory::control(
                sid.clone(),
                "session_runtime",
                SenderType::System,
                ControlSubtype::HandoverContext,
                json!({
                    "from_agent": "beta",
                    "prev_output": "earlier",
                    "reason": "handover_confirmed",
                }),
                MessageTarget::Agent,
                &TurnTag::none(),
            )
            .to_agent(alpha.clone()),
        )
        .await
        .unwrap();
        bus.publish(factory::user_input(sid, "u1", "continue").to_agent(alpha))
            .await
            .unwrap();

        let final_msg = loop {
            let m = next_from(&mut rx, "alpha").await;
            if m.event() == MessageEvent::AgentOutput && m.is_final() {
                break m;
            }
        };
        assert_eq!(final_msg.payload.as_text(), Some("Persona alpha (after beta): continue"));
    }

    #[tokio::test]
    async fn input_without_persona_reports_error() {
        let (sid, bus) = session();
        let agent = Agent::new(
            AgentId::from_raw("alpha"),
            Arc::new(EchoBehavior::new()),
            AgentSettings::default(),
        );
        agent.join_session(sid.clone(), bus.clone()).unwrap();
        bus.subscribe("alpha", agent.clone().into_handler(), Delivery::Directed);
        let mut rx = observe(&bus);

        bus.publish(factory::user_input(sid, "u1", "hi").to_agent(AgentId::from_raw("alpha")))
            .await
            .unwrap();
        let err = next_from(&mut rx, "alpha").await;
        assert_eq!(err.event(), MessageEvent::Error);
        assert_eq!(err.target, MessageTarget::System);
        assert_eq!(err.sender_type, SenderType::Agent);
    }

    #[tokio::test]
    async fn ignores_messages_for_other_agents() {
        let gate = Arc::new(Gate::default());
        let (agent, bus) = ready_agent("alpha", gate.clone()).await;
        let sid = bus.session_id().clone();
        let other = factory::user_input(sid, "u1", "hi").to_agent(AgentId::from_raw("beta"));
        agent.on_message(&other).await.unwrap();
        assert!(!agent.is_speaking());
        assert_eq!(gate.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeat_is_counted() {
        let recorder = Arc::new(MetricsRecorder::new());
        let settings = AgentSettings {
            heartbeat_interval_ms: 1_000,
            ..AgentSettings::default()
        };
        let agent = Agent::with_metrics(
            AgentId::from_raw("a"),
            Arc::new(EchoBehavior::new()),
            settings,
            Some(recorder.clone()),
        );
        assert!(!agent.heartbeat().missed);
        tokio::time::advance(Duration::from_millis(1_200)).await;
        assert!(!agent.heartbeat().missed);
        tokio::time::advance(Duration::from_millis(1_600)).await;
        assert!(agent.heartbeat().missed);
        assert!(agent.is_alive());
        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert!(!agent.is_alive());

        assert_eq!(
            recorder.counter_get(names::AGENT_HEARTBEATS_MISSED, &[("agent_id", "a")]),
            1
        );
        assert_eq!(agent.heartbeat_stats().missed, 1);
    }

    #[tokio::test]
    async fn status_snapshot_serializes() {
        let (agent, _bus) = ready_agent("a", Arc::new(EchoBehavior::new())).await;
        agent.process(TurnInput::new("hi")).await.unwrap();
        let status = agent.status();
        assert_eq!(status.persona_id.as_deref(), Some("a"));
        assert_eq!(status.calls.total_calls, 1);
        assert_eq!(status.health_score, 100);
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["run_state"], "IDLE");
        assert_eq!(value["memory_scope_id"], "scope-a");
    }
}
