//! Session manager: open, look up and close sessions, and carry out the
//! add/remove-agent requests the orchestrator forwards to `system`.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parley_agent::{Agent, AgentBehavior, AgentError, AgentStatus};
use parley_bus::{Delivery, MessageBus, OnMessage};
use parley_core::factory::{self, TurnTag};
use parley_core::{
    AgentId, ControlSubtype, HandlerError, Message, MessageTarget, PersonaMatrix, SenderType,
    SessionId, Visibility, ROUTED_BY_SESSION,
};
use parley_memory::{MemoryManager, MemoryRecorder, SessionMemory};
use parley_settings::{AgentSettings, BusSettings, ParleySettings, SessionSettings};
use parley_telemetry::MetricsRecorder;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::SessionError;
use crate::orchestrator::SessionOrchestrator;

/// Builds the agent behind an id requested at runtime.
#[async_trait]
pub trait AgentProvisioner: Send + Sync {
    async fn provision(&self, agent_id: &AgentId) -> Result<Arc<Agent>, AgentError>;
}

/// Gives every agent the same behavior instance.
pub struct SharedBehaviorProvisioner {
    behavior: Arc<dyn AgentBehavior>,
    settings: AgentSettings,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SharedBehaviorProvisioner {
    pub fn new(behavior: Arc<dyn AgentBehavior>, settings: AgentSettings) -> Self {
        Self {
            behavior,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl AgentProvisioner for SharedBehaviorProvisioner {
    async fn provision(&self, agent_id: &AgentId) -> Result<Arc<Agent>, AgentError> {
        Ok(Agent::with_metrics(
            agent_id.clone(),
            self.behavior.clone(),
            self.settings.clone(),
            self.metrics.clone(),
        ))
    }
}

/// Persona used when a request names none.
fn default_persona(agent_id: &AgentId) -> PersonaMatrix {
    PersonaMatrix::new(agent_id.as_str(), agent_id.as_str(), format!("scope-{agent_id}"))
}

/// One open session: its bus, orchestrator, memory and the agents it owns.
pub struct SessionHandle {
    session_id: SessionId,
    bus: Arc<MessageBus>,
    orchestrator: Arc<SessionOrchestrator>,
    memory: Arc<MemoryManager>,
    agents: DashMap<AgentId, Arc<Agent>>,
    provisioner: Arc<dyn AgentProvisioner>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.orchestrator
    }

    /// What the session remembers so far.
    pub fn memory(&self) -> Option<Arc<SessionMemory>> {
        self.memory.session(&self.session_id)
    }

    pub fn agent(&self, agent_id: &AgentId) -> Option<Arc<Agent>> {
        self.agents.get(agent_id).map(|a| a.clone())
    }

    pub fn agent_statuses(&self) -> Vec<AgentStatus> {
        let mut statuses: Vec<_> = self.agents.iter().map(|a| a.status()).collect();
        statuses.sort_by(|a, b| a.agent_id.as_str().cmp(b.agent_id.as_str()));
        statuses
    }

    /// Provisions, registers and attaches a persona. An id that is already
    /// present returns the existing agent.
    #[instrument(skip(self, persona), fields(session_id = %self.session_id))]
    pub async fn add_agent(
        &self,
        agent_id: AgentId,
        persona: Option<PersonaMatrix>,
        make_active: bool,
    ) -> Result<Arc<Agent>, SessionError> {
        if let Some(existing) = self.agent(&agent_id) {
            debug!(%agent_id, "agent already present");
            return Ok(existing);
        }
        let persona = persona.unwrap_or_else(|| default_persona(&agent_id));
        persona.validate().map_err(AgentError::from)?;

        let agent = self.provisioner.provision(&agent_id).await?;
        agent.set_memory_manager(self.memory.clone());
        agent.initialize().await?;
        self.orchestrator.register_agent(agent.clone(), make_active).await?;
        if let Err(e) = agent.attach_persona(persona) {
            let _ = self.orchestrator.unregister_agent(&agent_id);
            agent.close().await;
            return Err(e.into());
        }
        let _ = self.agents.insert(agent_id.clone(), agent.clone());
        info!(%agent_id, "agent added");
        Ok(agent)
    }

    /// Unregisters and closes the agent. Returns false if it was not here.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn remove_agent(&self, agent_id: &AgentId) -> bool {
        let _ = self.orchestrator.unregister_agent(agent_id);
        let Some((_, agent)) = self.agents.remove(agent_id) else {
            return false;
        };
        agent.close().await;
        info!(%agent_id, "agent removed");
        true
    }

    async fn close(&self) {
        let _ = self.orchestrator.shutdown();
        let agents: Vec<_> = self.agents.iter().map(|a| a.clone()).collect();
        self.agents.clear();
        let _ = join_all(agents.iter().map(|a| a.close())).await;
        self.bus.close().await;
        self.memory.close_session(&self.session_id);
    }

    fn reply(&self, subtype: ControlSubtype, payload: Value, tag: &TurnTag) -> Message {
        let mut msg = factory::control(
            self.session_id.clone(),
            "system",
            SenderType::System,
            subtype,
            payload,
            MessageTarget::Frontend,
            tag,
        );
        msg.metadata.visibility = Visibility::Frontend;
        msg
    }

    async fn handle_add_request(&self, msg: &Message) {
        let tag = TurnTag::of(msg);
        let agent_id = msg.payload.get_str("agent_id").map(AgentId::from_raw);
        let make_active = msg
            .payload
            .get("make_active")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let outcome = match &agent_id {
            None => Err(SessionError::InvalidRequest(
                "REQUEST_ADD_AGENT requires agent_id".into(),
            )),
            Some(agent_id) => {
                let persona = msg
                    .payload
                    .get("persona")
                    .filter(|v| !v.is_null())
                    .map(|v| PersonaMatrix::from_value(v.clone()))
                    .transpose()
                    .map_err(|e| SessionError::Agent(e.into()));
                match persona {
                    Ok(persona) => self
                        .add_agent(agent_id.clone(), persona, make_active)
                        .await
                        .map(|_| ()),
                    Err(e) => Err(e),
                }
            }
        };

        let reply = match outcome {
            Ok(()) => self.reply(
                ControlSubtype::AddAgentDone,
                json!({"agent_id": agent_id}),
                &tag,
            ),
            Err(e) => {
                warn!(
                    session_id = %self.session_id,
                    agent_id = ?agent_id,
                    error = %e,
                    "add agent failed"
                );
                self.reply(
                    ControlSubtype::AddAgentFailed,
                    json!({"agent_id": agent_id, "code": e.code(), "error": e.to_string()}),
                    &tag,
                )
            }
        };
        if let Err(e) = self.bus.publish(reply).await {
            debug!(session_id = %self.session_id, error = %e, "add agent reply dropped");
        }
    }

    async fn handle_remove_request(&self, msg: &Message) {
        let tag = TurnTag::of(msg);
        let agent_id = msg.payload.get_str("agent_id").map(AgentId::from_raw);
        let removed = match &agent_id {
            Some(agent_id) => self.remove_agent(agent_id).await,
            None => false,
        };
        let reply = if removed {
            self.reply(
                ControlSubtype::RemoveAgentDone,
                json!({"agent_id": agent_id}),
                &tag,
            )
        } else {
            self.reply(
                ControlSubtype::RemoveAgentFailed,
                json!({"agent_id": agent_id, "error": "agent not found"}),
                &tag,
            )
        };
        if let Err(e) = self.bus.publish(reply).await {
            debug!(session_id = %self.session_id, error = %e, "remove agent reply dropped");
        }
    }
}

/// Listens on `system` for the lifecycle requests the orchestrator forwards.
struct LifecycleListener {
    handle: Weak<SessionHandle>,
}

#[async_trait]
impl OnMessage for LifecycleListener {
    async fn on_message(&self, msg: &Message) -> Result<(), HandlerError> {
        if msg.metadata.routed_by.as_deref() != Some(ROUTED_BY_SESSION) {
            return Ok(());
        }
        let Some(subtype) = msg.control_subtype() else {
            return Ok(());
        };
        if !matches!(
            subtype,
            ControlSubtype::RequestAddAgent | ControlSubtype::RequestRemoveAgent
        ) {
            return Ok(());
        }
        let Some(handle) = self.handle.upgrade() else {
            return Ok(());
        };
        // Provisioning may be slow; keep the bus loop free.
        let msg = msg.clone();
        tokio::spawn(async move {
            match subtype {
                ControlSubtype::RequestAddAgent => handle.handle_add_request(&msg).await,
                _ => handle.handle_remove_request(&msg).await,
            }
        });
        Ok(())
    }
}

/// Owns every open session of the process.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    bus_settings: BusSettings,
    session_settings: SessionSettings,
    provisioner: Arc<dyn AgentProvisioner>,
    memory: Arc<MemoryManager>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl SessionManager {
    pub fn new(settings: &ParleySettings, provisioner: Arc<dyn AgentProvisioner>) -> Self {
        Self {
            sessions: DashMap::new(),
            bus_settings: settings.bus.clone(),
            session_settings: settings.session.clone(),
            provisioner,
            memory: Arc::new(MemoryManager::new(settings.memory.clone())),
            metrics: None,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Opens a session under a fresh id.
    pub fn open_session(&self) -> Arc<SessionHandle> {
        self.open_session_with_id(SessionId::new())
    }

    /// Opens a session, or returns the one already open under `session_id`.
    /// Must be called inside a tokio runtime.
    #[instrument(skip_all, fields(%session_id))]
    pub fn open_session_with_id(&self, session_id: SessionId) -> Arc<SessionHandle> {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                let bus = MessageBus::with_metrics(
                    session_id.clone(),
                    &self.bus_settings,
                    self.metrics.clone(),
                );
                let orchestrator = SessionOrchestrator::with_metrics(
                    bus.clone(),
                    self.session_settings.clone(),
                    self.metrics.clone(),
                );
                let handle = Arc::new(SessionHandle {
                    session_id: session_id.clone(),
                    bus: bus.clone(),
                    orchestrator,
                    memory: self.memory.clone(),
                    agents: DashMap::new(),
                    provisioner: self.provisioner.clone(),
                });
                let listener = Arc::new(LifecycleListener {
                    handle: Arc::downgrade(&handle),
                });
                bus.subscribe("system", listener, Delivery::Directed);
                let remembered = self.memory.load_session(&session_id).len();
                let recorder = MemoryRecorder::new(self.memory.clone());
                bus.subscribe("memory", recorder, Delivery::Broadcast);
                info!(remembered, "session opened");
                handle
            })
            .clone()
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stops the orchestrator, closes every agent, then the bus.
    #[instrument(skip_all, fields(%session_id))]
    pub async fn close_session(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let (_, handle) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))?;
        handle.close().await;
        info!("session closed");
        Ok(())
    }

    pub async fn close_all(&self) {
        for session_id in self.session_ids() {
            let _ = self.close_session(&session_id).await;
        }
    }
}
