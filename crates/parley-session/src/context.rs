//! Who is in the session, who is active, who holds the floor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parley_agent::SessionMember;
use parley_core::{AgentId, TurnId};

/// An agent's handover request waiting for the user's answer.
#[derive(Clone, Debug)]
pub struct PendingHandover {
    pub from_agent: AgentId,
    pub turn_id: Option<TurnId>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct SessionContext {
    members: Vec<Arc<dyn SessionMember>>,
    active: Option<AgentId>,
    speaking: Option<AgentId>,
    pending_handover: Option<PendingHandover>,
}

impl SessionContext {
    pub fn contains(&self, agent_id: &AgentId) -> bool {
        self.members.iter().any(|m| m.agent_id() == agent_id)
    }

    pub fn member(&self, agent_id: &AgentId) -> Option<Arc<dyn SessionMember>> {
        self.members.iter().find(|m| m.agent_id() == agent_id).cloned()
    }

    /// Registration order.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.members.iter().map(|m| m.agent_id().clone()).collect()
    }

    pub fn first_agent(&self) -> Option<AgentId> {
        self.members.first().map(|m| m.agent_id().clone())
    }

    /// Returns false if the id is already present.
    pub fn add(&mut self, member: Arc<dyn SessionMember>) -> bool {
        if self.contains(member.agent_id()) {
            return false;
        }
        self.members.push(member);
        true
    }

    /// Removes the member and clears any pointer to it.
    pub fn remove(&mut self, agent_id: &AgentId) -> Option<Arc<dyn SessionMember>> {
        let idx = self.members.iter().position(|m| m.agent_id() == agent_id)?;
        if self.active.as_ref() == Some(agent_id) {
            self.active = None;
        }
        if self.speaking.as_ref() == Some(agent_id) {
            self.speaking = None;
        }
        if self
            .pending_handover
            .as_ref()
            .is_some_and(|p| &p.from_agent == agent_id)
        {
            self.pending_handover = None;
        }
        Some(self.members.remove(idx))
    }

    pub fn active(&self) -> Option<&AgentId> {
        self.active.as_ref()
    }

    /// Returns the previous active agent.
    pub fn set_active(&mut self, agent_id: AgentId) -> Option<AgentId> {
        self.active.replace(agent_id)
    }

    pub fn speaking(&self) -> Option<&AgentId> {
        self.speaking.as_ref()
    }

    /// Gives the floor to `agent_id` unless someone else holds it; the error
    /// carries the holder.
    pub fn claim_speaking(&mut self, agent_id: &AgentId) -> Result<(), AgentId> {
        match &self.speaking {
            Some(holder) if holder != agent_id => Err(holder.clone()),
            Some(_) => Ok(()),
            None => {
                self.speaking = Some(agent_id.clone());
                Ok(())
            }
        }
    }

    /// Releases the floor at the end of `agent_id`'s output. Fails if
    /// another agent holds it.
    pub fn finish_speaking(&mut self, agent_id: &AgentId) -> Result<(), AgentId> {
        match &self.speaking {
            Some(holder) if holder != agent_id => Err(holder.clone()),
            _ => {
                self.speaking = None;
                Ok(())
            }
        }
    }

    /// Clears the floor only if `agent_id` holds it.
    pub fn release_if_speaking(&mut self, agent_id: &AgentId) -> bool {
        if self.speaking.as_ref() == Some(agent_id) {
            self.speaking = None;
            true
        } else {
            false
        }
    }

    pub fn pending_handover(&self) -> Option<&PendingHandover> {
        self.pending_handover.as_ref()
    }

    /// First request wins. Returns the request already waiting, if any.
    pub fn offer_handover(&mut self, request: PendingHandover) -> Result<(), PendingHandover> {
        match &self.pending_handover {
            Some(existing) => Err(existing.clone()),
            None => {
                self.pending_handover = Some(request);
                Ok(())
            }
        }
    }

    pub fn take_handover(&mut self) -> Option<PendingHandover> {
        self.pending_handover.take()
    }
}
