//! Per-turn bookkeeping owned by the orchestrator.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parley_core::{AgentId, TraceId, TurnId};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStatus {
    Routing,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TurnStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Routing | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_open()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct InflightTurn {
    pub turn_id: TurnId,
    pub trace_id: TraceId,
    pub created_at: DateTime<Utc>,
    pub target_agent_id: AgentId,
    pub status: TurnStatus,
    pub last_output_at: Option<DateTime<Utc>>,
    pub last_agent_output_final: Option<String>,
    #[serde(skip)]
    order: u64,
}

impl InflightTurn {
    pub fn new(
        turn_id: TurnId,
        trace_id: TraceId,
        target_agent_id: AgentId,
        status: TurnStatus,
    ) -> Self {
        Self {
            turn_id,
            trace_id,
            created_at: Utc::now(),
            target_agent_id,
            status,
            last_output_at: None,
            last_agent_output_final: None,
            order: 0,
        }
    }
}

/// Bounded table of turns. No TTL; the oldest entries go first once the
/// table outgrows its limit.
pub struct InflightTable {
    turns: HashMap<TurnId, InflightTurn>,
    max_entries: usize,
    next_order: u64,
}

impl InflightTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            turns: HashMap::new(),
            max_entries: max_entries.max(1),
            next_order: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn insert(&mut self, mut turn: InflightTurn) {
        turn.order = self.next_order;
        self.next_order += 1;
        self.turns.insert(turn.turn_id.clone(), turn);
    }

    pub fn get(&self, turn_id: &TurnId) -> Option<&InflightTurn> {
        self.turns.get(turn_id)
    }

    pub fn get_mut(&mut self, turn_id: &TurnId) -> Option<&mut InflightTurn> {
        self.turns.get_mut(turn_id)
    }

    /// Moves a turn to `to` if its current status is one of `from`.
    /// Returns the previous status when the transition happened.
    pub fn transition(
        &mut self,
        turn_id: &TurnId,
        to: TurnStatus,
        from: &[TurnStatus],
    ) -> Option<TurnStatus> {
        let turn = self.turns.get_mut(turn_id)?;
        if !from.contains(&turn.status) {
            return None;
        }
        let previous = turn.status;
        turn.status = to;
        Some(previous)
    }

    /// Newest ROUTING/RUNNING turn targeting `agent_id`.
    pub fn latest_open_for(&self, agent_id: &AgentId) -> Option<&InflightTurn> {
        self.turns
            .values()
            .filter(|t| &t.target_agent_id == agent_id && t.status.is_open())
            .max_by_key(|t| (t.created_at, t.order))
    }

    /// Most recent final output recorded for `agent_id`.
    pub fn latest_final_output(&self, agent_id: &AgentId) -> Option<String> {
        self.turns
            .values()
            .filter(|t| &t.target_agent_id == agent_id && t.last_agent_output_final.is_some())
            .max_by_key(|t| (t.last_output_at, t.order))
            .and_then(|t| t.last_agent_output_final.clone())
    }

    /// Drops the oldest turns beyond the limit. Returns how many were removed.
    pub fn gc(&mut self) -> usize {
        let excess = self.turns.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return 0;
        }
        let mut by_age: Vec<(DateTime<Utc>, u64, TurnId)> = self
            .turns
            .values()
            .map(|t| (t.created_at, t.order, t.turn_id.clone()))
            .collect();
        by_age.sort_by_key(|(at, order, _)| (*at, *order));
        for (_, _, turn_id) in by_age.into_iter().take(excess) {
            self.turns.remove(&turn_id);
        }
        excess
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(id: &str, agent: &str, status: TurnStatus) -> InflightTurn {
        InflightTurn::new(TurnId::from_raw(id), TraceId::new(), AgentId::from_raw(agent), status)
    }

    #[test]
    fn transitions_respect_allowed_states() {
        let mut table = InflightTable::new(10);
        table.insert(turn("t1", "a", TurnStatus::Routing));
        let id = TurnId::from_raw("t1");

        assert_eq!(
            table.transition(&id, TurnStatus::Running, &[TurnStatus::Routing]),
            Some(TurnStatus::Routing)
        );
        assert_eq!(table.transition(&id, TurnStatus::Failed, &[TurnStatus::Routing]), None);
        assert_eq!(table.get(&id).unwrap().status, TurnStatus::Running);
        assert_eq!(table.transition(&TurnId::from_raw("missing"), TurnStatus::Failed, &[]), None);
    }

    #[test]
    fn gc_drops_oldest_first() {
        let mut table = InflightTable::new(3);
        for i in 0..5 {
            table.insert(turn(&format!("t{i}"), "a", TurnStatus::Completed));
        }
        assert_eq!(table.gc(), 2);
        assert_eq!(table.len(), 3);
        assert!(table.get(&TurnId::from_raw("t0")).is_none());
        assert!(table.get(&TurnId::from_raw("t1")).is_none());
        assert!(table.get(&TurnId::from_raw("t4")).is_some());
        assert_eq!(table.gc(), 0);
    }

    #[test]
    fn latest_open_turn_per_agent() {
        let mut table = InflightTable::new(10);
        table.insert(turn("t1", "a", TurnStatus::Running));
        table.insert(turn("t2", "a", TurnStatus::Routing));
        table.insert(turn("t3", "a", TurnStatus::Completed));
        table.insert(turn("t4", "b", TurnStatus::Running));

        let latest = table.latest_open_for(&AgentId::from_raw("a")).unwrap();
        assert_eq!(latest.turn_id.as_str(), "t2");
        assert!(table.latest_open_for(&AgentId::from_raw("c")).is_none());
    }

    #[test]
    fn latest_final_output_for_handover() {
        let mut table = InflightTable::new(10);
        let mut first = turn("t1", "a", TurnStatus::Completed);
        first.last_agent_output_final = Some("first".into());
        first.last_output_at = Some(Utc::now());
        table.insert(first);
        let mut second = turn("t2", "a", TurnStatus::Completed);
        second.last_agent_output_final = Some("second".into());
        second.last_output_at = Some(Utc::now() + chrono::Duration::seconds(1));
        table.insert(second);

        assert_eq!(table.latest_final_output(&AgentId::from_raw("a")).as_deref(), Some("second"));
        assert_eq!(table.latest_final_output(&AgentId::from_raw("b")), None);
    }

    #[test]
    fn status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&TurnStatus::Canceled).unwrap(), "\"CANCELED\"");
        assert!(TurnStatus::Failed.is_terminal());
        assert!(TurnStatus::Routing.is_open());
    }
}
