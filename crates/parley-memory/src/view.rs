//! One agent's window onto the session store.

use std::sync::Arc;

use parley_core::{AgentId, SessionId};
use serde_json::{Map, Value};

use crate::session::SessionMemory;
use crate::types::{MemoryItem, MemoryTerm, SESSION_SCOPE};

/// Reads and writes go to the shared [`SessionMemory`]; the view only decides
/// which scope the agent speaks from and what it gets to see. An agent sees
/// its own scope plus the session-wide scope.
#[derive(Clone, Debug)]
pub struct AgentMemory {
    agent_id: AgentId,
    scope_id: String,
    recall_limit: usize,
    session: Arc<SessionMemory>,
}

impl AgentMemory {
    pub fn new(
        agent_id: AgentId,
        scope_id: impl Into<String>,
        recall_limit: usize,
        session: Arc<SessionMemory>,
    ) -> Self {
        Self {
            agent_id,
            scope_id: scope_id.into(),
            recall_limit,
            session,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn session_id(&self) -> &SessionId {
        self.session.session_id()
    }

    pub fn remember(
        &self,
        content: impl Into<String>,
        term: MemoryTerm,
        metadata: Map<String, Value>,
    ) -> MemoryItem {
        let mut item = MemoryItem::new(self.agent_id.as_str(), self.scope_id.as_str(), content);
        item.term = term;
        item.metadata = metadata;
        self.session.remember(item.clone());
        item
    }

    pub fn remember_long_term(&self, content: impl Into<String>) -> MemoryItem {
        self.remember(content, MemoryTerm::LongTerm, Map::new())
    }

    /// Everything in this view's own scope.
    pub fn memories(&self) -> Vec<MemoryItem> {
        self.session.by_scope(&self.scope_id)
    }

    pub fn long_term(&self) -> Vec<MemoryItem> {
        self.session
            .filter(|m| m.scope_id == self.scope_id && m.is_long_term())
    }

    /// The newest `limit` visible items, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<MemoryItem> {
        let mut visible = self.session.filter(|m| self.sees(m));
        let skip = visible.len().saturating_sub(limit);
        visible.drain(..skip);
        visible
    }

    /// Long-term items of this scope plus the newest `short_term_limit`
    /// visible short-term items, in timeline order.
    pub fn context(&self, short_term_limit: usize) -> Vec<MemoryItem> {
        let visible = self.session.filter(|m| self.sees(m));
        let short_total = visible.iter().filter(|m| !m.is_long_term()).count();
        let mut short_to_skip = short_total.saturating_sub(short_term_limit);
        visible
            .into_iter()
            .filter(|m| {
                if m.is_long_term() {
                    return m.scope_id == self.scope_id;
                }
                if short_to_skip > 0 {
                    short_to_skip -= 1;
                    return false;
                }
                true
            })
            .collect()
    }

    /// [`Self::context`] with the configured recall limit.
    pub fn recall(&self) -> Vec<MemoryItem> {
        self.context(self.recall_limit)
    }

    fn sees(&self, item: &MemoryItem) -> bool {
        item.scope_id == self.scope_id || item.scope_id == SESSION_SCOPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(items: &[MemoryItem]) -> Vec<&str> {
        items.iter().map(|m| m.content.as_str()).collect()
    }

    fn setup() -> (Arc<SessionMemory>, AgentMemory, AgentMemory) {
        let store = Arc::new(SessionMemory::new(SessionId::from_raw("s1")));
        let alpha = AgentMemory::new(AgentId::from_raw("alpha"), "scope-a", 10, store.clone());
        let beta = AgentMemory::new(AgentId::from_raw("beta"), "scope-b", 10, store.clone());
        (store, alpha, beta)
    }

    #[test]
    fn scopes_are_isolated_but_share_the_session() {
        let (store, alpha, beta) = setup();
        store.remember(MemoryItem::new("user-1", SESSION_SCOPE, "question"));
        alpha.remember("alpha thinks", MemoryTerm::ShortTerm, Map::new());
        beta.remember_long_term("beta knows");

        assert_eq!(contents(&alpha.recent(10)), ["question", "alpha thinks"]);
        assert_eq!(contents(&beta.recent(10)), ["question", "beta knows"]);
        assert_eq!(contents(&alpha.memories()), ["alpha thinks"]);
        assert!(alpha.long_term().is_empty());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn context_keeps_long_term_and_newest_short_term() {
        let (store, alpha, _) = setup();
        alpha.remember_long_term("persona fact");
        for i in 0..4 {
            store.remember(MemoryItem::new("user-1", SESSION_SCOPE, format!("msg {i}")));
        }
        store.remember(MemoryItem::new("beta", "scope-b", "hidden").long_term());

        assert_eq!(contents(&alpha.context(2)), ["persona fact", "msg 2", "msg 3"]);
        assert_eq!(contents(&alpha.recent(1)), ["msg 3"]);
        assert_eq!(alpha.recall().len(), 5);
    }
}
