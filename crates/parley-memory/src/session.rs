//! The per-session store every agent view reads from.

use std::collections::HashSet;

use parking_lot::RwLock;
use parley_core::{MemoryId, SessionId};
use tracing::debug;

use crate::types::{MemoryItem, MemoryStats};

/// Items are kept in the order they were remembered; that order is the
/// timeline every query reports in.
pub struct SessionMemory {
    session_id: SessionId,
    items: RwLock<Vec<MemoryItem>>,
}

impl SessionMemory {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            items: RwLock::new(Vec::new()),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn remember(&self, item: MemoryItem) -> MemoryId {
        let id = item.id.clone();
        self.items.write().push(item);
        id
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<MemoryItem> {
        self.items.read().clone()
    }

    /// Replaces everything, e.g. with the contents of a memory file.
    pub fn load_snapshot(&self, items: Vec<MemoryItem>) {
        *self.items.write() = items;
    }

    pub fn filter(&self, pred: impl Fn(&MemoryItem) -> bool) -> Vec<MemoryItem> {
        self.items.read().iter().filter(|m| pred(*m)).cloned().collect()
    }

    pub fn by_role(&self, role: &str) -> Vec<MemoryItem> {
        self.filter(|m| m.role == role)
    }

    pub fn by_scope(&self, scope_id: &str) -> Vec<MemoryItem> {
        self.filter(|m| m.scope_id == scope_id)
    }

    pub fn short_term(&self) -> Vec<MemoryItem> {
        self.filter(|m| !m.is_long_term())
    }

    pub fn long_term(&self) -> Vec<MemoryItem> {
        self.filter(MemoryItem::is_long_term)
    }

    /// Returns how many items changed term.
    pub fn promote_by_ids(&self, ids: &[MemoryId], reason: Option<&str>) -> usize {
        let wanted: HashSet<&MemoryId> = ids.iter().collect();
        self.items
            .write()
            .iter_mut()
            .filter(|m| wanted.contains(&m.id))
            .map(|m| m.promote(reason))
            .filter(|promoted| *promoted)
            .count()
    }

    /// Promotes the `count` newest short-term items.
    pub fn promote_newest_short_term(&self, count: usize, reason: Option<&str>) -> usize {
        self.items
            .write()
            .iter_mut()
            .rev()
            .filter(|m| !m.is_long_term())
            .take(count)
            .map(|m| m.promote(reason))
            .filter(|promoted| *promoted)
            .count()
    }

    /// Drops short-term items, keeping the newest `keep_last` when given.
    /// Long-term items always stay. Returns how many were dropped.
    pub fn drop_short_term(&self, keep_last: Option<usize>) -> usize {
        let mut items = self.items.write();
        let short = items.iter().filter(|m| !m.is_long_term()).count();
        let mut to_drop = short.saturating_sub(keep_last.unwrap_or(0));
        let before = items.len();
        items.retain(|m| {
            if m.is_long_term() || to_drop == 0 {
                return true;
            }
            to_drop -= 1;
            false
        });
        let dropped = before - items.len();
        debug!(session_id = %self.session_id, dropped, "short-term memory dropped");
        dropped
    }

    pub fn clear(&self) {
        self.items.write().clear();
    }

    pub fn stats(&self) -> MemoryStats {
        let items = self.items.read();
        let long_term = items.iter().filter(|m| m.is_long_term()).count();
        MemoryStats {
            session_id: self.session_id.clone(),
            total: items.len(),
            short_term: items.len() - long_term,
            long_term,
        }
    }
}

impl std::fmt::Debug for SessionMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMemory")
            .field("session_id", &self.session_id)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SESSION_SCOPE;

    fn store_with(contents: &[&str]) -> SessionMemory {
        let store = SessionMemory::new(SessionId::from_raw("s1"));
        for c in contents {
            store.remember(MemoryItem::new("user-1", SESSION_SCOPE, *c));
        }
        store
    }

    fn contents(items: &[MemoryItem]) -> Vec<&str> {
        items.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn drop_short_term_keeps_newest_and_long_term() {
        let store = store_with(&["a", "b"]);
        store.remember(MemoryItem::new("alpha", "scope-a", "keep me").long_term());
        store.remember(MemoryItem::new("user-1", SESSION_SCOPE, "c"));
        store.remember(MemoryItem::new("user-1", SESSION_SCOPE, "d"));

        assert_eq!(store.drop_short_term(Some(2)), 2);
        assert_eq!(contents(&store.snapshot()), ["keep me", "c", "d"]);
        assert_eq!(store.drop_short_term(None), 2);
        assert_eq!(contents(&store.snapshot()), ["keep me"]);
    }

    #[test]
    fn promotion_by_id_and_by_recency() {
        let store = store_with(&["a", "b", "c", "d"]);
        let first = store.snapshot()[0].id.clone();

        assert_eq!(store.promote_by_ids(&[first.clone(), first], Some("pinned")), 1);
        assert_eq!(store.promote_newest_short_term(2, None), 2);
        assert_eq!(contents(&store.long_term()), ["a", "c", "d"]);
        assert_eq!(contents(&store.short_term()), ["b"]);

        let stats = store.stats();
        assert_eq!((stats.total, stats.short_term, stats.long_term), (4, 1, 3));
    }

    #[test]
    fn queries_by_role_and_scope() {
        let store = store_with(&["hi"]);
        store.remember(MemoryItem::new("alpha", "scope-a", "hello back"));
        assert_eq!(contents(&store.by_role("alpha")), ["hello back"]);
        assert_eq!(contents(&store.by_scope(SESSION_SCOPE)), ["hi"]);
        store.clear();
        assert!(store.is_empty());
    }
}
