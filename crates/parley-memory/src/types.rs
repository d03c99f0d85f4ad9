//! The remembered fact and its lifetime.

use chrono::{DateTime, Utc};
use parley_core::{MemoryId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scope of facts every agent in the session may see (user input, system
/// notes).
pub const SESSION_SCOPE: &str = "session";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTerm {
    #[default]
    ShortTerm,
    LongTerm,
}

/// One indivisible remembered fact. Whether it is short or long term is a
/// property of the item, not of the store holding it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: MemoryId,
    /// Who said it: an agent id, a user id or `system`.
    pub role: String,
    /// Memory scope it belongs to; a persona's `memory_scope_id` or
    /// [`SESSION_SCOPE`].
    pub scope_id: String,
    #[serde(default)]
    pub term: MemoryTerm,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl MemoryItem {
    pub fn new(
        role: impl Into<String>,
        scope_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MemoryId::new(),
            role: role.into(),
            scope_id: scope_id.into(),
            term: MemoryTerm::ShortTerm,
            content: content.into(),
            summary: None,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn long_term(mut self) -> Self {
        self.term = MemoryTerm::LongTerm;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_long_term(&self) -> bool {
        self.term == MemoryTerm::LongTerm
    }

    /// Moves the item to long term. Returns false if it already was.
    pub fn promote(&mut self, reason: Option<&str>) -> bool {
        if self.is_long_term() {
            return false;
        }
        self.term = MemoryTerm::LongTerm;
        self.metadata
            .insert("promoted_at".into(), Value::String(Utc::now().to_rfc3339()));
        if let Some(reason) = reason {
            self.metadata
                .entry("promotion_reason")
                .or_insert_with(|| Value::String(reason.to_owned()));
        }
        true
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub session_id: SessionId,
    pub total: usize,
    pub short_term: usize,
    pub long_term: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_happens_once_and_keeps_first_reason() {
        let mut item = MemoryItem::new("alpha", "scope-a", "the plan");
        assert!(item.promote(Some("auto_promote")));
        assert!(!item.promote(Some("manual")));
        assert!(item.is_long_term());
        assert_eq!(item.metadata["promotion_reason"], "auto_promote");
        assert!(item.metadata.contains_key("promoted_at"));
    }

    #[test]
    fn wire_shape() {
        let item =
            MemoryItem::new("user-1", SESSION_SCOPE, "hello").with_metadata("turn_id", "turn_1");
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["term"], "short_term");
        assert_eq!(value["scope_id"], "session");
        assert!(value.get("summary").is_none());

        let back: MemoryItem = serde_json::from_value(value).unwrap();
        assert_eq!(back, item);
    }
}
