//! Bus observer that turns persisted messages into session memory.

use std::sync::Arc;

use async_trait::async_trait;
use parley_bus::OnMessage;
use parley_core::{HandlerError, Message};
use serde_json::Value;
use tracing::debug;

use crate::manager::MemoryManager;
use crate::types::{MemoryItem, SESSION_SCOPE};

/// Metadata key an agent stamps on its output with the memory scope of the
/// persona it spoke as. Unstamped messages land in [`SESSION_SCOPE`].
pub const MEMORY_SCOPE_KEY: &str = "memory_scope_id";

/// Subscribed with broadcast delivery so it sees every message once, before
/// routing. Copies the orchestrator republishes are skipped; their originals
/// were already recorded.
pub struct MemoryRecorder {
    manager: Arc<MemoryManager>,
}

impl MemoryRecorder {
    pub fn new(manager: Arc<MemoryManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }

    fn item_for(msg: &Message) -> Option<MemoryItem> {
        if !msg.metadata.persist || msg.is_routed_by_session() {
            return None;
        }
        let content = msg.payload.to_text_lossy();
        if content.trim().is_empty() {
            return None;
        }
        let scope = msg
            .metadata
            .extra
            .get(MEMORY_SCOPE_KEY)
            .and_then(Value::as_str)
            .unwrap_or(SESSION_SCOPE);
        let mut item = MemoryItem::new(msg.sender_id.as_str(), scope, content)
            .with_metadata("message_id", msg.id.as_str())
            .with_metadata("event", msg.metadata.event.as_str());
        if let Some(turn_id) = &msg.metadata.turn_id {
            item = item.with_metadata("turn_id", turn_id.as_str());
        }
        Some(item)
    }
}

#[async_trait]
impl OnMessage for MemoryRecorder {
    async fn on_message(&self, msg: &Message) -> Result<(), HandlerError> {
        let Some(item) = Self::item_for(msg) else {
            return Ok(());
        };
        let Some(memory) = self.manager.session(&msg.session_id) else {
            debug!(session_id = %msg.session_id, "no open memory for session, not recorded");
            return Ok(());
        };
        memory.remember(item);
        self.manager.promote_short_term(&msg.session_id);
        Ok(())
    }
}
