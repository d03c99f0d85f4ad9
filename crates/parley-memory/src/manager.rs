//! Owner of every session's memory and of the memory files.
//!
//! File layout: `<dir>/<session_id>.json` holding a versioned document with
//! the session's items in timeline order. Writes go to a temporary file that
//! is renamed over the old one.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_core::{AgentId, SessionId};
use parley_settings::MemorySettings;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::MemoryError;
use crate::session::SessionMemory;
use crate::types::MemoryItem;
use crate::view::AgentMemory;

const FILE_VERSION: u32 = 1;
const PROMOTION_REASON: &str = "auto_promote";

#[derive(Debug, Serialize, Deserialize)]
struct MemoryFile {
    session_id: SessionId,
    version: u32,
    updated_at: DateTime<Utc>,
    memories: Vec<MemoryItem>,
}

pub struct MemoryManager {
    settings: MemorySettings,
    sessions: DashMap<SessionId, Arc<SessionMemory>>,
}

impl MemoryManager {
    pub fn new(settings: MemorySettings) -> Self {
        Self {
            settings,
            sessions: DashMap::new(),
        }
    }

    /// Process-local memory with default limits.
    pub fn in_process() -> Self {
        Self::new(MemorySettings::default())
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    pub fn session(&self, session_id: &SessionId) -> Option<Arc<SessionMemory>> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    /// Returns the open store, or creates one seeded from the session's
    /// memory file. An unreadable file is logged and the session starts
    /// empty.
    pub fn load_session(&self, session_id: &SessionId) -> Arc<SessionMemory> {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                let memory = SessionMemory::new(session_id.clone());
                if let Some(path) = self.session_file(session_id) {
                    match read_file(&path) {
                        Ok(Some(items)) => {
                            info!(%session_id, count = items.len(), "session memory loaded");
                            memory.load_snapshot(items);
                        }
                        Ok(None) => debug!(%session_id, "no memory file, starting empty"),
                        Err(e) => warn!(%session_id, error = %e, "memory file ignored"),
                    }
                }
                Arc::new(memory)
            })
            .clone()
    }

    /// A view for `agent_id` speaking from `scope_id`.
    pub fn agent_view(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        scope_id: &str,
    ) -> AgentMemory {
        AgentMemory::new(
            agent_id.clone(),
            scope_id,
            self.settings.recall_short_term,
            self.load_session(session_id),
        )
    }

    /// Writes the session's items out. Returns the file written, or `None`
    /// when no directory is configured or the session is not open.
    pub fn flush_session(&self, session_id: &SessionId) -> Result<Option<PathBuf>, MemoryError> {
        let Some(path) = self.session_file(session_id) else {
            return Ok(None);
        };
        let Some(memory) = self.session(session_id) else {
            return Ok(None);
        };
        let doc = MemoryFile {
            session_id: session_id.clone(),
            version: FILE_VERSION,
            updated_at: Utc::now(),
            memories: memory.snapshot(),
        };
        write_file(&path, &doc)?;
        info!(
            %session_id,
            count = doc.memories.len(),
            path = %path.display(),
            "session memory flushed"
        );
        Ok(Some(path))
    }

    /// Flushes (when configured to) and forgets the session.
    pub fn close_session(&self, session_id: &SessionId) {
        if self.settings.auto_flush {
            if let Err(e) = self.flush_session(session_id) {
                warn!(%session_id, error = %e, "session memory not flushed");
            }
        }
        if self.sessions.remove(session_id).is_some() {
            debug!(%session_id, "session memory released");
        }
    }

    /// Once a session holds `promote_threshold` short-term items, its
    /// `promote_count` newest move to long term. Returns how many moved.
    pub fn promote_short_term(&self, session_id: &SessionId) -> usize {
        let Some(memory) = self.session(session_id) else {
            return 0;
        };
        if memory.stats().short_term < self.settings.promote_threshold.max(1) {
            return 0;
        }
        let promoted =
            memory.promote_newest_short_term(self.settings.promote_count, Some(PROMOTION_REASON));
        if promoted > 0 {
            info!(%session_id, promoted, "short-term memory promoted");
        }
        promoted
    }

    fn session_file(&self, session_id: &SessionId) -> Option<PathBuf> {
        self.settings
            .dir
            .as_ref()
            .map(|dir| dir.join(format!("{session_id}.json")))
    }
}

/// `Ok(None)` when the file does not exist.
fn read_file(path: &Path) -> Result<Option<Vec<MemoryItem>>, MemoryError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(MemoryError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    let doc: MemoryFile = serde_json::from_str(&content).map_err(|source| MemoryError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    if doc.version != FILE_VERSION {
        return Err(MemoryError::Version {
            path: path.to_path_buf(),
            version: doc.version,
        });
    }
    Ok(Some(doc.memories))
}

fn write_file(path: &Path, doc: &MemoryFile) -> Result<(), MemoryError> {
    let io_err = |source| MemoryError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(io_err)?;
    }
    let body = serde_json::to_vec_pretty(doc).map_err(|source| MemoryError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SESSION_SCOPE;

    fn on_disk(dir: &Path) -> MemoryManager {
        MemoryManager::new(MemorySettings {
            dir: Some(dir.to_path_buf()),
            ..MemorySettings::default()
        })
    }

    #[test]
    fn flush_then_reload_restores_items() {
        let dir = tempfile::tempdir().unwrap();
        let sid = SessionId::from_raw("s1");
        let manager = on_disk(dir.path());

        let view = manager.agent_view(&sid, &AgentId::from_raw("alpha"), "scope-a");
        view.remember_long_term("the user prefers short answers");
        manager
            .load_session(&sid)
            .remember(MemoryItem::new("user-1", SESSION_SCOPE, "hello"));

        let path = manager.flush_session(&sid).unwrap().unwrap();
        assert_eq!(path, dir.path().join("s1.json"));
        manager.close_session(&sid);
        assert!(manager.session(&sid).is_none());

        let reopened = on_disk(dir.path());
        let memory = reopened.load_session(&sid);
        assert_eq!(memory.len(), 2);
        assert_eq!(memory.long_term()[0].content, "the user prefers short answers");
        assert_eq!(memory.by_scope(SESSION_SCOPE)[0].content, "hello");
    }

    #[test]
    fn process_local_memory_never_touches_disk() {
        let manager = MemoryManager::in_process();
        let sid = SessionId::from_raw("s1");
        manager.load_session(&sid).remember(MemoryItem::new("user-1", SESSION_SCOPE, "hi"));
        assert!(manager.flush_session(&sid).unwrap().is_none());
        manager.close_session(&sid);
        assert!(manager.session(&sid).is_none());
    }

    #[test]
    fn unreadable_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("s1.json"), "{not json").unwrap();
        std::fs::write(
            dir.path().join("s2.json"),
            r#"{"session_id":"s2","version":9,"updated_at":"2026-01-01T00:00:00Z","memories":[]}"#,
        )
        .unwrap();
        let manager = on_disk(dir.path());

        assert!(manager.load_session(&SessionId::from_raw("s1")).is_empty());
        assert!(manager.load_session(&SessionId::from_raw("s2")).is_empty());
        assert!(matches!(
            read_file(&dir.path().join("s2.json")),
            Err(MemoryError::Version { version: 9, .. })
        ));
    }

    #[test]
    fn promotion_waits_for_threshold() {
        let manager = MemoryManager::new(MemorySettings {
            promote_threshold: 4,
            promote_count: 2,
            ..MemorySettings::default()
        });
        let sid = SessionId::from_raw("s1");
        let memory = manager.load_session(&sid);
        for i in 0..3 {
            memory.remember(MemoryItem::new("user-1", SESSION_SCOPE, format!("m{i}")));
        }
        assert_eq!(manager.promote_short_term(&sid), 0);

        memory.remember(MemoryItem::new("user-1", SESSION_SCOPE, "m3"));
        assert_eq!(manager.promote_short_term(&sid), 2);
        let long: Vec<_> = memory.long_term().into_iter().map(|m| m.content).collect();
        assert_eq!(long, ["m2", "m3"]);
        assert_eq!(memory.long_term()[0].metadata["promotion_reason"], "auto_promote");
        assert_eq!(manager.promote_short_term(&SessionId::from_raw("unknown")), 0);
    }
}
