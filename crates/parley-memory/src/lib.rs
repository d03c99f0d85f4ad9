//! # parley-memory
//!
//! Conversation memory for a session and the agents in it.
//!
//! - [`SessionMemory`] is the single store of remembered facts for a session.
//! - [`AgentMemory`] is one agent's view of that store, keyed by the memory
//!   scope of the persona the agent currently wears.
//! - [`MemoryManager`] owns every session's store, loads and flushes the
//!   per-session JSON files and applies the short-term promotion policy.
//! - [`MemoryRecorder`] watches the bus and remembers persisted messages.
//!
//! ## Fail-silent
//!
//! Memory never stops a turn. Load, flush and recording failures are logged
//! and the session carries on with whatever it has in memory.

#![deny(unsafe_code)]

pub mod errors;
pub mod manager;
pub mod recorder;
pub mod session;
pub mod types;
pub mod view;

pub use errors::MemoryError;
pub use manager::MemoryManager;
pub use recorder::{MemoryRecorder, MEMORY_SCOPE_KEY};
pub use session::SessionMemory;
pub use types::{MemoryItem, MemoryStats, MemoryTerm, SESSION_SCOPE};
pub use view::AgentMemory;
