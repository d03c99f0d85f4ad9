//! # parley-session
//!
//! The per-session coordinator. [`SessionOrchestrator`] routes user input to
//! one agent, supervises acknowledgements, owns the speaking floor and runs
//! cancellation and hand-off. [`SessionManager`] opens and closes sessions
//! and carries out add/remove-agent requests.

#![deny(unsafe_code)]

mod context;
mod error;
mod inflight;
mod manager;
pub mod mention;
mod orchestrator;

pub use context::PendingHandover;
pub use error::{AckKind, SessionError};
pub use inflight::{InflightTurn, TurnStatus};
pub use manager::{AgentProvisioner, SessionHandle, SessionManager, SharedBehaviorProvisioner};
pub use orchestrator::SessionOrchestrator;
