//! Agent worker runtime: lifecycle, persona binding, turn streaming and the
//! bus contract shared by every agent in a session.

mod agent;
mod behavior;
mod error;
mod heartbeat;
mod member;
mod state;
mod status;
mod turn;

pub use agent::Agent;
pub use behavior::{AgentBehavior, EchoBehavior};
pub use error::AgentError;
pub use heartbeat::{Beat, HeartbeatStats};
pub use member::SessionMember;
pub use state::{CognitiveState, RunState};
pub use status::{AgentStatus, CallStats};
pub use turn::{HandoverContext, TurnChunk, TurnContext, TurnInput, TurnItem, TurnSink};
