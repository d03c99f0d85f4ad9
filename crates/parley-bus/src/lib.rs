//! Per-session publish/subscribe bus. The only channel between the frontend,
//! the orchestrator and agent workers.

mod bus;
mod error;
mod subscriber;

pub use bus::{BusStats, MessageBus};
pub use error::BusError;
pub use subscriber::{Delivery, FnSubscriber, OnMessage};
