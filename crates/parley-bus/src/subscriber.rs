use std::sync::Arc;

use async_trait::async_trait;
use parley_core::{HandlerError, Message};

/// The single capability every bus participant implements.
///
/// Handlers run on the bus delivery loop. Anything slow (model calls, waiting
/// for acknowledgements) must be spawned so the next message is not held up.
#[async_trait]
pub trait OnMessage: Send + Sync {
    async fn on_message(&self, msg: &Message) -> Result<(), HandlerError>;
}

/// How a registration receives messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Only messages routed to the subscriber id.
    Directed,
    /// Every message on the bus, before routing.
    Broadcast,
}

/// Adapts a plain closure into a subscriber.
pub struct FnSubscriber<F> {
    f: F,
}

impl<F> FnSubscriber<F>
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F> OnMessage for FnSubscriber<F>
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    async fn on_message(&self, msg: &Message) -> Result<(), HandlerError> {
        (self.f)(msg);
        Ok(())
    }
}
