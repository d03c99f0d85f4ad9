//! Per-session message bus.
//!
//! One bounded queue, one delivery task. Publishing only enqueues; subscriber
//! code always runs on the delivery task, so a handler that publishes never
//! re-enters another handler.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use parley_core::{Message, MessageTarget, SessionId};
use parley_settings::BusSettings;
use parley_telemetry::{names, MetricsRecorder};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::BusError;
use crate::subscriber::{Delivery, OnMessage};

type Handler = Arc<dyn OnMessage>;

/// Point-in-time view of a bus.
#[derive(Clone, Debug, Serialize)]
pub struct BusStats {
    pub session_id: SessionId,
    /// Directed subscriber ids, sorted.
    pub subscribers: Vec<String>,
    pub broadcast_subscribers: usize,
    pub queue_depth: usize,
    pub running: bool,
}

#[derive(Default)]
struct Registry {
    directed: BTreeMap<String, Vec<Handler>>,
    broadcast: Vec<(String, Handler)>,
}

impl Registry {
    fn directed_for(&self, id: &str) -> Vec<(String, Handler)> {
        self.directed
            .get(id)
            .map(|handlers| handlers.iter().map(|h| (id.to_owned(), h.clone())).collect())
            .unwrap_or_default()
    }

    fn all_directed(&self) -> Vec<(String, Handler)> {
        self.directed
            .iter()
            .flat_map(|(id, handlers)| handlers.iter().map(move |h| (id.clone(), h.clone())))
            .collect()
    }
}

struct BusInner {
    session_id: SessionId,
    registry: RwLock<Registry>,
    depth: AtomicUsize,
    closed: AtomicBool,
    shutdown: CancellationToken,
    metrics: Option<Arc<MetricsRecorder>>,
}

pub struct MessageBus {
    inner: Arc<BusInner>,
    tx: mpsc::Sender<Message>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    /// Creates the bus and spawns its delivery task. Must be called inside a
    /// tokio runtime.
    pub fn new(session_id: SessionId, settings: &BusSettings) -> Arc<Self> {
        Self::with_metrics(session_id, settings, None)
    }

    pub fn with_metrics(
        session_id: SessionId,
        settings: &BusSettings,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let inner = Arc::new(BusInner {
            session_id,
            registry: RwLock::new(Registry::default()),
            depth: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            metrics,
        });
        let task = tokio::spawn(run(inner.clone(), rx));
        debug!(session_id = %inner.session_id, capacity = settings.queue_capacity, "bus started");
        Arc::new(Self {
            inner,
            tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Registers a handler. Several handlers may share one id; they are called
    /// in registration order.
    pub fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        handler: Arc<dyn OnMessage>,
        delivery: Delivery,
    ) {
        let subscriber_id = subscriber_id.into();
        let mut registry = self.inner.registry.write();
        match delivery {
            Delivery::Directed => registry
                .directed
                .entry(subscriber_id.clone())
                .or_default()
                .push(handler),
            Delivery::Broadcast => registry.broadcast.push((subscriber_id.clone(), handler)),
        }
        debug!(
            session_id = %self.inner.session_id,
            subscriber = %subscriber_id,
            ?delivery,
            "subscribed"
        );
    }

    /// Removes every registration under `subscriber_id`. Returns whether
    /// anything was removed.
    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        let mut registry = self.inner.registry.write();
        let directed = registry.directed.remove(subscriber_id).is_some();
        let before = registry.broadcast.len();
        registry.broadcast.retain(|(id, _)| id != subscriber_id);
        let removed = directed || registry.broadcast.len() != before;
        if removed {
            debug!(session_id = %self.inner.session_id, subscriber = subscriber_id, "unsubscribed");
        }
        removed
    }

    pub fn is_subscribed(&self, subscriber_id: &str) -> bool {
        self.inner.registry.read().directed.contains_key(subscriber_id)
    }

    /// Validates and enqueues. Waits while the queue is full.
    pub async fn publish(&self, msg: Message) -> Result<(), BusError> {
        let session_id = &self.inner.session_id;
        if self.is_closed() {
            return Err(BusError::Closed(session_id.clone()));
        }
        if &msg.session_id != session_id {
            return Err(BusError::SessionMismatch {
                expected: session_id.clone(),
                got: msg.session_id,
            });
        }
        if msg.target == MessageTarget::Agent && msg.target_id.is_none() {
            return Err(BusError::MissingTargetId { message_id: msg.id });
        }

        let depth = self.inner.depth.fetch_add(1, Ordering::AcqRel) + 1;
        if self.tx.send(msg).await.is_err() {
            let _ = self.inner.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(BusError::Closed(session_id.clone()));
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.counter_inc(names::BUS_MESSAGES_PUBLISHED, &[], 1);
            metrics.gauge_set(names::BUS_QUEUE_DEPTH, &[], depth as f64);
        }
        Ok(())
    }

    pub fn stats(&self) -> BusStats {
        let registry = self.inner.registry.read();
        BusStats {
            session_id: self.inner.session_id.clone(),
            subscribers: registry.directed.keys().cloned().collect(),
            broadcast_subscribers: registry.broadcast.len(),
            queue_depth: self.inner.depth.load(Ordering::Acquire),
            running: !self.is_closed(),
        }
    }

    /// Stops the delivery task. Queued messages are abandoned and further
    /// publishes fail. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(session_id = %self.inner.session_id, error = %e, "bus task ended abnormally");
            }
        }
        *self.inner.registry.write() = Registry::default();
        info!(session_id = %self.inner.session_id, "bus closed");
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn run(inner: Arc<BusInner>, mut rx: mpsc::Receiver<Message>) {
    loop {
        let msg = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(msg) => msg,
                None => break,
            },
        };
        let _ = inner.depth.fetch_sub(1, Ordering::AcqRel);
        inner.dispatch(&msg).await;
    }

    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    inner.depth.store(0, Ordering::Release);
    if dropped > 0 {
        warn!(session_id = %inner.session_id, dropped, "bus stopped with undelivered messages");
    }
}

fn handler_key(handler: &Handler) -> usize {
    Arc::as_ptr(handler).cast::<()>() as usize
}

impl BusInner {
    async fn dispatch(&self, msg: &Message) {
        let (observers, targets) = {
            let registry = self.registry.read();
            let targets = match msg.target {
                MessageTarget::Broadcast => registry.all_directed(),
                MessageTarget::Agent => msg
                    .target_id
                    .as_ref()
                    .map(|id| registry.directed_for(id.as_str()))
                    .unwrap_or_default(),
                other => other
                    .reserved_subscriber()
                    .map(|id| registry.directed_for(id))
                    .unwrap_or_default(),
            };
            (registry.broadcast.clone(), targets)
        };

        let mut delivered: Vec<usize> = Vec::with_capacity(observers.len() + targets.len());
        for (id, handler) in &observers {
            delivered.push(handler_key(handler));
            self.deliver(id, handler, msg).await;
        }

        if targets.is_empty() {
            match msg.target {
                MessageTarget::Agent => warn!(
                    session_id = %self.session_id,
                    message_id = %msg.id,
                    target_id = ?msg.target_id,
                    "no subscriber for target agent, dropping"
                ),
                _ => debug!(
                    session_id = %self.session_id,
                    message_id = %msg.id,
                    target = ?msg.target,
                    "no subscriber for target"
                ),
            }
            return;
        }

        for (id, handler) in &targets {
            let key = handler_key(handler);
            if delivered.contains(&key) {
                continue;
            }
            delivered.push(key);
            self.deliver(id, handler, msg).await;
        }
    }

    /// Runs one handler. Errors and panics are logged and never escape.
    async fn deliver(&self, subscriber_id: &str, handler: &Handler, msg: &Message) {
        let outcome = AssertUnwindSafe(handler.on_message(msg)).catch_unwind().await;
        let failed = match outcome {
            Ok(Ok(())) => false,
            Ok(Err(err)) => {
                warn!(
                    session_id = %self.session_id,
                    subscriber = subscriber_id,
                    message_id = %msg.id,
                    code = %err.code,
                    error = %err.message,
                    "subscriber failed to handle message"
                );
                true
            }
            Err(_panic) => {
                error!(
                    session_id = %self.session_id,
                    subscriber = subscriber_id,
                    message_id = %msg.id,
                    "subscriber panicked while handling message"
                );
                true
            }
        };
        if failed {
            if let Some(metrics) = &self.metrics {
                let labels = [("subscriber", subscriber_id)];
                metrics.counter_inc(names::BUS_DISPATCH_FAILURES, &labels, 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::{factory, AgentId, ErrorCode, HandlerError, MessageEvent, TurnTag};
    use std::sync::OnceLock;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    use crate::subscriber::FnSubscriber;

    struct Recorder {
        tx: UnboundedSender<Message>,
    }

    #[async_trait]
    impl OnMessage for Recorder {
        async fn on_message(&self, msg: &Message) -> Result<(), HandlerError> {
            let _ = self.tx.send(msg.clone());
            Ok(())
        }
    }

    fn recorder() -> (Arc<Recorder>, UnboundedReceiver<Message>) {
        let (tx, rx) = unbounded_channel();
        (Arc::new(Recorder { tx }), rx)
    }

    async fn next(rx: &mut UnboundedReceiver<Message>) -> Message {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("recorder dropped")
    }

    async fn nothing_more(rx: &mut UnboundedReceiver<Message>) {
        assert!(tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .is_err());
    }

    fn sid() -> SessionId {
        SessionId::from_raw("s1")
    }

    fn bus() -> Arc<MessageBus> {
        MessageBus::new(sid(), &BusSettings::default())
    }

    fn to(target: MessageTarget, text: &str) -> Message {
        factory::user_input(sid(), "user", text).with_target(target)
    }

    #[tokio::test]
    async fn single_publisher_order_is_preserved() {
        let bus = bus();
        let (rec, mut rx) = recorder();
        bus.subscribe("frontend", rec, Delivery::Directed);

        for i in 0..200 {
            bus.publish(to(MessageTarget::Frontend, &i.to_string())).await.unwrap();
        }
        for i in 0..200 {
            assert_eq!(next(&mut rx).await.payload.as_text(), Some(i.to_string().as_str()));
        }
    }

    #[tokio::test]
    async fn agent_target_reaches_only_that_agent() {
        let bus = bus();
        let (a, mut rx_a) = recorder();
        let (b, mut rx_b) = recorder();
        bus.subscribe("agentA", a, Delivery::Directed);
        bus.subscribe("agentB", b, Delivery::Directed);

        let msg = to(MessageTarget::Session, "hi").to_agent(AgentId::from_raw("agentB"));
        bus.publish(msg).await.unwrap();

        assert_eq!(next(&mut rx_b).await.payload.as_text(), Some("hi"));
        nothing_more(&mut rx_a).await;
    }

    #[tokio::test]
    async fn observers_see_undeliverable_messages_first() {
        let bus = bus();
        let (observer, mut rx_obs) = recorder();
        let (system, mut rx_sys) = recorder();
        bus.subscribe("logger-tap", observer, Delivery::Broadcast);
        bus.subscribe("system", system, Delivery::Directed);

        let ghost = to(MessageTarget::Session, "lost").to_agent(AgentId::from_raw("ghost"));
        bus.publish(ghost).await.unwrap();
        bus.publish(to(MessageTarget::System, "sys")).await.unwrap();

        assert_eq!(next(&mut rx_obs).await.payload.as_text(), Some("lost"));
        assert_eq!(next(&mut rx_obs).await.payload.as_text(), Some("sys"));
        assert_eq!(next(&mut rx_sys).await.payload.as_text(), Some("sys"));
        nothing_more(&mut rx_sys).await;
    }

    #[tokio::test]
    async fn broadcast_target_reaches_each_handler_once() {
        let bus = bus();
        let (shared, mut rx_shared) = recorder();
        let (other, mut rx_other) = recorder();
        bus.subscribe("system", shared.clone(), Delivery::Directed);
        bus.subscribe("session", shared, Delivery::Directed);
        bus.subscribe("agentA", other, Delivery::Directed);

        bus.publish(to(MessageTarget::Broadcast, "all")).await.unwrap();

        assert_eq!(next(&mut rx_shared).await.payload.as_text(), Some("all"));
        assert_eq!(next(&mut rx_other).await.payload.as_text(), Some("all"));
        nothing_more(&mut rx_shared).await;
    }

    struct Failing;

    #[async_trait]
    impl OnMessage for Failing {
        async fn on_message(&self, _msg: &Message) -> Result<(), HandlerError> {
            Err(HandlerError::new(ErrorCode::InternalError, "nope"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl OnMessage for Panicking {
        async fn on_message(&self, _msg: &Message) -> Result<(), HandlerError> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn failing_handlers_do_not_block_others() {
        let metrics = Arc::new(MetricsRecorder::new());
        let bus = MessageBus::with_metrics(sid(), &BusSettings::default(), Some(metrics.clone()));
        let (rec, mut rx) = recorder();
        bus.subscribe("frontend", Arc::new(Failing), Delivery::Directed);
        bus.subscribe("frontend", Arc::new(Panicking), Delivery::Directed);
        bus.subscribe("frontend", rec, Delivery::Directed);

        bus.publish(to(MessageTarget::Frontend, "one")).await.unwrap();
        bus.publish(to(MessageTarget::Frontend, "two")).await.unwrap();

        assert_eq!(next(&mut rx).await.payload.as_text(), Some("one"));
        assert_eq!(next(&mut rx).await.payload.as_text(), Some("two"));
        assert_eq!(
            metrics.counter_get(names::BUS_DISPATCH_FAILURES, &[("subscriber", "frontend")]),
            4
        );
        assert_eq!(metrics.counter_get(names::BUS_MESSAGES_PUBLISHED, &[]), 2);
    }

    #[tokio::test]
    async fn rejects_foreign_session() {
        let bus = bus();
        let msg = factory::user_input(SessionId::from_raw("s2"), "user", "x");
        let err = bus.publish(msg).await.unwrap_err();
        assert!(matches!(err, BusError::SessionMismatch { .. }));
    }

    #[tokio::test]
    async fn rejects_agent_target_without_id() {
        let bus = bus();
        let err = bus.publish(to(MessageTarget::Agent, "x")).await.unwrap_err();
        assert!(matches!(err, BusError::MissingTargetId { .. }));
    }

    #[tokio::test]
    async fn closed_bus_refuses_publish() {
        let bus = bus();
        bus.subscribe("frontend", FnSubscriber::new(|_| {}), Delivery::Directed);
        bus.close().await;
        bus.close().await;

        let err = bus.publish(to(MessageTarget::Frontend, "late")).await.unwrap_err();
        assert_eq!(err, BusError::Closed(sid()));
        let stats = bus.stats();
        assert!(!stats.running);
        assert!(stats.subscribers.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = bus();
        let (rec, mut rx) = recorder();
        bus.subscribe("agentA", rec.clone(), Delivery::Directed);
        assert!(bus.is_subscribed("agentA"));
        assert!(bus.unsubscribe("agentA"));
        assert!(!bus.unsubscribe("agentA"));

        let msg = to(MessageTarget::Session, "x").to_agent(AgentId::from_raw("agentA"));
        bus.publish(msg).await.unwrap();
        nothing_more(&mut rx).await;
    }

    /// Replies to every SESSION message by publishing to FRONTEND.
    struct Echo {
        bus: OnceLock<Arc<MessageBus>>,
    }

    #[async_trait]
    impl OnMessage for Echo {
        async fn on_message(&self, msg: &Message) -> Result<(), HandlerError> {
            let Some(bus) = self.bus.get() else {
                return Ok(());
            };
            let reply = factory::event(
                msg.session_id.clone(),
                "echo",
                "ECHO",
                msg.payload.clone(),
                &TurnTag::of(msg),
            )
            .with_target(MessageTarget::Frontend);
            bus.publish(reply)
                .await
                .map_err(|e| HandlerError::internal(e.to_string()))
        }
    }

    #[tokio::test]
    async fn handlers_may_publish_without_reentry() {
        let bus = bus();
        let echo = Arc::new(Echo {
            bus: OnceLock::new(),
        });
        let _ = echo.bus.set(bus.clone());
        let (rec, mut rx) = recorder();
        bus.subscribe("session", echo, Delivery::Directed);
        bus.subscribe("frontend", rec, Delivery::Directed);

        bus.publish(to(MessageTarget::Session, "ping")).await.unwrap();

        let reply = next(&mut rx).await;
        assert_eq!(reply.event(), MessageEvent::Event);
        assert_eq!(reply.payload.as_text(), Some("ping"));
        bus.close().await;
    }

    /// Records each message, then holds the delivery loop until released.
    struct Gated {
        tx: UnboundedSender<Message>,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl OnMessage for Gated {
        async fn on_message(&self, msg: &Message) -> Result<(), HandlerError> {
            let _ = self.tx.send(msg.clone());
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_queue_makes_publishers_wait() {
        let bus = MessageBus::new(sid(), &BusSettings { queue_capacity: 1 });
        let (tx, mut rx) = unbounded_channel();
        let gated = Arc::new(Gated {
            tx,
            release: tokio::sync::Notify::new(),
        });
        bus.subscribe("frontend", gated.clone(), Delivery::Directed);

        bus.publish(to(MessageTarget::Frontend, "one")).await.unwrap();
        assert_eq!(next(&mut rx).await.payload.as_text(), Some("one"));
        // "one" is held by the handler, "two" fills the only slot.
        bus.publish(to(MessageTarget::Frontend, "two")).await.unwrap();

        let blocked = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(to(MessageTarget::Frontend, "three")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        gated.release.notify_one();
        blocked.await.unwrap().unwrap();
        assert_eq!(next(&mut rx).await.payload.as_text(), Some("two"));
        gated.release.notify_one();
        assert_eq!(next(&mut rx).await.payload.as_text(), Some("three"));
        gated.release.notify_one();
        nothing_more(&mut rx).await;
    }

    #[tokio::test]
    async fn stats_report_registrations() {
        let bus = bus();
        bus.subscribe("system", FnSubscriber::new(|_| {}), Delivery::Directed);
        bus.subscribe("tap", FnSubscriber::new(|_| {}), Delivery::Broadcast);
        let stats = bus.stats();
        assert_eq!(stats.subscribers, vec!["system".to_string()]);
        assert_eq!(stats.broadcast_subscribers, 1);
        assert!(stats.running);
        assert_eq!(stats.session_id, sid());
    }
}
