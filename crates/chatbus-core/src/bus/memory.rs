//! In-process topic broker.
//!
//! Implements the broker ports with AMQP-like semantics: durable named queues,
//! topic and direct exchanges, per-channel prefetch, requeue with a delivery
//! count, and dead-letter routing. Used by tests and by `chatbus` when run
//! without RabbitMQ. Fault injection hooks simulate refused connections,
//! dropped connections and unconfirmed publishes.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    bus::{
        port::{
            BrokerChannel, BrokerConnection, BrokerConnector, DeliveryAcker, DeliveryStream,
            ExchangeKind, InboundDelivery, OutboundMessage, QueueSpec,
        },
        topology::topic_matches,
    },
    errors::Error,
    Result,
};

/// A message sitting on a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredMessage {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub delivery_count: u32,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub persistent: bool,
    /// Set when the message arrived through an explicit dead-letter.
    pub dead_letter_reason: Option<String>,
}

struct MemQueue {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    notify: Arc<Notify>,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

struct ConnState {
    id: u64,
    lost: watch::Sender<bool>,
}

impl ConnState {
    fn is_open(&self) -> bool {
        !*self.lost.borrow()
    }

    fn mark_lost(&self) {
        self.lost.send_replace(true);
    }
}

#[derive(Default)]
struct Registry {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<Binding>,
    connections: Vec<Arc<ConnState>>,
    queue_declarations: HashMap<String, u32>,
    refuse_connects: u32,
    unavailable: bool,
    fail_publishes: u32,
    connects: u32,
}

impl Registry {
    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> Result<usize> {
        let targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let kind = *self
                .exchanges
                .get(exchange)
                .ok_or_else(|| Error::Broker(format!("no exchange `{exchange}`")))?;
            let mut targets: Vec<String> = Vec::new();
            for b in self.bindings.iter().filter(|b| b.exchange == exchange) {
                let hit = match kind {
                    ExchangeKind::Topic => topic_matches(&b.pattern, routing_key),
                    ExchangeKind::Direct => b.pattern == routing_key,
                };
                if hit && !targets.contains(&b.queue) {
                    targets.push(b.queue.clone());
                }
            }
            targets
        };

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_waiters();
            }
        }
        Ok(targets.len())
    }

    fn dead_letter(&mut self, queue: &str, mut message: StoredMessage, reason: Option<&str>) {
        let Some(route) = self.queues.get(queue).and_then(|q| q.spec.dead_letter.clone()) else {
            debug!(queue, "no dead-letter route, message dropped");
            return;
        };
        message.dead_letter_reason = reason.map(str::to_string);
        message.routing_key = route.routing_key.clone();
        if let Err(e) = self.route(&route.exchange, &route.routing_key, message) {
            debug!(queue, error = %e, "dead-letter routing failed, message dropped");
        }
    }

    fn return_to_front(&mut self, queue: &str, message: StoredMessage) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_front(message);
            q.notify.notify_waiters();
        }
    }
}

/// Cloneable handle to one in-process broker; clones share all state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: u32) {
        self.registry().refuse_connects = n;
    }

    /// While unavailable every connection attempt is refused.
    pub fn set_available(&self, available: bool) {
        self.registry().unavailable = !available;
    }

    /// Leave the next `n` publishes unconfirmed.
    pub fn fail_next_publishes(&self, n: u32) {
        self.registry().fail_publishes = n;
    }

    /// Sever every live connection, as a broker restart or network cut would.
    pub fn drop_connections(&self) {
        let conns = std::mem::take(&mut self.registry().connections);
        for c in conns {
            c.mark_lost();
        }
    }

    /// Forget all exchanges, queues and bindings (a broker that lost its state).
    pub fn wipe_topology(&self) {
        let mut reg = self.registry();
        reg.exchanges.clear();
        reg.queues.clear();
        reg.bindings.clear();
    }

    /// Successful connections so far.
    pub fn connection_count(&self) -> u32 {
        self.registry().connects
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.registry().exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.registry().queues.contains_key(name)
    }

    /// How often `name` has been declared.
    pub fn declarations(&self, name: &str) -> u32 {
        self.registry()
            .queue_declarations
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Binding patterns of `queue` on `exchange`.
    pub fn bindings(&self, queue: &str, exchange: &str) -> Vec<String> {
        self.registry()
            .bindings
            .iter()
            .filter(|b| b.queue == queue && b.exchange == exchange)
            .map(|b| b.pattern.clone())
            .collect()
    }

    /// Ready (undelivered) messages on `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.registry()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Copy of the ready messages on `queue`, head first.
    pub fn peek(&self, queue: &str) -> Vec<StoredMessage> {
        self.registry()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return every ready message on `queue`.
    pub fn drain(&self, queue: &str) -> Vec<StoredMessage> {
        self.registry()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    /// Put raw bytes straight onto `exchange`, bypassing any producer checks.
    pub fn inject(&self, exchange: &str, routing_key: &str, payload: impl Into<Vec<u8>>) -> Result<usize> {
        self.registry().route(
            exchange,
            routing_key,
            StoredMessage {
                routing_key: routing_key.to_string(),
                payload: payload.into(),
                delivery_count: 1,
                message_id: None,
                correlation_id: None,
                persistent: true,
                dead_letter_reason: None,
            },
        )
    }

    fn pop(&self, queue: &str) -> Result<Option<StoredMessage>> {
        let mut reg = self.registry();
        let q = reg
            .queues
            .get_mut(queue)
            .ok_or_else(|| Error::Broker(format!("queue `{queue}` was deleted")))?;
        Ok(q.ready.pop_front())
    }

    fn queue_notify(&self, queue: &str) -> Option<Arc<Notify>> {
        self.registry().queues.get(queue).map(|q| q.notify.clone())
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let conn = {
            let mut reg = self.registry();
            if reg.unavailable {
                return Err(Error::Broker("connection refused: broker unavailable".to_string()));
            }
            if reg.refuse_connects > 0 {
                reg.refuse_connects -= 1;
                return Err(Error::Broker("connection refused".to_string()));
            }
            reg.connects += 1;
            let (lost, _) = watch::channel(false);
            let conn = Arc::new(ConnState {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                lost,
            });
            reg.connections.push(conn.clone());
            conn
        };
        debug!(connection = conn.id, "memory broker connection opened");
        Ok(Arc::new(MemConnection {
            broker: self.clone(),
            conn,
        }))
    }
}

struct MemConnection {
    broker: InMemoryBroker,
    conn: Arc<ConnState>,
}

#[async_trait]
impl BrokerConnection for MemConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if !self.conn.is_open() {
            return Err(Error::Broker("connection is closed".to_string()));
        }
        Ok(Box::new(MemChannel {
            broker: self.broker.clone(),
            conn: self.conn.clone(),
            prefetch: Mutex::new(None),
            consumers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_open(&self) -> bool {
        self.conn.is_open()
    }

    async fn closed(&self) {
        let mut rx = self.conn.lost.subscribe();
        let _ = rx.wait_for(|lost| *lost).await;
    }

    async fn close(&self) -> Result<()> {
        self.conn.mark_lost();
        let id = self.conn.id;
        self.broker.registry().connections.retain(|c| c.id != id);
        Ok(())
    }
}

struct MemChannel {
    broker: InMemoryBroker,
    conn: Arc<ConnState>,
    prefetch: Mutex<Option<Arc<Semaphore>>>,
    consumers: Mutex<HashMap<String, CancellationToken>>,
    closed: AtomicBool,
}

impl MemChannel {
    fn usable(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Broker("channel is closed".to_string()));
        }
        if !self.conn.is_open() {
            return Err(Error::Broker("connection is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.usable()?;
        let mut reg = self.broker.registry();
        if let Some(existing) = reg.exchanges.get(name).copied() {
            if existing != kind {
                return Err(Error::Broker(format!(
                    "exchange `{name}` already declared as {existing:?}"
                )));
            }
            return Ok(());
        }
        reg.exchanges.insert(name.to_string(), kind);
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        self.usable()?;
        let mut reg = self.broker.registry();
        *reg.queue_declarations.entry(spec.name.clone()).or_insert(0) += 1;
        if let Some(existing) = reg.queues.get(&spec.name) {
            if existing.spec != *spec {
                return Err(Error::Broker(format!(
                    "queue `{}` already declared with different arguments",
                    spec.name
                )));
            }
            return Ok(());
        }
        reg.queues.insert(
            spec.name.clone(),
            MemQueue {
                spec: spec.clone(),
                ready: VecDeque::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.usable()?;
        let mut reg = self.broker.registry();
        if !reg.queues.contains_key(queue) {
            return Err(Error::Broker(format!("no queue `{queue}`")));
        }
        if !reg.exchanges.contains_key(exchange) {
            return Err(Error::Broker(format!("no exchange `{exchange}`")));
        }
        let exists = reg
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == routing_key);
        if !exists {
            reg.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.usable()?;
        let sem = (count > 0).then(|| Arc::new(Semaphore::new(usize::from(count))));
        *self.prefetch.lock().unwrap_or_else(|e| e.into_inner()) = sem;
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        self.usable()?;
        let mut reg = self.broker.registry();
        if reg.fail_publishes > 0 {
            reg.fail_publishes -= 1;
            return Err(Error::Broker("publish was not confirmed".to_string()));
        }
        let routed = reg.route(
            &message.exchange,
            &message.routing_key,
            StoredMessage {
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                delivery_count: 1,
                message_id: message.message_id.clone(),
                correlation_id: message.correlation_id.clone(),
                persistent: message.persistent,
                dead_letter_reason: None,
            },
        )?;
        if routed == 0 {
            debug!(
                exchange = %message.exchange,
                routing_key = %message.routing_key,
                "message matched no binding"
            );
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.usable()?;
        if !self.broker.has_queue(queue) {
            return Err(Error::Broker(format!("no queue `{queue}`")));
        }

        let cancel = CancellationToken::new();
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(consumer_tag.to_string(), cancel.clone());
        let prefetch = self
            .prefetch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let (tx, rx) = mpsc::channel::<Result<InboundDelivery>>(1);
        let pump = Pump {
            broker: self.broker.clone(),
            conn: self.conn.clone(),
            queue: queue.to_string(),
            prefetch,
            cancel,
        };
        tokio::spawn(pump.run(tx));

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        if let Some(token) = self
            .consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(consumer_tag)
        {
            token.cancel();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let consumers = std::mem::take(&mut *self.consumers.lock().unwrap_or_else(|e| e.into_inner()));
        for token in consumers.into_values() {
            token.cancel();
        }
        Ok(())
    }
}

/// Moves messages from a queue to one consumer, honouring prefetch.
struct Pump {
    broker: InMemoryBroker,
    conn: Arc<ConnState>,
    queue: String,
    prefetch: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
}

impl Pump {
    async fn run(self, tx: mpsc::Sender<Result<InboundDelivery>>) {
        let mut lost = self.conn.lost.subscribe();
        loop {
            let permit = match &self.prefetch {
                Some(sem) => tokio::select! {
                    permit = sem.clone().acquire_owned() => match permit {
                        Ok(p) => Some(p),
                        Err(_) => break,
                    },
                    _ = self.cancel.cancelled() => break,
                    _ = lost.wait_for(|l| *l) => break,
                },
                None => None,
            };

            let message = loop {
                let Some(notify) = self.broker.queue_notify(&self.queue) else {
                    let _ = tx
                        .send(Err(Error::Broker(format!("queue `{}` was deleted", self.queue))))
                        .await;
                    return;
                };
                let notified = notify.notified();
                match self.broker.pop(&self.queue) {
                    Ok(Some(m)) => break Some(m),
                    Ok(None) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
                tokio::select! {
                    _ = notified => {}
                    _ = self.cancel.cancelled() => break None,
                    _ = lost.wait_for(|l| *l) => break None,
                }
            };
            let Some(message) = message else { break };

            let delivery = InboundDelivery {
                routing_key: message.routing_key.clone(),
                payload: message.payload.clone(),
                delivery_count: message.delivery_count,
                acker: Box::new(MemAcker {
                    broker: self.broker.clone(),
                    conn: self.conn.clone(),
                    queue: self.queue.clone(),
                    message: Some(message),
                    _permit: permit,
                }),
            };
            // A failed send drops the acker, which returns the message.
            if tx.send(Ok(delivery)).await.is_err() {
                break;
            }
        }
        debug!(queue = %self.queue, "consumer stopped");
    }
}

struct MemAcker {
    broker: InMemoryBroker,
    conn: Arc<ConnState>,
    queue: String,
    message: Option<StoredMessage>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl MemAcker {
    fn settle(&mut self) -> Result<Option<StoredMessage>> {
        if !self.conn.is_open() {
            return Err(Error::Broker(
                "connection lost before the delivery was settled".to_string(),
            ));
        }
        Ok(self.message.take())
    }
}

#[async_trait]
impl DeliveryAcker for MemAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.settle()?;
        Ok(())
    }

    async fn requeue(mut self: Box<Self>) -> Result<()> {
        if let Some(mut message) = self.settle()? {
            message.delivery_count += 1;
            self.broker.registry().return_to_front(&self.queue, message);
        }
        Ok(())
    }

    async fn reject(mut self: Box<Self>) -> Result<()> {
        if let Some(message) = self.settle()? {
            self.broker.registry().dead_letter(&self.queue, message, None);
        }
        Ok(())
    }

    async fn dead_letter(mut self: Box<Self>, reason: &str) -> Result<()> {
        if let Some(message) = self.settle()? {
            self.broker
                .registry()
                .dead_letter(&self.queue, message, Some(reason));
        }
        Ok(())
    }
}

impl Drop for MemAcker {
    // Unsettled deliveries go back to the head of the queue, uncounted.
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.broker.registry().return_to_front(&self.queue, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::topology::{declare_exchanges, declare_queue, QueueTopology};
    use std::time::Duration;
    use tokio::time::timeout;

    const EX: &str = "fbchat.events";
    const DLX: &str = "fbchat.events.dlx";

    async fn setup(broker: &InMemoryBroker, queue: &str, keys: &[&str]) -> Box<dyn BrokerChannel> {
        let conn = broker.connect().await.unwrap();
        let ch = conn.open_channel().await.unwrap();
        declare_exchanges(ch.as_ref(), EX, DLX).await.unwrap();
        declare_queue(ch.as_ref(), EX, DLX, &QueueTopology::new(queue, keys.iter().copied()))
            .await
            .unwrap();
        ch
    }

    fn outbound(routing_key: &str, payload: &[u8]) -> OutboundMessage {
        OutboundMessage {
            exchange: EX.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            persistent: true,
            content_type: "application/json",
            message_id: None,
            correlation_id: None,
            app_id: None,
        }
    }

    async fn next(stream: &mut DeliveryStream) -> InboundDelivery {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery within 1s")
            .expect("stream open")
            .expect("delivery ok")
    }

    #[tokio::test]
    async fn routes_by_topic_pattern() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker, "svc.messages", &["message.*"]).await;

        ch.publish(&outbound("message.received", b"a")).await.unwrap();
        ch.publish(&outbound("cookie.changed", b"b")).await.unwrap();

        assert_eq!(broker.queue_depth("svc.messages"), 1);
        assert_eq!(broker.peek("svc.messages")[0].payload, b"a");
    }

    #[tokio::test]
    async fn publish_to_undeclared_exchange_fails() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        let ch = conn.open_channel().await.unwrap();
        assert!(ch.publish(&outbound("x", b"{}")).await.is_err());
    }

    #[tokio::test]
    async fn redeclaring_with_different_arguments_fails() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker, "q", &["k"]).await;
        let spec = QueueSpec {
            name: "q".to_string(),
            durable: true,
            dead_letter: None,
        };
        assert!(ch.declare_queue(&spec).await.is_err());
        assert_eq!(broker.declarations("q"), 2);
    }

    #[tokio::test]
    async fn requeue_increments_delivery_count() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker, "q", &["k"]).await;
        ch.set_prefetch(1).await.unwrap();
        ch.publish(&outbound("k", b"m")).await.unwrap();

        let mut stream = ch.consume("q", "t").await.unwrap();
        let d = next(&mut stream).await;
        assert_eq!(d.delivery_count, 1);
        d.acker.requeue().await.unwrap();

        let d = next(&mut stream).await;
        assert_eq!(d.delivery_count, 2);
        d.acker.ack().await.unwrap();
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn reject_routes_to_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker, "q", &["k"]).await;
        ch.publish(&outbound("k", b"bad")).await.unwrap();

        let mut stream = ch.consume("q", "t").await.unwrap();
        next(&mut stream).await.acker.reject().await.unwrap();

        let dead = broker.drain("q.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, b"bad");
        assert_eq!(dead[0].dead_letter_reason, None);
    }

    #[tokio::test]
    async fn explicit_dead_letter_carries_reason() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker, "q", &["k"]).await;
        ch.publish(&outbound("k", b"m")).await.unwrap();

        let mut stream = ch.consume("q", "t").await.unwrap();
        next(&mut stream)
            .await
            .acker
            .dead_letter("redelivery limit exceeded")
            .await
            .unwrap();

        let dead = broker.drain("q.dlq");
        assert_eq!(dead[0].dead_letter_reason.as_deref(), Some("redelivery limit exceeded"));
    }

    #[tokio::test]
    async fn prefetch_holds_back_until_settled() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker, "q", &["k"]).await;
        ch.set_prefetch(1).await.unwrap();
        ch.publish(&outbound("k", b"1")).await.unwrap();
        ch.publish(&outbound("k", b"2")).await.unwrap();

        let mut stream = ch.consume("q", "t").await.unwrap();
        let first = next(&mut stream).await;
        assert!(timeout(Duration::from_millis(50), stream.next()).await.is_err());

        first.acker.ack().await.unwrap();
        assert_eq!(next(&mut stream).await.payload, b"2");
    }

    #[tokio::test]
    async fn unsettled_delivery_returns_on_connection_loss() {
        let broker = InMemoryBroker::new();
        let ch = setup(&broker, "q", &["k"]).await;
        ch.publish(&outbound("k", b"m")).await.unwrap();

        let mut stream = ch.consume("q", "t").await.unwrap();
        let d = next(&mut stream).await;
        broker.drop_connections();

        assert!(d.acker.ack().await.is_err());
        assert_eq!(broker.queue_depth("q"), 1);
        assert_eq!(broker.peek("q")[0].delivery_count, 1);
        assert!(timeout(Duration::from_secs(1), stream.next()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refused_and_unavailable_connections() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(1);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());

        broker.set_available(false);
        assert!(broker.connect().await.is_err());
        broker.set_available(true);
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connection_count(), 2);
    }

    #[tokio::test]
    async fn closed_resolves_after_drop() {
        let broker = InMemoryBroker::new();
        let conn = broker.connect().await.unwrap();
        assert!(conn.is_open());
        broker.drop_connections();
        timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
        assert!(!conn.is_open());
        assert!(conn.open_channel().await.is_err());
    }
}
