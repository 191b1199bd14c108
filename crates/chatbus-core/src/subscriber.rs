//! Queue consumers with bounded redelivery and dead-lettering.
//!
//! Each subscription runs as its own task: one channel, prefetch 1, one
//! handler invocation at a time. Every delivery is settled with an explicit
//! [`Settlement`].

use std::{
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    bus::{
        port::{DeliveryStream, InboundDelivery},
        topology::QueueTopology,
    },
    config::Config,
    connection::{BusChannel, ChannelRole, ConnectionManager},
    errors::Error,
    events::{Decoded, Envelope},
    Result,
};

/// Domain callback for one event type (or a family of them).
///
/// An `Err` (or a panic) requeues the delivery until the redelivery bound is
/// reached.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> Result<()> {
        (self.0)(envelope).await
    }
}

/// Adapt an async closure into an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// What to do with a delivery once it has been looked at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Acknowledged without reaching a handler (unknown event type).
    Ignore,
    Requeue,
    /// Reject without requeue; the broker dead-letters it.
    Reject,
    DeadLetter(String),
}

/// Decide how to settle one delivery, invoking `handler` when appropriate.
pub async fn settle_delivery(
    handler: &dyn EventHandler,
    queue: &str,
    payload: &[u8],
    delivery_count: u32,
    max_redelivery: u32,
) -> Settlement {
    let envelope = match Envelope::decode(payload) {
        Ok(Decoded::Known(env)) => env,
        Ok(Decoded::Unknown(u)) => {
            info!(
                queue,
                event_type = %u.event_type,
                producer = u.producer.as_deref().unwrap_or("unknown"),
                "ignoring unknown event type"
            );
            return Settlement::Ignore;
        }
        Err(e) => {
            warn!(queue, error = %e, "rejecting malformed message");
            return Settlement::Reject;
        }
    };

    let event_type = envelope.event_type();
    let event_id = envelope.event_id();
    if delivery_count > max_redelivery {
        warn!(
            queue,
            event_type = %event_type,
            event_id = %event_id,
            delivery_count,
            "redelivery limit reached, dead-lettering"
        );
        return Settlement::DeadLetter(format!(
            "handler failed {} time(s); redelivery limit is {max_redelivery}",
            delivery_count - 1
        ));
    }

    match AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await {
        Ok(Ok(())) => Settlement::Ack,
        Ok(Err(e)) => {
            warn!(
                queue,
                event_type = %event_type,
                event_id = %event_id,
                delivery_count,
                error = %e,
                "handler failed, requeueing"
            );
            Settlement::Requeue
        }
        Err(_) => {
            error!(
                queue,
                event_type = %event_type,
                event_id = %event_id,
                delivery_count,
                "handler panicked, requeueing"
            );
            Settlement::Requeue
        }
    }
}

#[derive(Clone, Debug)]
pub struct SubscriberSettings {
    /// Deliveries beyond this count are dead-lettered without reaching the
    /// handler.
    pub max_redelivery: u32,
    pub prefetch: u16,
    /// Pause between attempts to re-establish a lost consumer.
    pub resubscribe_delay: Duration,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            max_redelivery: 3,
            prefetch: 1,
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}

impl SubscriberSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_redelivery: cfg.max_redelivery,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct Counters {
    acked: AtomicU64,
    ignored: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn record(&self, settlement: &Settlement) {
        let counter = match settlement {
            Settlement::Ack => &self.acked,
            Settlement::Ignore => &self.ignored,
            Settlement::Requeue => &self.requeued,
            Settlement::Reject => &self.rejected,
            Settlement::DeadLetter(_) => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub acked: u64,
    pub ignored: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
}

/// Owner of a running subscription.
///
/// `stop` is cooperative; dropping the handle requests the same shutdown
/// without waiting for it.
pub struct SubscriptionHandle {
    queue: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl SubscriptionHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn stats(&self) -> SubscriptionStats {
        let c = &self.counters;
        SubscriptionStats {
            acked: c.acked.load(Ordering::Relaxed),
            ignored: c.ignored.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// True once the consumer loop has exited (stopped, or the manager
    /// closed).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop taking deliveries, let the in-flight handler finish, cancel the
    /// consumer and close its channel.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(queue = %self.queue, error = %e, "consumer task ended abnormally");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Binds queues to the exchange and runs their consumers.
#[derive(Clone)]
pub struct Subscriber {
    manager: ConnectionManager,
    settings: SubscriberSettings,
}

impl Subscriber {
    pub fn new(manager: ConnectionManager, settings: SubscriberSettings) -> Self {
        Self { manager, settings }
    }

    /// Declare `queue` bound to `routing_keys` (with its dead-letter queue)
    /// and start consuming it into `handler`.
    pub async fn subscribe<I, S>(
        &self,
        queue: &str,
        routing_keys: I,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topology = QueueTopology::new(queue, routing_keys);
        if topology.routing_keys.is_empty() {
            return Err(Error::Config(format!(
                "subscription to `{queue}` needs at least one routing key"
            )));
        }
        self.manager.ensure_connected().await?;
        self.manager.register_queue(topology.clone()).await?;

        let consumer = Consumer {
            manager: self.manager.clone(),
            settings: self.settings.clone(),
            queue: topology.queue.clone(),
            consumer_tag: format!("{}.{}", topology.queue, Uuid::new_v4().simple()),
            handler,
            counters: Arc::new(Counters::default()),
            cancel: self.manager.consumer_token(),
        };
        let (channel, stream) = consumer.open().await?;
        info!(
            queue = %topology.queue,
            routing_keys = ?topology.routing_keys,
            "subscribed"
        );

        let queue = consumer.queue.clone();
        let cancel = consumer.cancel.clone();
        let counters = consumer.counters.clone();
        let task = tokio::spawn(consumer.run(channel, stream));
        Ok(SubscriptionHandle {
            queue,
            cancel,
            task: Some(task),
            counters,
        })
    }
}

struct Consumer {
    manager: ConnectionManager,
    settings: SubscriberSettings,
    queue: String,
    consumer_tag: String,
    handler: Arc<dyn EventHandler>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl Consumer {
    async fn open(&self) -> Result<(BusChannel, DeliveryStream)> {
        let channel = self.manager.open_channel(ChannelRole::Subscriber).await?;
        let stream = async {
            channel.set_prefetch(self.settings.prefetch).await?;
            channel.consume(&self.queue, &self.consumer_tag).await
        }
        .await;
        match stream {
            Ok(stream) => Ok((channel, stream)),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    async fn run(self, mut channel: BusChannel, mut stream: DeliveryStream) {
        'consume: loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break 'consume,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.process(delivery).await;
                    continue;
                }
                Some(Err(e)) => warn!(queue = %self.queue, error = %e, "consumer stream failed"),
                None => warn!(queue = %self.queue, "consumer stream ended"),
            }

            let _ = channel.close().await;
            loop {
                if self.manager.is_terminated() {
                    info!(queue = %self.queue, "connection manager closed, stopping consumer");
                    return;
                }
                let reopened = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    r = self.reopen() => r,
                };
                match reopened {
                    Ok((ch, s)) => {
                        channel = ch;
                        stream = s;
                        info!(queue = %self.queue, generation = channel.generation(), "consumer re-established");
                        continue 'consume;
                    }
                    Err(e) => {
                        debug!(queue = %self.queue, error = %e, "re-establishing consumer failed");
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return,
                            _ = tokio::time::sleep(self.settings.resubscribe_delay) => {}
                        }
                    }
                }
            }
        }

        if let Err(e) = channel.cancel(&self.consumer_tag).await {
            debug!(queue = %self.queue, error = %e, "consumer cancel failed");
        }
        let _ = channel.close().await;
        info!(queue = %self.queue, "subscription stopped");
    }

    async fn reopen(&self) -> Result<(BusChannel, DeliveryStream)> {
        self.manager.ensure_connected().await?;
        self.open().await
    }

    async fn process(&self, delivery: InboundDelivery) {
        let _settling = self.manager.settlement_guard().await;
        if self.manager.is_terminated() {
            // Unsettled deliveries go back to the queue when the acker drops.
            debug!(queue = %self.queue, "connection manager closing, returning delivery");
            return;
        }

        let InboundDelivery {
            routing_key,
            payload,
            delivery_count,
            acker,
        } = delivery;

        let settlement = settle_delivery(
            self.handler.as_ref(),
            &self.queue,
            &payload,
            delivery_count,
            self.settings.max_redelivery,
        )
        .await;

        let settled = match &settlement {
            Settlement::Ack | Settlement::Ignore => acker.ack().await,
            Settlement::Requeue => acker.requeue().await,
            Settlement::Reject => acker.reject().await,
            Settlement::DeadLetter(reason) => acker.dead_letter(reason).await,
        };
        match settled {
            Ok(()) => {
                self.counters.record(&settlement);
                debug!(
                    queue = %self.queue,
                    routing_key = %routing_key,
                    delivery_count,
                    settlement = ?settlement,
                    "delivery settled"
                );
            }
            Err(e) => warn!(
                queue = %self.queue,
                routing_key = %routing_key,
                error = %e,
                "failed to settle delivery; the broker will redeliver it"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::memory::InMemoryBroker,
        connection::{BackoffPolicy, ConnectionSettings},
        events::{EventData, MessageReceived, ThreadType},
        publisher::{Publisher, PublisherSettings},
    };
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const EX: &str = "fbchat.events";

    struct Harness {
        broker: InMemoryBroker,
        manager: ConnectionManager,
        publisher: Publisher,
        subscriber: Subscriber,
    }

    fn harness(max_redelivery: u32) -> Harness {
        harness_with_backoff(max_redelivery, Duration::from_millis(10), Duration::from_millis(40))
    }

    fn harness_with_backoff(max_redelivery: u32, initial: Duration, max: Duration) -> Harness {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(
            Arc::new(broker.clone()),
            ConnectionSettings {
                backoff: BackoffPolicy {
                    initial,
                    max,
                    jitter: 0.0,
                    max_attempts: None,
                },
                wait_timeout: Duration::from_secs(2),
                ..ConnectionSettings::default()
            },
        );
        Harness {
            publisher: Publisher::new(manager.clone(), PublisherSettings::new("fbchat-core")),
            subscriber: Subscriber::new(
                manager.clone(),
                SubscriberSettings {
                    max_redelivery,
                    resubscribe_delay: Duration::from_millis(10),
                    ..SubscriberSettings::default()
                },
            ),
            broker,
            manager,
        }
    }

    fn received(body: &str) -> MessageReceived {
        MessageReceived {
            message_id: "mid.$gAA".to_string(),
            user_id: "100014184491456".to_string(),
            sender_id: "100014184491456".to_string(),
            body: body.to_string(),
            reply_to_id: "845664565142543".to_string(),
            thread_type: ThreadType::Thread,
            attachments: vec![],
        }
    }

    fn counting_handler(calls: Arc<AtomicU32>, fail: bool) -> Arc<dyn EventHandler> {
        handler_fn(move |_env| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(Error::HandlerFailure("boom".to_string()))
                } else {
                    Ok(())
                }
            }
        })
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn round_trip_reaches_bound_consumer_unchanged() {
        let h = harness(3);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = h
            .subscriber
            .subscribe(
                "domain.message.received",
                ["message.received"],
                handler_fn(move |env| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(env);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let id = h
            .publisher
            .publish_message_received(received("lol Faker"), None)
            .await
            .unwrap();

        let env = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(env.event_id(), id);
        assert_eq!(env.event_type().as_str(), "message.received");
        assert_eq!(env.data(), &EventData::MessageReceived(received("lol Faker")));
    }

    #[tokio::test]
    async fn malformed_payload_goes_to_dead_letter_queue() {
        let h = harness(3);
        let calls = Arc::new(AtomicU32::new(0));
        let sub = h
            .subscriber
            .subscribe("q", ["message.received"], counting_handler(calls.clone(), false))
            .await
            .unwrap();

        h.broker.inject(EX, "message.received", &b"{not json"[..]).unwrap();

        eventually("dead-lettered", || h.broker.queue_depth("q.dlq") == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.broker.queue_depth("q"), 0);
        eventually("stats", || sub.stats().rejected == 1).await;
    }

    #[tokio::test]
    async fn failing_handler_is_dead_lettered_after_the_bound() {
        let h = harness(3);
        let calls = Arc::new(AtomicU32::new(0));
        let sub = h
            .subscriber
            .subscribe("q", ["message.received"], counting_handler(calls.clone(), true))
            .await
            .unwrap();

        h.publisher
            .publish_message_received(received("x"), None)
            .await
            .unwrap();

        eventually("dead-lettered", || h.broker.queue_depth("q.dlq") == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let dead = h.broker.peek("q.dlq");
        assert_eq!(dead[0].delivery_count, 4);
        assert!(dead[0].dead_letter_reason.as_deref().unwrap().contains("3 time(s)"));

        eventually("stats", || sub.stats().dead_lettered == 1).await;
        assert_eq!(sub.stats().requeued, 3);
    }

    #[tokio::test]
    async fn panicking_handler_is_treated_as_failure() {
        let h = harness(1);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let _sub = h
            .subscriber
            .subscribe(
                "q",
                ["message.received"],
                handler_fn(move |_env| {
                    let seen = seen.clone();
                    async move {
                        if seen.fetch_add(1, Ordering::SeqCst) < u32::MAX {
                            panic!("handler bug");
                        }
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        h.publisher
            .publish_message_received(received("x"), None)
            .await
            .unwrap();

        eventually("dead-lettered", || h.broker.queue_depth("q.dlq") == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_is_acknowledged() {
        let h = harness(3);
        let calls = Arc::new(AtomicU32::new(0));
        let sub = h
            .subscriber
            .subscribe("q", ["#"], counting_handler(calls.clone(), false))
            .await
            .unwrap();

        let body = json!({
            "event_type": "lobby.created",
            "timestamp": "2026-01-01T00:00:00Z",
            "event_id": "not-checked",
            "data": {}
        });
        h.broker
            .inject(EX, "lobby.created", body.to_string())
            .unwrap();

        eventually("ignored", || sub.stats().ignored == 1).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.broker.queue_depth("q"), 0);
        assert_eq!(h.broker.queue_depth("q.dlq"), 0);
    }

    #[tokio::test]
    async fn consumer_resumes_after_reconnect() {
        let h = harness(3);
        let calls = Arc::new(AtomicU32::new(0));
        let _sub = h
            .subscriber
            .subscribe("q", ["message.received"], counting_handler(calls.clone(), false))
            .await
            .unwrap();

        h.broker.drop_connections();
        eventually("reconnect", || h.manager.generation() == Some(2)).await;

        h.publisher
            .publish_message_received(received("after"), None)
            .await
            .unwrap();
        eventually("delivery after reconnect", || calls.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn events_published_while_reconnecting_are_delivered() {
        let backoff = Duration::from_millis(300);
        let h = harness_with_backoff(3, backoff, backoff);
        let calls = Arc::new(AtomicU32::new(0));
        let _sub = h
            .subscriber
            .subscribe("q", ["message.received"], counting_handler(calls.clone(), false))
            .await
            .unwrap();

        h.broker.drop_connections();
        h.publisher
            .publish_message_received(received("during"), None)
            .await
            .unwrap();
        assert_eq!(h.manager.generation(), Some(2));
        eventually("delivery after reconnect", || calls.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn closing_the_manager_settles_the_in_flight_delivery() {
        let h = harness(3);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let done = Arc::new(AtomicU32::new(0));
        let finished = done.clone();
        let sub = h
            .subscriber
            .subscribe(
                "q",
                ["message.received"],
                handler_fn(move |_env| {
                    let started_tx = started_tx.clone();
                    let finished = finished.clone();
                    async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        h.publisher
            .publish_message_received(received("slow"), None)
            .await
            .unwrap();
        timeout(Duration::from_secs(2), started_rx.recv()).await.unwrap();

        h.manager.close().await.unwrap();

        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(sub.stats().acked, 1);
        assert_eq!(h.broker.queue_depth("q"), 0);
        eventually("consumer exit", || sub.is_finished()).await;
    }

    #[tokio::test]
    async fn stop_lets_the_in_flight_handler_finish() {
        let h = harness(3);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let done = Arc::new(AtomicU32::new(0));
        let finished = done.clone();
        let sub = h
            .subscriber
            .subscribe(
                "q",
                ["message.received"],
                handler_fn(move |_env| {
                    let started_tx = started_tx.clone();
                    let finished = finished.clone();
                    async move {
                        let _ = started_tx.send(());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        h.publisher
            .publish_message_received(received("x"), None)
            .await
            .unwrap();
        timeout(Duration::from_secs(2), started_rx.recv()).await.unwrap();

        let stats = sub.stats();
        sub.stop().await;
        assert_eq!(stats.acked, 0);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(h.broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn closing_the_manager_ends_the_subscription() {
        let h = harness(3);
        let sub = h
            .subscriber
            .subscribe("q", ["message.received"], counting_handler(Arc::new(AtomicU32::new(0)), false))
            .await
            .unwrap();

        h.manager.close().await.unwrap();
        eventually("consumer exit", || sub.is_finished()).await;
    }

    #[tokio::test]
    async fn subscribing_without_routing_keys_is_rejected() {
        let h = harness(3);
        let keys: [&str; 0] = [];
        let err = h
            .subscriber
            .subscribe("q", keys, counting_handler(Arc::new(AtomicU32::new(0)), false))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
