//! Connection manager: one physical broker connection per process.
//!
//! A supervisor task owns the connect/reconnect loop and publishes the
//! [`ConnectionState`] on a watch channel. Every successful connect bumps the
//! generation and re-declares the exchanges and all registered queues.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use rand::Rng;
use tokio::{
    sync::{watch, OwnedRwLockReadGuard, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::{
    bus::{
        port::{BrokerChannel, BrokerConnection, BrokerConnector, DeliveryStream, OutboundMessage},
        topology::{declare_exchanges, declare_queue, QueueTopology},
    },
    config::Config,
    errors::Error,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
}

/// Exponential backoff with jitter; `max_attempts` bounds consecutive failures.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction in `[0, 1)`: each delay is scaled by a factor drawn from
    /// `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Un-jittered delay for the `attempt`-th retry (0-based).
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.policy
            .initial
            .checked_mul(factor)
            .map_or(self.policy.max, |d| d.min(self.policy.max))
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.nominal(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if self.policy.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng()
            .gen_range((1.0 - self.policy.jitter)..=(1.0 + self.policy.jitter));
        base.mul_f64(factor)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub exchange: String,
    pub dead_letter_exchange: String,
    pub backoff: BackoffPolicy,
    /// Bound on one connect-and-declare attempt.
    pub connect_timeout: Duration,
    /// Bound on how long `ensure_connected` waits for `Open`.
    pub wait_timeout: Duration,
}

impl ConnectionSettings {
    pub fn new(exchange: impl Into<String>) -> Self {
        let exchange = exchange.into();
        Self {
            dead_letter_exchange: format!("{exchange}.dlx"),
            exchange,
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self {
            exchange: cfg.exchange.clone(),
            dead_letter_exchange: cfg.dead_letter_exchange.clone(),
            backoff: BackoffPolicy {
                initial: cfg.reconnect_initial_delay,
                max: cfg.reconnect_max_delay,
                jitter: cfg.reconnect_jitter,
                max_attempts: cfg.reconnect_max_attempts,
            },
            connect_timeout: cfg.connect_timeout,
            wait_timeout: cfg.connect_wait_timeout,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::new("fbchat.events")
    }
}

/// Who a channel belongs to; only used for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRole {
    Publisher,
    Subscriber,
}

struct ChannelInner {
    id: u64,
    role: ChannelRole,
    generation: u64,
    channel: tokio::sync::Mutex<Option<Box<dyn BrokerChannel>>>,
    closed: AtomicBool,
}

/// A logical channel scoped to one publisher or subscriber.
///
/// Operations are serialized through an async mutex; `close` waits for the
/// in-flight one.
#[derive(Clone)]
pub struct BusChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for BusChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusChannel")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("generation", &self.inner.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BusChannel {
    pub fn role(&self) -> ChannelRole {
        self.inner.role
    }

    /// Connection generation this channel was opened on.
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub async fn set_prefetch(&self, count: u16) -> Result<()> {
        let guard = self.inner.channel.lock().await;
        channel_ref(&guard)?.set_prefetch(count).await
    }

    pub async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        let guard = self.inner.channel.lock().await;
        channel_ref(&guard)?.publish(message).await
    }

    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let guard = self.inner.channel.lock().await;
        channel_ref(&guard)?.consume(queue, consumer_tag).await
    }

    pub async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let guard = self.inner.channel.lock().await;
        channel_ref(&guard)?.cancel(consumer_tag).await
    }

    pub async fn close(&self) -> Result<()> {
        let mut guard = self.inner.channel.lock().await;
        self.inner.closed.store(true, Ordering::Release);
        match guard.take() {
            Some(ch) => {
                debug!(channel = self.inner.id, role = ?self.inner.role, "closing channel");
                ch.close().await
            }
            None => Ok(()),
        }
    }
}

fn channel_ref(slot: &Option<Box<dyn BrokerChannel>>) -> Result<&dyn BrokerChannel> {
    slot.as_deref()
        .ok_or_else(|| Error::Broker("channel is closed".to_string()))
}

#[derive(Clone)]
struct Live {
    connection: Arc<dyn BrokerConnection>,
    generation: u64,
}

struct Shared {
    connector: Arc<dyn BrokerConnector>,
    settings: ConnectionSettings,
    state: watch::Sender<ConnectionState>,
    current: Mutex<Option<Live>>,
    topologies: Mutex<Vec<QueueTopology>>,
    channels: Mutex<Vec<Weak<ChannelInner>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    // Held across connect-and-declare so a concurrent registration is never
    // missed by a reconnect.
    declare_lock: tokio::sync::Mutex<()>,
    terminal: Mutex<Option<String>>,
    started: AtomicBool,
    generation: AtomicU64,
    next_channel_id: AtomicU64,
    cancel: CancellationToken,
    // Parent of every consumer's stop token.
    consumers: CancellationToken,
    // Read-held by each delivery from receipt to settlement; `close` takes
    // the write side to drain them.
    settling: Arc<RwLock<()>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let prev = self.state.send_replace(state);
        if prev != state {
            debug!(state = ?state, "connection state changed");
        }
    }

    fn terminal_reason(&self) -> Option<String> {
        lock(&self.terminal).clone()
    }

    fn mark_terminal(&self, reason: &str) {
        {
            let mut t = lock(&self.terminal);
            if t.is_none() {
                *t = Some(reason.to_string());
            }
        }
        self.set_state(ConnectionState::Closed);
    }

    fn live(&self) -> Option<Live> {
        lock(&self.current).clone()
    }

    async fn connect_and_declare(&self) -> Result<Arc<dyn BrokerConnection>> {
        let connection = self.connector.connect().await?;
        let declared = async {
            let channel = connection.open_channel().await?;
            declare_exchanges(
                channel.as_ref(),
                &self.settings.exchange,
                &self.settings.dead_letter_exchange,
            )
            .await?;
            let topologies = lock(&self.topologies).clone();
            for t in &topologies {
                declare_queue(
                    channel.as_ref(),
                    &self.settings.exchange,
                    &self.settings.dead_letter_exchange,
                    t,
                )
                .await?;
            }
            channel.close().await
        }
        .await;

        match declared {
            Ok(()) => Ok(connection),
            Err(e) => {
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        let policy = self.settings.backoff;
        let mut backoff = Backoff::new(policy);
        let mut failures: u32 = 0;
        let mut connected_once = false;
        let mut delay_next = false;

        loop {
            if self.cancel.is_cancelled() || self.terminal_reason().is_some() {
                break;
            }
            if delay_next {
                let delay = backoff.next_delay();
                debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            delay_next = true;

            self.set_state(if connected_once {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            let attempt = async {
                let _declaring = self.declare_lock.lock().await;
                let connection = tokio::time::timeout(
                    self.settings.connect_timeout,
                    self.connect_and_declare(),
                )
                .await
                .map_err(|_| {
                    Error::Broker(format!(
                        "connect timed out after {}ms",
                        self.settings.connect_timeout.as_millis()
                    ))
                })??;
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                *lock(&self.current) = Some(Live {
                    connection: connection.clone(),
                    generation,
                });
                Ok::<_, Error>((connection, generation))
            };

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                r = attempt => r,
            };

            match outcome {
                Ok((connection, generation)) => {
                    failures = 0;
                    backoff.reset();
                    connected_once = true;
                    self.set_state(ConnectionState::Open);
                    info!(generation, exchange = %self.settings.exchange, "broker connection open");

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = connection.closed() => {
                            warn!(generation, "broker connection lost");
                            {
                                let mut current = lock(&self.current);
                                if current.as_ref().map(|l| l.generation) == Some(generation) {
                                    *current = None;
                                }
                            }
                            self.set_state(ConnectionState::Reconnecting);
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    if let Some(max) = policy.max_attempts {
                        if failures >= max {
                            warn!(attempt = failures, error = %e, "giving up on broker connection");
                            self.mark_terminal(&format!(
                                "gave up after {failures} consecutive connect attempt(s): {e}"
                            ));
                            break;
                        }
                    }
                    warn!(attempt = failures, error = %e, "broker connect failed");
                }
            }
        }

        let live = lock(&self.current).take();
        if let Some(live) = live {
            let _ = live.connection.close().await;
        }
        debug!("connection supervisor stopped");
    }
}

/// Cloneable handle to the process-wide broker connection.
///
/// Dropping the last handle cancels the supervisor; `close` additionally
/// closes every tracked channel and fails waiters with `BrokerUnavailable`.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    _stop_on_drop: Arc<DropGuard>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, settings: ConnectionSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Closed);
        let cancel = CancellationToken::new();
        let guard = cancel.clone().drop_guard();
        Self {
            shared: Arc::new(Shared {
                connector,
                settings,
                state,
                current: Mutex::new(None),
                topologies: Mutex::new(Vec::new()),
                channels: Mutex::new(Vec::new()),
                supervisor: Mutex::new(None),
                declare_lock: tokio::sync::Mutex::new(()),
                terminal: Mutex::new(None),
                started: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                next_channel_id: AtomicU64::new(1),
                cancel,
                consumers: CancellationToken::new(),
                settling: Arc::new(RwLock::new(())),
            }),
            _stop_on_drop: Arc::new(guard),
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.shared.settings
    }

    pub fn exchange(&self) -> &str {
        &self.shared.settings.exchange
    }

    pub fn dead_letter_exchange(&self) -> &str {
        &self.shared.settings.dead_letter_exchange
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// True after `close` or reconnect exhaustion.
    pub fn is_terminated(&self) -> bool {
        self.shared.terminal_reason().is_some()
    }

    /// Generation of the live connection, if any.
    pub fn generation(&self) -> Option<u64> {
        self.shared.live().map(|l| l.generation)
    }

    /// True when `channel` was opened on an older connection or is closed.
    pub fn is_stale(&self, channel: &BusChannel) -> bool {
        channel.is_closed() || self.generation() != Some(channel.generation())
    }

    /// Spawn the supervisor if it is not running yet. Must be called inside a
    /// tokio runtime.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = tokio::spawn(self.shared.clone().supervise());
        *lock(&self.shared.supervisor) = Some(handle);
    }

    /// Wait until the connection is open.
    pub async fn ensure_connected(&self) -> Result<()> {
        if let Some(reason) = self.shared.terminal_reason() {
            return Err(Error::BrokerUnavailable(reason));
        }
        if self.state() == ConnectionState::Open && self.shared.live().is_some() {
            return Ok(());
        }
        self.start();

        let mut rx = self.shared.state.subscribe();
        let wait = async {
            loop {
                if let Some(reason) = self.shared.terminal_reason() {
                    return Err(Error::BrokerUnavailable(reason));
                }
                let open = *rx.borrow_and_update() == ConnectionState::Open;
                if open && self.shared.live().is_some() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(Error::BrokerUnavailable(
                        "connection manager dropped".to_string(),
                    ));
                }
            }
        };

        let limit = self.shared.settings.wait_timeout;
        match tokio::time::timeout(limit, wait).await {
            Ok(r) => r,
            Err(_) => Err(Error::BrokerUnavailable(format!(
                "not connected after {}ms",
                limit.as_millis()
            ))),
        }
    }

    pub async fn open_channel(&self, role: ChannelRole) -> Result<BusChannel> {
        self.ensure_connected().await?;
        let live = self
            .shared
            .live()
            .ok_or_else(|| Error::Broker("connection lost while opening a channel".to_string()))?;
        let raw = live.connection.open_channel().await?;

        let channel = BusChannel {
            inner: Arc::new(ChannelInner {
                id: self.shared.next_channel_id.fetch_add(1, Ordering::Relaxed),
                role,
                generation: live.generation,
                channel: tokio::sync::Mutex::new(Some(raw)),
                closed: AtomicBool::new(false),
            }),
        };
        {
            let mut tracked = lock(&self.shared.channels);
            tracked.retain(|w| w.strong_count() > 0);
            tracked.push(Arc::downgrade(&channel.inner));
        }

        if let Some(reason) = self.shared.terminal_reason() {
            let _ = channel.close().await;
            return Err(Error::BrokerUnavailable(reason));
        }
        debug!(
            channel = channel.inner.id,
            role = ?role,
            generation = live.generation,
            "channel opened"
        );
        Ok(channel)
    }

    /// Stop token for a consumer; cancelled by `close`.
    pub(crate) fn consumer_token(&self) -> CancellationToken {
        self.shared.consumers.child_token()
    }

    /// Held while one delivery is handled and settled. `close` waits for
    /// every outstanding guard before closing channels.
    pub(crate) async fn settlement_guard(&self) -> OwnedRwLockReadGuard<()> {
        self.shared.settling.clone().read_owned().await
    }

    /// Remember `topology` for every future reconnect and declare it now if a
    /// connection is live.
    pub async fn register_queue(&self, topology: QueueTopology) -> Result<()> {
        let _declaring = self.shared.declare_lock.lock().await;
        {
            let mut topologies = lock(&self.shared.topologies);
            match topologies.iter_mut().find(|t| t.queue == topology.queue) {
                Some(existing) => {
                    for key in &topology.routing_keys {
                        if !existing.routing_keys.contains(key) {
                            existing.routing_keys.push(key.clone());
                        }
                    }
                }
                None => topologies.push(topology.clone()),
            }
        }

        let Some(live) = self.shared.live() else {
            return Ok(());
        };
        let channel = live.connection.open_channel().await?;
        let declared = declare_queue(
            channel.as_ref(),
            &self.shared.settings.exchange,
            &self.shared.settings.dead_letter_exchange,
            &topology,
        )
        .await;
        let _ = channel.close().await;
        declared
    }

    /// Terminal shutdown: stop consumers and drain their in-flight
    /// settlements, stop reconnecting, close channels, then the connection.
    pub async fn close(&self) -> Result<()> {
        self.shared.mark_terminal("connection manager closed");

        self.shared.consumers.cancel();
        drop(self.shared.settling.write().await);
        debug!("in-flight deliveries settled");

        let channels: Vec<Arc<ChannelInner>> = lock(&self.shared.channels)
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        for inner in channels {
            if let Err(e) = (BusChannel { inner }).close().await {
                debug!(error = %e, "channel close failed");
            }
        }

        self.shared.cancel.cancel();
        let supervisor = lock(&self.shared.supervisor).take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }

        let live = lock(&self.shared.current).take();
        let result = match live {
            Some(live) => live.connection.close().await,
            None => Ok(()),
        };
        self.shared.set_state(ConnectionState::Closed);
        info!("connection manager closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBroker;
    use tokio::time::timeout;

    fn fast_settings() -> ConnectionSettings {
        ConnectionSettings {
            backoff: BackoffPolicy {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
                jitter: 0.0,
                max_attempts: None,
            },
            connect_timeout: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(2),
            ..ConnectionSettings::default()
        }
    }

    fn manager(broker: &InMemoryBroker, settings: ConnectionSettings) -> ConnectionManager {
        ConnectionManager::new(Arc::new(broker.clone()), settings)
    }

    async fn wait_for_generation(mgr: &ConnectionManager, generation: u64) {
        timeout(Duration::from_secs(2), async {
            loop {
                if mgr.generation() >= Some(generation) && mgr.state() == ConnectionState::Open {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnected in time");
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut b = Backoff::new(BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        });
        let secs: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![5, 10, 20, 40, 60, 60, 60]);

        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_never_overflows() {
        let b = Backoff::new(BackoffPolicy::default());
        assert_eq!(b.nominal(40), Duration::from_secs(60));
        assert_eq!(b.nominal(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut b = Backoff::new(BackoffPolicy::default());
        for attempt in 0..200u32 {
            let nominal = b.nominal(attempt).as_secs_f64();
            let d = b.next_delay().as_secs_f64();
            assert!(d >= nominal * 0.8 - 1e-9 && d <= nominal * 1.2 + 1e-9, "{d} vs {nominal}");
        }
    }

    #[tokio::test]
    async fn first_connect_is_immediate_and_declares_exchanges() {
        let broker = InMemoryBroker::new();
        let mgr = manager(
            &broker,
            ConnectionSettings {
                backoff: BackoffPolicy::default(),
                wait_timeout: Duration::from_secs(1),
                ..ConnectionSettings::default()
            },
        );

        mgr.ensure_connected().await.unwrap();
        assert_eq!(mgr.state(), ConnectionState::Open);
        assert_eq!(mgr.generation(), Some(1));
        assert!(broker.has_exchange("fbchat.events"));
        assert!(broker.has_exchange("fbchat.events.dlx"));

        // Idempotent.
        mgr.ensure_connected().await.unwrap();
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn register_queue_declares_queue_and_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, fast_settings());
        mgr.ensure_connected().await.unwrap();

        mgr.register_queue(QueueTopology::new("svc.cookie.changed", ["cookie.changed"]))
            .await
            .unwrap();

        assert!(broker.has_queue("svc.cookie.changed"));
        assert!(broker.has_queue("svc.cookie.changed.dlq"));
        assert_eq!(
            broker.bindings("svc.cookie.changed", "fbchat.events"),
            vec!["cookie.changed".to_string()]
        );
        assert_eq!(
            broker.bindings("svc.cookie.changed.dlq", "fbchat.events.dlx"),
            vec!["svc.cookie.changed.dlq".to_string()]
        );
    }

    #[tokio::test]
    async fn reconnect_redeclares_topology_and_bumps_generation() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, fast_settings());
        mgr.ensure_connected().await.unwrap();
        mgr.register_queue(QueueTopology::new("q", ["message.send"]))
            .await
            .unwrap();
        let before = mgr.open_channel(ChannelRole::Publisher).await.unwrap();

        broker.wipe_topology();
        broker.drop_connections();
        wait_for_generation(&mgr, 2).await;

        assert!(broker.has_exchange("fbchat.events"));
        assert!(broker.has_queue("q"));
        assert!(broker.has_queue("q.dlq"));
        assert_eq!(broker.declarations("q"), 2);
        assert!(mgr.is_stale(&before));

        let after = mgr.open_channel(ChannelRole::Publisher).await.unwrap();
        assert!(!mgr.is_stale(&after));
    }

    #[tokio::test]
    async fn connection_loss_holds_waiters_until_reconnected() {
        let broker = InMemoryBroker::new();
        let mut settings = fast_settings();
        settings.backoff.initial = Duration::from_millis(300);
        settings.backoff.max = Duration::from_millis(300);
        let mgr = manager(&broker, settings);
        mgr.ensure_connected().await.unwrap();

        let lost_at = tokio::time::Instant::now();
        broker.drop_connections();
        timeout(Duration::from_secs(1), async {
            while mgr.state() != ConnectionState::Reconnecting {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("entered Reconnecting");
        assert_eq!(mgr.generation(), None);

        let channel = mgr.open_channel(ChannelRole::Publisher).await.unwrap();
        assert!(lost_at.elapsed() >= Duration::from_millis(250));
        assert_eq!(channel.generation(), 2);
        assert_eq!(mgr.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn retries_until_the_broker_comes_back() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(3);
        let mgr = manager(&broker, fast_settings());

        mgr.ensure_connected().await.unwrap();
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_are_terminal() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let mut settings = fast_settings();
        settings.backoff.max_attempts = Some(2);
        let mgr = manager(&broker, settings);

        let err = mgr.ensure_connected().await.unwrap_err();
        assert!(matches!(err, Error::BrokerUnavailable(_)), "{err}");
        assert_eq!(mgr.state(), ConnectionState::Closed);

        broker.set_available(true);
        assert!(matches!(
            mgr.ensure_connected().await,
            Err(Error::BrokerUnavailable(_))
        ));
        assert!(matches!(
            mgr.open_channel(ChannelRole::Subscriber).await,
            Err(Error::BrokerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn wait_is_bounded() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let mut settings = fast_settings();
        settings.wait_timeout = Duration::from_millis(50);
        let mgr = manager(&broker, settings);

        assert!(matches!(
            mgr.ensure_connected().await,
            Err(Error::BrokerUnavailable(_))
        ));
        // Still retrying in the background.
        assert_ne!(mgr.state(), ConnectionState::Closed);
        broker.set_available(true);
        mgr.ensure_connected().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_terminal_and_closes_channels() {
        let broker = InMemoryBroker::new();
        let mgr = manager(&broker, fast_settings());
        let ch = mgr.open_channel(ChannelRole::Publisher).await.unwrap();

        mgr.close().await.unwrap();

        assert!(ch.is_closed());
        assert_eq!(mgr.state(), ConnectionState::Closed);
        assert!(matches!(
            mgr.ensure_connected().await,
            Err(Error::BrokerUnavailable(_))
        ));
        assert!(ch.set_prefetch(1).await.is_err());
    }

    #[tokio::test]
    async fn close_wakes_pending_waiters() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let mgr = manager(&broker, fast_settings());

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.ensure_connected().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.close().await.unwrap();

        let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::BrokerUnavailable(_))));
    }

    #[tokio::test]
    async fn dropping_the_last_handle_stops_reconnecting() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let mut settings = fast_settings();
        settings.wait_timeout = Duration::from_millis(30);
        let mgr = manager(&broker, settings);
        let _ = mgr.ensure_connected().await;

        drop(mgr);
        broker.set_available(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.connection_count(), 0);
    }
}
