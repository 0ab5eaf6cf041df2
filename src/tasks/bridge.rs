//! Expiration Bridge
//!
//! Background task that turns the store's silent TTL deletions into
//! `Expired` cache entry events.
//!
//! The bridge subscribes to the store's expiration stream and, for every
//! expired key belonging to its cache, consumes the key's shadow record to
//! recover the last value before dispatching the event to the listener
//! registry. It shares nothing with the read/write path except the shadow
//! table and the registry.
//!
//! # Lifecycle
//! `Stopped -> Subscribing -> Active -> Stopped`. A dropped subscription is
//! retried with exponential backoff; a subscription that drops before it was
//! stable counts as a failed attempt. When retries are exhausted the loss is
//! reported once to the error handler and the bridge stays `Stopped` in a
//! degraded state. Cache operations are unaffected either way.
//!
//! Shadow records are pruned on a timer in every state until the bridge is
//! shut down.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::locks::KeyLocks;
use crate::cache::shadow::{ShadowLookup, ShadowTable};
use crate::cache::stats::StatsRecorder;
use crate::cache::current_timestamp_ms;
use crate::codec::Codec;
use crate::error::CacheError;
use crate::listener::{CacheEntryEvent, DispatchReport, EventType, ListenerRegistry};
use crate::store::{ExpirationStream, StoreClient};

/// Callback receiving errors that have no caller to return to.
pub type ErrorHandler = Arc<dyn Fn(&CacheError) + Send + Sync>;

// == Bridge Config ==
/// Tuning for the expiration bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How far ahead of the local clock a shadow record may expire and still
    /// match an expiration event
    pub clock_skew_tolerance: Duration,
    /// How long a shadow record outlives its TTL before it is pruned
    pub shadow_grace: Duration,
    /// Interval between shadow prunes
    pub prune_interval: Duration,
    /// Consecutive failed subscription attempts tolerated before giving up
    pub max_resubscribe_attempts: u32,
    /// A subscription that drops sooner than this counts as a failed attempt
    pub stable_subscription: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on how long close waits for the bridge and for
    /// asynchronous listeners
    pub close_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            clock_skew_tolerance: Duration::from_millis(50),
            shadow_grace: Duration::from_secs(30),
            prune_interval: Duration::from_secs(1),
            max_resubscribe_attempts: 5,
            stable_subscription: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            close_grace: Duration::from_secs(2),
        }
    }
}

// == Bridge State ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Stopped,
    Subscribing,
    Active,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Stopped => write!(f, "stopped"),
            BridgeState::Subscribing => write!(f, "subscribing"),
            BridgeState::Active => write!(f, "active"),
        }
    }
}

// == Bridge Status ==
/// Snapshot of the bridge for operational monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeStatus {
    pub state: BridgeState,
    /// True once the subscription was permanently lost
    pub degraded: bool,
    /// Expired keys received from the store, including other caches' keys
    pub events_received: u64,
    /// Expired events handed to the listener registry
    pub events_delivered: u64,
    /// Stale expirations dropped because the key had been rewritten
    pub events_suppressed: u64,
    /// Subscription drops
    pub resubscribes: u64,
}

// == Bridge Monitor ==
/// State shared between the bridge task and the cache.
pub struct BridgeMonitor {
    state: watch::Sender<BridgeState>,
    degraded: AtomicBool,
    received: AtomicU64,
    delivered: AtomicU64,
    suppressed: AtomicU64,
    resubscribes: AtomicU64,
}

impl Default for BridgeMonitor {
    fn default() -> Self {
        let (state, _) = watch::channel(BridgeState::Stopped);
        Self {
            state,
            degraded: AtomicBool::new(false),
            received: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            resubscribes: AtomicU64::new(0),
        }
    }
}

impl BridgeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_state(&self, state: BridgeState) {
        self.state.send_replace(state);
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            state: self.state(),
            degraded: self.is_degraded(),
            events_received: self.received.load(Ordering::Relaxed),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            events_suppressed: self.suppressed.load(Ordering::Relaxed),
            resubscribes: self.resubscribes.load(Ordering::Relaxed),
        }
    }

    /// Waits until the bridge is active or has given up.
    ///
    /// Returns the state reached, or the current state on timeout.
    pub async fn settle(&self, timeout: Duration) -> BridgeState {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state == BridgeState::Active || self.is_degraded()),
        )
        .await;

        match settled {
            Ok(Ok(state)) => *state,
            _ => self.state(),
        }
    }
}

// == Bridge Handle ==
/// Owner-side handle used to stop the bridge.
pub struct BridgeHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BridgeHandle {
    /// Signals the receive loop to stop and waits up to `grace` for it.
    ///
    /// Past the grace period the task is aborted.
    pub async fn stop(mut self, grace: Duration) {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(_) => debug!("Expiration bridge stopped"),
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "Expiration bridge did not stop in time, aborting");
                self.task.abort();
            }
        }
    }
}

enum LoopExit {
    Shutdown,
    StreamEnded,
}

// == Expiration Bridge ==
pub struct ExpirationBridge<K, V> {
    pub(crate) cache_name: Arc<str>,
    pub(crate) key_prefix: Vec<u8>,
    pub(crate) store: Arc<dyn StoreClient>,
    pub(crate) key_codec: Arc<dyn Codec<K>>,
    pub(crate) value_codec: Arc<dyn Codec<V>>,
    pub(crate) shadows: Arc<ShadowTable<K, V>>,
    pub(crate) locks: Arc<KeyLocks>,
    pub(crate) listeners: Arc<ListenerRegistry<K, V>>,
    pub(crate) stats: Arc<StatsRecorder>,
    pub(crate) monitor: Arc<BridgeMonitor>,
    pub(crate) config: BridgeConfig,
    pub(crate) error_handler: Option<ErrorHandler>,
}

impl<K, V> ExpirationBridge<K, V>
where
    K: Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Starts the receive loop and the shadow pruner on their own task.
    pub fn spawn(self) -> BridgeHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            tokio::join!(self.run(shutdown_rx.clone()), self.prune_shadows(shutdown_rx));
        });
        BridgeHandle { shutdown, task }
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        let mut backoff = self.config.initial_backoff;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.monitor.set_state(BridgeState::Subscribing);
            let subscribed = tokio::select! {
                result = self.store.subscribe_expirations() => result,
                _ = shutdown.changed() => break,
            };

            let outcome = match subscribed {
                Ok(stream) => {
                    let opened = Instant::now();
                    self.monitor.set_state(BridgeState::Active);
                    info!(cache = %self.cache_name, "Expiration bridge active");

                    match self.receive(stream, &mut shutdown).await {
                        LoopExit::Shutdown => break,
                        LoopExit::StreamEnded => {
                            self.monitor.resubscribes.fetch_add(1, Ordering::Relaxed);
                            if opened.elapsed() >= self.config.stable_subscription {
                                warn!(cache = %self.cache_name, "Expiration subscription dropped, resubscribing");
                                failures = 0;
                                backoff = self.config.initial_backoff;
                                Ok(())
                            } else {
                                Err(CacheError::SubscriptionLost(
                                    "expiration stream ended right after subscribing".to_string(),
                                ))
                            }
                        }
                    }
                }
                Err(e) => Err(e),
            };

            let wait = match outcome {
                Ok(()) => self.config.initial_backoff,
                Err(e) => {
                    failures += 1;
                    if failures > self.config.max_resubscribe_attempts {
                        self.give_up(failures - 1, e);
                        break;
                    }
                    warn!(
                        cache = %self.cache_name,
                        error = %e,
                        attempt = failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "Expiration subscription failed, retrying"
                    );
                    let wait = backoff;
                    backoff = (backoff * 2).min(self.config.max_backoff);
                    wait
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
        }

        self.monitor.set_state(BridgeState::Stopped);
        debug!(cache = %self.cache_name, "Expiration bridge loop exited");
    }

    /// Drops shadow records past their grace window until shutdown.
    async fn prune_shadows(&self, mut shutdown: watch::Receiver<bool>) {
        let mut prune = tokio::time::interval(self.config.prune_interval);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = prune.tick() => {
                    let pruned = self.shadows.prune(current_timestamp_ms());
                    if pruned > 0 {
                        debug!(cache = %self.cache_name, pruned, "Pruned shadow records");
                    }
                }
            }
        }
    }

    fn give_up(&self, retries: u32, last_error: CacheError) {
        let lost = CacheError::SubscriptionLost(format!(
            "gave up after {} retries: {}",
            retries, last_error
        ));
        error!(cache = %self.cache_name, error = %lost, "Expiration notifications disabled");
        self.monitor.degraded.store(true, Ordering::SeqCst);
        if let Some(handler) = &self.error_handler {
            handler(&lost);
        }
    }

    async fn receive(
        &self,
        mut stream: ExpirationStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LoopExit {
        loop {
            tokio::select! {
                _ = shutdown.changed() => return LoopExit::Shutdown,
                next = stream.next() => match next {
                    Some(raw_key) => self.handle_expired(raw_key).await,
                    None => return LoopExit::StreamEnded,
                },
            }
        }
    }

    /// Resolves one raw expired key into an `Expired` event.
    async fn handle_expired(&self, raw_key: Vec<u8>) {
        self.monitor.received.fetch_add(1, Ordering::Relaxed);

        let Some(encoded_key) = raw_key.strip_prefix(self.key_prefix.as_slice()) else {
            return;
        };

        let lookup = {
            // Waits out a write of the same key that is still in flight
            let _guard = self.locks.lock(&raw_key).await;
            self.shadows.take_expired(
                &raw_key,
                current_timestamp_ms(),
                self.config.clock_skew_tolerance,
            )
        };

        let (key, value) = match lookup {
            ShadowLookup::Expired(record) => {
                let value = match record.value.into_value(self.value_codec.as_ref()) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(key = ?record.key, error = %e, "Could not decode shadow value");
                        None
                    }
                };
                (record.key, value)
            }
            ShadowLookup::Superseded => {
                self.monitor.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(cache = %self.cache_name, "Suppressed expiration of rewritten key");
                return;
            }
            ShadowLookup::Missing => match self.key_codec.decode(encoded_key) {
                Ok(key) => (key, None),
                Err(e) => {
                    warn!(cache = %self.cache_name, error = %e, "Could not decode expired key");
                    return;
                }
            },
        };

        self.stats.record_expiration();
        debug!(cache = %self.cache_name, key = ?key, "Entry expired");

        if !self.listeners.has_listeners_for(EventType::Expired) {
            return;
        }

        let event = CacheEntryEvent::new(Arc::clone(&self.cache_name), EventType::Expired, key)
            .with_value(value.clone())
            .with_old_value(value);
        self.monitor.delivered.fetch_add(1, Ordering::Relaxed);
        let report = self.listeners.dispatch(event).await;
        report_failures(report, self.error_handler.as_ref());
    }
}

/// Forwards synchronous listener failures to the error handler.
pub(crate) fn report_failures(report: DispatchReport, handler: Option<&ErrorHandler>) {
    if let Some(handler) = handler {
        for failure in &report.failures {
            handler(failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::shadow::{ShadowRecord, ShadowValue};
    use crate::codec::Utf8Codec;
    use crate::listener::{CacheEntryListener, ListenerConfig};
    use crate::store::{LaggingStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    type Event = CacheEntryEvent<String, String>;

    struct Recorder(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl CacheEntryListener<String, String> for Recorder {
        async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    struct Fixture {
        store: MemoryStore,
        shadows: Arc<ShadowTable<String, String>>,
        monitor: Arc<BridgeMonitor>,
        events: mpsc::UnboundedReceiver<Event>,
        errors: Arc<Mutex<Vec<CacheError>>>,
        handle: BridgeHandle,
    }

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            max_resubscribe_attempts: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            ..BridgeConfig::default()
        }
    }

    fn start(store: MemoryStore, config: BridgeConfig) -> Fixture {
        let client = Arc::new(store.clone());
        start_with(store, client, config)
    }

    fn start_with(store: MemoryStore, client: Arc<dyn StoreClient>, config: BridgeConfig) -> Fixture {
        let shadows = Arc::new(ShadowTable::new());
        let listeners = Arc::new(ListenerRegistry::new());
        let monitor = Arc::new(BridgeMonitor::new());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let (tx, events) = mpsc::unbounded_channel();
        listeners.register(ListenerConfig::expired(Arc::new(Recorder(tx))).synchronous(true));

        let sink = Arc::clone(&errors);
        let bridge = ExpirationBridge {
            cache_name: Arc::from("test"),
            key_prefix: b"test:".to_vec(),
            store: client,
            key_codec: Arc::new(Utf8Codec),
            value_codec: Arc::new(Utf8Codec),
            shadows: Arc::clone(&shadows),
            locks: Arc::new(KeyLocks::new()),
            listeners,
            stats: Arc::new(StatsRecorder::new()),
            monitor: Arc::clone(&monitor),
            config,
            error_handler: Some(Arc::new(move |e: &CacheError| {
                sink.lock().unwrap().push(e.clone());
            })),
        };

        Fixture {
            store,
            shadows,
            monitor,
            events,
            errors,
            handle: bridge.spawn(),
        }
    }

    async fn expire_key(store: &MemoryStore, key: &[u8]) {
        store
            .set_with_ttl(key, b"ignored", Some(Duration::ZERO))
            .await
            .unwrap();
        store.purge_expired().await;
    }

    #[tokio::test]
    async fn test_expiration_carries_shadow_value() {
        let mut fx = start(MemoryStore::new(), fast_config());
        assert_eq!(fx.monitor.settle(Duration::from_secs(1)).await, BridgeState::Active);

        let now = current_timestamp_ms();
        fx.shadows.replace(
            b"test:123",
            ShadowRecord::new(
                "123".to_string(),
                ShadowValue::Retained("90".to_string()),
                now,
                Duration::from_secs(30),
            ),
        );
        expire_key(&fx.store, b"test:123").await;

        let event = tokio::time::timeout(Duration::from_secs(1), fx.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, EventType::Expired);
        assert_eq!(event.key, "123");
        assert_eq!(event.value.as_deref(), Some("90"));
        assert!(fx.shadows.is_empty());

        fx.handle.stop(Duration::from_secs(1)).await;
        assert_eq!(fx.monitor.state(), BridgeState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_shadow_delivers_without_value() {
        let mut fx = start(MemoryStore::new(), fast_config());
        fx.monitor.settle(Duration::from_secs(1)).await;

        expire_key(&fx.store, b"test:orphan").await;

        let event = tokio::time::timeout(Duration::from_secs(1), fx.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "orphan");
        assert_eq!(event.value, None);
        fx.handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_foreign_and_superseded_keys_are_dropped() {
        let mut fx = start(MemoryStore::new(), fast_config());
        fx.monitor.settle(Duration::from_secs(1)).await;

        fx.shadows.replace(
            b"test:fresh",
            ShadowRecord::new(
                "fresh".to_string(),
                ShadowValue::Retained("new".to_string()),
                current_timestamp_ms() + 60_000,
                Duration::from_secs(30),
            ),
        );
        expire_key(&fx.store, b"other:key").await;
        expire_key(&fx.store, b"test:fresh").await;
        expire_key(&fx.store, b"test:marker").await;

        let event = tokio::time::timeout(Duration::from_secs(1), fx.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "marker", "only the marker should be delivered");

        let status = fx.monitor.status();
        assert_eq!(status.events_received, 3);
        assert_eq!(status.events_suppressed, 1);
        assert_eq!(status.events_delivered, 1);
        assert_eq!(fx.shadows.len(), 1);
        fx.handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_resubscribes_after_stream_drop() {
        let mut fx = start(MemoryStore::new(), fast_config());
        fx.monitor.settle(Duration::from_secs(1)).await;

        assert_eq!(fx.store.disconnect_subscribers(), 1);
        tokio::time::timeout(Duration::from_secs(1), async {
            while fx.store.subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bridge should resubscribe");

        expire_key(&fx.store, b"test:after").await;
        let event = tokio::time::timeout(Duration::from_secs(1), fx.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.key, "after");
        assert!(fx.monitor.status().resubscribes >= 1);
        assert!(!fx.monitor.is_degraded());
        fx.handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_permanent_loss_degrades_once() {
        let store = MemoryStore::new();
        store.set_subscriptions_enabled(false);
        let fx = start(store, fast_config());

        let state = fx.monitor.settle(Duration::from_secs(2)).await;
        assert!(fx.monitor.is_degraded());
        tokio::time::timeout(Duration::from_secs(1), async {
            while fx.monitor.state() != BridgeState::Stopped {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bridge should stop");
        assert_ne!(state, BridgeState::Active);

        let errors = fx.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], CacheError::SubscriptionLost(_)));
        fx.handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_short_lived_subscriptions_count_as_failures() {
        let store = MemoryStore::new();
        let client = Arc::new(LaggingStore::new(store.clone()).short_lived_subscriptions());
        let fx = start_with(store, client, fast_config());

        tokio::time::timeout(Duration::from_secs(1), async {
            while !fx.monitor.is_degraded() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("bridge should give up on a flapping subscription");

        let errors = fx.errors.lock().unwrap().clone();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], CacheError::SubscriptionLost(_)));
        assert_eq!(fx.monitor.status().resubscribes, 3);
        fx.handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_prunes_while_degraded() {
        let store = MemoryStore::new();
        store.set_subscriptions_enabled(false);
        let config = BridgeConfig {
            prune_interval: Duration::from_millis(10),
            ..fast_config()
        };
        let fx = start(store, config);
        fx.monitor.settle(Duration::from_secs(1)).await;
        assert!(fx.monitor.is_degraded());

        let now = current_timestamp_ms();
        for i in 0..50 {
            fx.shadows.replace(
                format!("test:{}", i).as_bytes(),
                ShadowRecord::new(
                    i.to_string(),
                    ShadowValue::Retained("v".to_string()),
                    now,
                    Duration::from_millis(10),
                ),
            );
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while !fx.shadows.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("shadows should be pruned without a subscription");
        fx.handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_is_prompt_while_backing_off() {
        let store = MemoryStore::new();
        store.set_subscriptions_enabled(false);
        let config = BridgeConfig {
            max_resubscribe_attempts: 100,
            initial_backoff: Duration::from_secs(60),
            ..BridgeConfig::default()
        };
        let fx = start(store, config);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        fx.handle.stop(Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(fx.monitor.state(), BridgeState::Stopped);
    }
}
