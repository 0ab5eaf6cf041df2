//! Listener registry and event fan-out.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::event::{CacheEntryEvent, EventType, ListenerConfig};
use crate::error::CacheError;

// == Listener Id ==
/// Identity of a registration, returned by `register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

// == Registration ==
struct Registration<K, V> {
    id: ListenerId,
    config: ListenerConfig<K, V>,
}

impl<K, V> Registration<K, V>
where
    K: Clone,
    V: Clone,
{
    fn accepts(&self, event: &CacheEntryEvent<K, V>) -> bool {
        self.config.listens_to(event.event_type)
            && self.config.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// The event as this registration sees it.
    fn view(&self, event: &CacheEntryEvent<K, V>) -> CacheEntryEvent<K, V> {
        let mut view = event.clone();
        if !self.config.old_value_required {
            view.old_value = None;
        }
        view
    }

    async fn invoke(&self, event: &CacheEntryEvent<K, V>) -> Result<(), CacheError> {
        let outcome = AssertUnwindSafe(self.config.listener.on_event(event))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CacheError::ListenerCallback {
                listener: self.id,
                message: format!("{:#}", e),
            }),
            Err(panic) => Err(CacheError::ListenerCallback {
                listener: self.id,
                message: format!("panicked: {}", panic_message(&panic)),
            }),
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

// == In-Flight Tracking ==
/// Counts asynchronous callbacks that have not finished yet.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

// == Dispatch Report ==
/// Outcome of fanning one event out.
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Registrations whose event type and filter matched
    pub matched: usize,
    /// Synchronous callbacks that completed successfully
    pub delivered: usize,
    /// Asynchronous callbacks handed to the runtime
    pub spawned: usize,
    /// Synchronous callbacks that failed
    pub failures: Vec<CacheError>,
}

// == Listener Registry ==
/// Flat set of registrations.
///
/// `dispatch` works on a snapshot, so registering or deregistering while an
/// event is being delivered never affects that delivery.
pub struct ListenerRegistry<K, V> {
    registrations: DashMap<ListenerId, Arc<Registration<K, V>>>,
    next_id: AtomicU64,
    in_flight: Arc<InFlight>,
}

impl<K, V> Default for ListenerRegistry<K, V> {
    fn default() -> Self {
        Self {
            registrations: DashMap::new(),
            next_id: AtomicU64::new(1),
            in_flight: Arc::new(InFlight::default()),
        }
    }
}

impl<K, V> ListenerRegistry<K, V>
where
    K: Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: ListenerConfig<K, V>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(listener = %id, ?config, "Registering listener");
        self.registrations
            .insert(id, Arc::new(Registration { id, config }));
        id
    }

    /// Returns false if the id is not registered.
    pub fn deregister(&self, id: ListenerId) -> bool {
        self.registrations.remove(&id).is_some()
    }

    pub fn has_listeners_for(&self, event_type: EventType) -> bool {
        self.registrations
            .iter()
            .any(|reg| reg.config.listens_to(event_type))
    }

    /// Delivers the event to every matching registration.
    ///
    /// Synchronous listeners are awaited one after another; asynchronous ones
    /// are spawned. A failing listener is logged and recorded in the report.
    pub async fn dispatch(&self, event: CacheEntryEvent<K, V>) -> DispatchReport {
        let snapshot: Vec<Arc<Registration<K, V>>> = self
            .registrations
            .iter()
            .map(|reg| Arc::clone(reg.value()))
            .collect();

        let mut report = DispatchReport::default();

        for registration in snapshot {
            if !registration.accepts(&event) {
                continue;
            }
            report.matched += 1;
            let view = registration.view(&event);

            if registration.config.synchronous {
                match registration.invoke(&view).await {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        warn!(error = %e, key = ?view.key, event = %view.event_type, "Listener failed");
                        report.failures.push(e);
                    }
                }
            } else {
                let guard = self.in_flight.enter();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(e) = registration.invoke(&view).await {
                        warn!(error = %e, key = ?view.key, event = %view.event_type, "Asynchronous listener failed");
                    }
                });
                report.spawned += 1;
            }
        }

        report
    }

    /// Waits up to `grace` for asynchronous callbacks to finish.
    ///
    /// Returns false if callbacks were still running when the grace period ended.
    pub async fn drain(&self, grace: Duration) -> bool {
        let in_flight = Arc::clone(&self.in_flight);
        tokio::time::timeout(grace, async move {
            loop {
                let idle = in_flight.idle.notified();
                if in_flight.count.load(Ordering::SeqCst) == 0 {
                    break;
                }
                idle.await;
            }
        })
        .await
        .is_ok()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn clear(&self) {
        self.registrations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::CacheEntryListener;
    use async_trait::async_trait;
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

    struct Failing;

    #[async_trait]
    impl CacheEntryListener<String, String> for Failing {
        async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("listener rejected event")
        }
    }

    struct Panicking;

    #[async_trait]
    impl CacheEntryListener<String, String> for Panicking {
        async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            panic!("listener blew up")
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl CacheEntryListener<String, String> for Slow {
        async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    fn expired(key: &str, value: &str) -> Event {
        CacheEntryEvent::new(Arc::from("test"), EventType::Expired, key.to_string())
            .with_value(Some(value.to_string()))
            .with_old_value(Some(value.to_string()))
    }

    fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_matching_listener() {
        let registry = ListenerRegistry::new();
        let (first, mut first_rx) = recorder();
        let (second, mut second_rx) = recorder();
        registry.register(ListenerConfig::expired(first).synchronous(true));
        registry.register(ListenerConfig::expired(second).synchronous(true));

        let report = registry.dispatch(expired("k", "v")).await;

        assert_eq!(report.matched, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(first_rx.try_recv().unwrap().key, "k");
        assert_eq!(second_rx.try_recv().unwrap().key, "k");
    }

    #[tokio::test]
    async fn test_event_type_mismatch_is_skipped() {
        let registry = ListenerRegistry::new();
        let (listener, mut rx) = recorder();
        registry.register(
            ListenerConfig::new(listener)
                .events(&[EventType::Created])
                .synchronous(true),
        );

        let report = registry.dispatch(expired("k", "v")).await;
        assert_eq!(report.matched, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_filter_rejects_event() {
        let registry = ListenerRegistry::new();
        let (listener, mut rx) = recorder();
        registry.register(
            ListenerConfig::expired(listener)
                .synchronous(true)
                .filter(|event: &Event| event.key.starts_with("user:")),
        );

        registry.dispatch(expired("order:1", "v")).await;
        registry.dispatch(expired("user:1", "v")).await;

        assert_eq!(rx.try_recv().unwrap().key, "user:1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_old_value_stripped_unless_required() {
        let registry = ListenerRegistry::new();
        let (plain, mut plain_rx) = recorder();
        let (wants_old, mut old_rx) = recorder();
        registry.register(ListenerConfig::expired(plain).synchronous(true));
        registry.register(
            ListenerConfig::expired(wants_old)
                .synchronous(true)
                .old_value_required(true),
        );

        registry.dispatch(expired("k", "v")).await;

        assert_eq!(plain_rx.try_recv().unwrap().old_value, None);
        assert_eq!(old_rx.try_recv().unwrap().old_value, Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_siblings() {
        let registry = ListenerRegistry::new();
        let (listener, mut rx) = recorder();
        let failing = registry.register(ListenerConfig::expired(Arc::new(Failing)).synchronous(true));
        registry.register(ListenerConfig::expired(Arc::new(Panicking)).synchronous(true));
        registry.register(ListenerConfig::expired(listener).synchronous(true));

        let report = registry.dispatch(expired("k", "v")).await;

        assert_eq!(report.matched, 3);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().any(|e| matches!(
            e,
            CacheError::ListenerCallback { listener, .. } if *listener == failing
        )));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_async_listener_runs_in_background() {
        let registry = ListenerRegistry::new();
        let (listener, mut rx) = recorder();
        registry.register(ListenerConfig::expired(Arc::new(Failing)));
        registry.register(ListenerConfig::expired(listener));

        let report = registry.dispatch(expired("k", "v")).await;

        assert_eq!(report.spawned, 2);
        assert!(report.failures.is_empty(), "async failures never reach the dispatcher");
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.value.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_deregister_stops_delivery() {
        let registry = ListenerRegistry::new();
        let (listener, mut rx) = recorder();
        let id = registry.register(ListenerConfig::expired(listener).synchronous(true));

        assert!(registry.deregister(id));
        assert!(!registry.deregister(id));
        registry.dispatch(expired("k", "v")).await;

        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_for_async_callbacks() {
        let registry = ListenerRegistry::new();
        registry.register(ListenerConfig::expired(Arc::new(Slow(Duration::from_millis(50)))));

        registry.dispatch(expired("k", "v")).await;
        assert_eq!(registry.in_flight(), 1);

        assert!(registry.drain(Duration::from_secs(2)).await);
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_gives_up_after_grace() {
        let registry = ListenerRegistry::new();
        registry.register(ListenerConfig::expired(Arc::new(Slow(Duration::from_secs(5)))));

        registry.dispatch(expired("k", "v")).await;
        assert!(!registry.drain(Duration::from_millis(20)).await);
    }

    #[test]
    fn test_has_listeners_for() {
        let registry: ListenerRegistry<String, String> = ListenerRegistry::new();
        assert!(!registry.has_listeners_for(EventType::Expired));
        let (listener, _rx) = recorder();
        registry.register(ListenerConfig::expired(listener));
        assert!(registry.has_listeners_for(EventType::Expired));
        assert!(!registry.has_listeners_for(EventType::Created));
    }
}
