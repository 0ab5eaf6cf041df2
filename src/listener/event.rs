//! Cache entry events and listener configuration.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

// == Event Type ==
/// Kind of change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Removed,
    Expired,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Created,
        EventType::Updated,
        EventType::Removed,
        EventType::Expired,
    ];
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Created => write!(f, "created"),
            EventType::Updated => write!(f, "updated"),
            EventType::Removed => write!(f, "removed"),
            EventType::Expired => write!(f, "expired"),
        }
    }
}

// == Cache Entry Event ==
/// A change to a single cache entry.
///
/// For `Expired` and `Removed` events `value` is the last known value, which
/// may be unknown. `old_value` is only populated for listeners registered
/// with `old_value_required`.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntryEvent<K, V> {
    pub cache_name: Arc<str>,
    pub event_type: EventType,
    pub key: K,
    pub value: Option<V>,
    pub old_value: Option<V>,
}

impl<K, V> CacheEntryEvent<K, V> {
    pub fn new(cache_name: Arc<str>, event_type: EventType, key: K) -> Self {
        Self {
            cache_name,
            event_type,
            key,
            value: None,
            old_value: None,
        }
    }

    pub fn with_value(mut self, value: Option<V>) -> Self {
        self.value = value;
        self
    }

    pub fn with_old_value(mut self, old_value: Option<V>) -> Self {
        self.old_value = old_value;
        self
    }
}

// == Listener ==
/// Receives cache entry events.
///
/// Returning an error reports a listener failure; it never affects other
/// listeners or the operation that produced the event.
#[async_trait]
pub trait CacheEntryListener<K, V>: Send + Sync {
    async fn on_event(&self, event: &CacheEntryEvent<K, V>) -> anyhow::Result<()>;
}

/// Predicate deciding whether a listener sees an event.
pub type EventFilter<K, V> = Arc<dyn Fn(&CacheEntryEvent<K, V>) -> bool + Send + Sync>;

// == Listener Config ==
/// How a listener is registered.
///
/// Defaults: every event type, no filter, asynchronous dispatch, no old value.
pub struct ListenerConfig<K, V> {
    pub(crate) listener: Arc<dyn CacheEntryListener<K, V>>,
    pub(crate) event_types: Vec<EventType>,
    pub(crate) filter: Option<EventFilter<K, V>>,
    pub(crate) synchronous: bool,
    pub(crate) old_value_required: bool,
}

impl<K, V> ListenerConfig<K, V> {
    pub fn new(listener: Arc<dyn CacheEntryListener<K, V>>) -> Self {
        Self {
            listener,
            event_types: EventType::ALL.to_vec(),
            filter: None,
            synchronous: false,
            old_value_required: false,
        }
    }

    /// Registration for expiration events only.
    pub fn expired(listener: Arc<dyn CacheEntryListener<K, V>>) -> Self {
        Self::new(listener).events(&[EventType::Expired])
    }

    pub fn events(mut self, event_types: &[EventType]) -> Self {
        self.event_types = event_types.to_vec();
        self
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&CacheEntryEvent<K, V>) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }

    pub fn old_value_required(mut self, required: bool) -> Self {
        self.old_value_required = required;
        self
    }

    pub fn is_synchronous(&self) -> bool {
        self.synchronous
    }

    pub fn listens_to(&self, event_type: EventType) -> bool {
        self.event_types.contains(&event_type)
    }
}

impl<K, V> Clone for ListenerConfig<K, V> {
    fn clone(&self) -> Self {
        Self {
            listener: Arc::clone(&self.listener),
            event_types: self.event_types.clone(),
            filter: self.filter.clone(),
            synchronous: self.synchronous,
            old_value_required: self.old_value_required,
        }
    }
}

impl<K, V> fmt::Debug for ListenerConfig<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("event_types", &self.event_types)
            .field("filtered", &self.filter.is_some())
            .field("synchronous", &self.synchronous)
            .field("old_value_required", &self.old_value_required)
            .finish()
    }
}
