//! Cache Builder Module
//!
//! Assembles a [`Cache`] from a store, codecs, an expiry policy and the
//! initial listener registrations, and starts its expiration bridge.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::cache::locks::KeyLocks;
use crate::cache::shadow::ShadowTable;
use crate::cache::stats::StatsRecorder;
use crate::cache::store::{Cache, CacheInner};
use crate::cache::{CacheKey, CacheValue};
use crate::codec::{Codec, JsonCodec, Utf8Codec};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::expiry::{EternalExpiryPolicy, ExpiryPolicy};
use crate::listener::{ListenerConfig, ListenerRegistry};
use crate::store::StoreClient;
use crate::tasks::{BridgeConfig, BridgeMonitor, ErrorHandler, ExpirationBridge};

/// Separates the cache name from the encoded key in store keys
pub const KEY_SEPARATOR: char = ':';

// == Cache Builder ==
pub struct CacheBuilder<K, V> {
    name: String,
    store: Arc<dyn StoreClient>,
    key_codec: Arc<dyn Codec<K>>,
    value_codec: Arc<dyn Codec<V>>,
    expiry: Arc<dyn ExpiryPolicy>,
    store_by_value: bool,
    listeners: Vec<ListenerConfig<K, V>>,
    bridge_config: BridgeConfig,
    error_handler: Option<ErrorHandler>,
}

impl CacheBuilder<String, String> {
    /// Builder for a cache of UTF-8 strings.
    pub fn strings(name: impl Into<String>, store: Arc<dyn StoreClient>) -> Self {
        Self::with_codecs(name, store, Arc::new(Utf8Codec), Arc::new(Utf8Codec))
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: CacheKey + Serialize + DeserializeOwned,
    V: CacheValue + Serialize + DeserializeOwned,
{
    /// Builder for a cache whose keys and values are stored as JSON.
    pub fn json(name: impl Into<String>, store: Arc<dyn StoreClient>) -> Self {
        Self::with_codecs(
            name,
            store,
            Arc::new(JsonCodec::<K>::new()),
            Arc::new(JsonCodec::<V>::new()),
        )
    }
}

impl<K, V> CacheBuilder<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    // == Constructor ==
    /// Creates a builder with an eternal expiry policy and store-by-value
    /// semantics.
    ///
    /// # Arguments
    /// * `name` - Cache name; also the prefix of every key in the store
    /// * `store` - Client for the remote store
    /// * `key_codec` - Encodes keys to store bytes
    /// * `value_codec` - Encodes values to store bytes
    pub fn with_codecs(
        name: impl Into<String>,
        store: Arc<dyn StoreClient>,
        key_codec: Arc<dyn Codec<K>>,
        value_codec: Arc<dyn Codec<V>>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            key_codec,
            value_codec,
            expiry: Arc::new(EternalExpiryPolicy),
            store_by_value: true,
            listeners: Vec::new(),
            bridge_config: BridgeConfig::default(),
            error_handler: None,
        }
    }

    pub fn expiry_policy(mut self, policy: Arc<dyn ExpiryPolicy>) -> Self {
        self.expiry = policy;
        self
    }

    /// When false, the values kept for expiration events are clones of the
    /// caller's values instead of their encoded bytes.
    pub fn store_by_value(mut self, store_by_value: bool) -> Self {
        self.store_by_value = store_by_value;
        self
    }

    /// Registers a listener before the expiration bridge starts.
    pub fn listener(mut self, config: ListenerConfig<K, V>) -> Self {
        self.listeners.push(config);
        self
    }

    pub fn bridge_config(mut self, config: BridgeConfig) -> Self {
        self.bridge_config = config;
        self
    }

    /// Receives errors raised off the caller's path: listener failures and
    /// a permanently lost expiration subscription.
    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CacheError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Applies the expiry policy, storage semantics and bridge tuning of `config`.
    pub fn configure(self, config: &Config) -> Self {
        self.expiry_policy(config.expiry_policy())
            .store_by_value(config.store_by_value)
            .bridge_config(config.bridge_config())
    }

    // == Build ==
    /// Builds the cache and starts its expiration bridge.
    ///
    /// Must be called within a Tokio runtime.
    pub fn build(self) -> Result<Cache<K, V>> {
        if self.name.is_empty() {
            return Err(CacheError::InvalidConfig(
                "cache name must not be empty".to_string(),
            ));
        }
        // ':' separates the name from the key; a name holding it would
        // overlap the key space of another cache
        if self.name.contains(KEY_SEPARATOR) {
            return Err(CacheError::InvalidConfig(format!(
                "cache name '{}' must not contain '{}'",
                self.name, KEY_SEPARATOR
            )));
        }
        tokio::runtime::Handle::try_current().map_err(|_| {
            CacheError::InvalidConfig("a Tokio runtime is required to build a cache".to_string())
        })?;

        let name: Arc<str> = Arc::from(self.name.as_str());
        let key_prefix = format!("{}{}", self.name, KEY_SEPARATOR).into_bytes();
        let shadows = Arc::new(ShadowTable::new());
        let locks = Arc::new(KeyLocks::new());
        let listeners = Arc::new(ListenerRegistry::new());
        let stats = Arc::new(StatsRecorder::new());
        let monitor = Arc::new(BridgeMonitor::new());

        for config in self.listeners {
            listeners.register(config);
        }

        let bridge = ExpirationBridge {
            cache_name: Arc::clone(&name),
            key_prefix: key_prefix.clone(),
            store: Arc::clone(&self.store),
            key_codec: Arc::clone(&self.key_codec),
            value_codec: Arc::clone(&self.value_codec),
            shadows: Arc::clone(&shadows),
            locks: Arc::clone(&locks),
            listeners: Arc::clone(&listeners),
            stats: Arc::clone(&stats),
            monitor: Arc::clone(&monitor),
            config: self.bridge_config.clone(),
            error_handler: self.error_handler.clone(),
        };
        let handle = bridge.spawn();

        info!(
            cache = %name,
            policy = ?self.expiry,
            store_by_value = self.store_by_value,
            listeners = listeners.len(),
            "Cache created"
        );

        Ok(Cache::from_inner(CacheInner {
            name,
            key_prefix,
            store: self.store,
            key_codec: self.key_codec,
            value_codec: self.value_codec,
            expiry: self.expiry,
            store_by_value: self.store_by_value,
            shadows,
            locks,
            listeners,
            stats,
            monitor,
            bridge: Mutex::new(Some(handle)),
            bridge_config: self.bridge_config,
            error_handler: self.error_handler,
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tasks::BridgeState;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    struct SensorId {
        site: String,
        index: u32,
    }

    #[test]
    fn test_build_outside_runtime_fails() {
        let result = CacheBuilder::strings("test", Arc::new(MemoryStore::new())).build();
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let result = CacheBuilder::strings("", Arc::new(MemoryStore::new())).build();
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_name_with_separator_rejected() {
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        let nested = CacheBuilder::strings("a:b", Arc::clone(&store)).build();
        assert!(matches!(nested, Err(CacheError::InvalidConfig(msg)) if msg.contains("a:b")));

        let plain = CacheBuilder::strings("a", store).build().unwrap();
        assert_eq!(plain.name(), "a");
        plain.close().await;
    }

    #[tokio::test]
    async fn test_bridge_starts_eagerly() {
        let cache = CacheBuilder::strings("test", Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        assert_eq!(
            cache.await_expiration_bridge(Duration::from_secs(1)).await,
            BridgeState::Active
        );
        assert_eq!(cache.name(), "test");
        cache.close().await;
    }

    #[tokio::test]
    async fn test_json_cache_with_structured_keys() {
        let store = MemoryStore::new();
        let cache: Cache<SensorId, Vec<f64>> =
            CacheBuilder::json("sensors", Arc::new(store.clone()))
                .build()
                .unwrap();
        let id = SensorId {
            site: "north".to_string(),
            index: 3,
        };

        cache.put(id.clone(), vec![1.5, 2.5]).await.unwrap();
        assert_eq!(cache.get(&id).await.unwrap(), Some(vec![1.5, 2.5]));
        assert_eq!(
            store.get(br#"sensors:{"site":"north","index":3}"#).await.unwrap(),
            Some(b"[1.5,2.5]".to_vec())
        );
    }
}
