//! Entry Store Module
//!
//! The cache facade: typed reads and writes against a remote key-value
//! store, with expiry policies applied per operation and entry events
//! dispatched to registered listeners.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::locks::KeyLocks;
use crate::cache::shadow::{ShadowRecord, ShadowTable, ShadowValue};
use crate::cache::stats::{CacheStats, StatsRecorder};
use crate::cache::{current_timestamp_ms, CacheEntry, CacheKey, CacheValue};
use crate::codec::Codec;
use crate::error::{CacheError, Result};
use crate::expiry::{ExpiryPolicy, Operation, Ttl};
use crate::listener::{
    CacheEntryEvent, EventType, ListenerConfig, ListenerId, ListenerRegistry,
};
use crate::store::{KeyTtl, StoreClient, WriteTtl};
use crate::tasks::{
    report_failures, BridgeConfig, BridgeHandle, BridgeMonitor, BridgeState, BridgeStatus,
    ErrorHandler,
};

// == Cache ==
/// A named cache backed by a remote store.
///
/// Cloning is cheap; clones share the same state. Every operation completes
/// against the store before it returns.
pub struct Cache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct CacheInner<K, V> {
    pub(crate) name: Arc<str>,
    pub(crate) key_prefix: Vec<u8>,
    pub(crate) store: Arc<dyn StoreClient>,
    pub(crate) key_codec: Arc<dyn Codec<K>>,
    pub(crate) value_codec: Arc<dyn Codec<V>>,
    pub(crate) expiry: Arc<dyn ExpiryPolicy>,
    pub(crate) store_by_value: bool,
    pub(crate) shadows: Arc<ShadowTable<K, V>>,
    pub(crate) locks: Arc<KeyLocks>,
    pub(crate) listeners: Arc<ListenerRegistry<K, V>>,
    pub(crate) stats: Arc<StatsRecorder>,
    pub(crate) monitor: Arc<BridgeMonitor>,
    pub(crate) bridge: Mutex<Option<BridgeHandle>>,
    pub(crate) bridge_config: BridgeConfig,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) closed: AtomicBool,
}

impl<K, V> Cache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub(crate) fn from_inner(inner: CacheInner<K, V>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // == Get ==
    /// Reads the value stored under `key`.
    ///
    /// If the expiry policy assigns a TTL on access, it is applied to the
    /// store before returning.
    ///
    /// # Returns
    /// The value, or `None` if the key is absent or expired.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        self.ensure_open()?;
        let store_key = self.store_key(key)?;

        let Some(raw) = self.inner.store.get(&store_key).await? else {
            self.inner.stats.record_miss();
            debug!(cache = %self.inner.name, key = ?key, "Cache miss");
            return Ok(None);
        };

        let value = self.inner.value_codec.decode(&raw)?;
        self.inner.stats.record_hit();
        debug!(cache = %self.inner.name, key = ?key, "Cache hit");

        self.touch(key, &store_key).await?;
        Ok(Some(value))
    }

    // == Put ==
    /// Writes `value` under `key`.
    ///
    /// The store decides create versus update and applies the policy's TTL
    /// for that operation in the same atomic command. A zero TTL leaves the
    /// key absent and reports the entry as expired at once.
    ///
    /// # Arguments
    /// * `key` - The key to write
    /// * `value` - The value to write
    pub async fn put(&self, key: K, value: V) -> Result<()> {
        self.ensure_open()?;
        let store_key = self.store_key(&key)?;
        let raw = self.inner.value_codec.encode(&value)?;
        let on_create = write_ttl(self.inner.expiry.ttl_for(Operation::Create, None));
        let on_update = write_ttl(self.inner.expiry.ttl_for(Operation::Update, None));

        let guard = self.inner.locks.lock(&store_key).await;
        let last_value = if self.wants(EventType::Updated) {
            self.shadow_value(&store_key)
        } else {
            None
        };

        let previous = match self
            .inner
            .store
            .upsert(&store_key, &raw, on_create, on_update)
            .await
        {
            Ok(previous) => previous,
            Err(e) => {
                warn!(cache = %self.inner.name, key = ?key, error = %e, "Write failed");
                return Err(e);
            }
        };

        let (event_type, ttl) = match previous {
            KeyTtl::Missing => (EventType::Created, on_create.applied(previous)),
            _ => (EventType::Updated, on_update.applied(previous)),
        };

        let entry = CacheEntry::new(key, value, ttl);
        match (ttl, entry.expire_at_ms) {
            (Some(ttl), _) if ttl.is_zero() => {
                self.inner.shadows.supersede(&store_key);
                drop(guard);
                return self.report_expired_on_write(entry).await;
            }
            (_, Some(expire_at_ms)) => {
                let record = ShadowRecord::new(
                    entry.key.clone(),
                    self.retain(&entry.value, &raw),
                    expire_at_ms,
                    self.inner.bridge_config.shadow_grace,
                );
                self.inner.shadows.replace(&store_key, record);
            }
            (_, None) => {
                self.inner.shadows.supersede(&store_key);
            }
        }
        drop(guard);

        self.inner.stats.record_put();
        debug!(
            cache = %self.inner.name,
            key = ?entry.key,
            ttl_ms = ?ttl.map(|d| d.as_millis() as u64),
            event = %event_type,
            "Entry written"
        );

        if self.wants(event_type) {
            let old_value = match event_type {
                EventType::Updated => last_value,
                _ => None,
            };
            self.notify(event_type, entry.key, Some(entry.value), old_value)
                .await;
        }
        Ok(())
    }

    /// Reports a write whose TTL was zero; the store already dropped the key.
    async fn report_expired_on_write(&self, entry: CacheEntry<K, V>) -> Result<()> {
        self.inner.stats.record_put();
        self.inner.stats.record_expiration();
        debug!(cache = %self.inner.name, key = ?entry.key, "Entry expired on write");

        if self.wants(EventType::Expired) {
            let value = entry.value;
            self.notify(EventType::Expired, entry.key, Some(value.clone()), Some(value))
                .await;
        }
        Ok(())
    }

    // == Put All ==
    /// Writes each entry with [`put`](Self::put), in order.
    ///
    /// Stops at the first failure; entries written before it stay written.
    pub async fn put_all<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in entries {
            self.put(key, value).await?;
        }
        Ok(())
    }

    // == Get And Remove ==
    /// Atomically reads and deletes `key`.
    ///
    /// An explicit removal never produces an `Expired` event.
    pub async fn get_and_remove(&self, key: &K) -> Result<Option<V>> {
        self.ensure_open()?;
        let store_key = self.store_key(key)?;

        let raw = {
            let _guard = self.inner.locks.lock(&store_key).await;
            let raw = self.inner.store.get_and_delete(&store_key).await?;
            self.inner.shadows.invalidate(&store_key);
            raw
        };

        let Some(raw) = raw else {
            self.inner.stats.record_miss();
            return Ok(None);
        };

        let value = self.inner.value_codec.decode(&raw)?;
        self.inner.stats.record_hit();
        self.inner.stats.record_removal();
        debug!(cache = %self.inner.name, key = ?key, "Entry taken");

        if self.wants(EventType::Removed) {
            self.notify(
                EventType::Removed,
                key.clone(),
                Some(value.clone()),
                Some(value.clone()),
            )
            .await;
        }
        Ok(Some(value))
    }

    // == Remove ==
    /// Deletes `key`.
    ///
    /// # Returns
    /// true if a key was removed.
    pub async fn remove(&self, key: &K) -> Result<bool> {
        self.ensure_open()?;
        let store_key = self.store_key(key)?;

        let (removed, shadow) = {
            let _guard = self.inner.locks.lock(&store_key).await;
            let removed = self.inner.store.delete(&store_key).await?;
            (removed, self.inner.shadows.invalidate(&store_key))
        };

        if removed {
            self.inner.stats.record_removal();
            debug!(cache = %self.inner.name, key = ?key, "Entry removed");

            if self.wants(EventType::Removed) {
                let last = shadow
                    .filter(|record| record.expire_at_ms.is_some())
                    .and_then(|record| record.value.into_value(self.inner.value_codec.as_ref()).ok());
                self.notify(EventType::Removed, key.clone(), last.clone(), last)
                    .await;
            }
        }
        Ok(removed)
    }

    // == Get All ==
    /// Reads several keys in one round trip.
    ///
    /// # Returns
    /// A map holding only the keys that were present.
    pub async fn get_all(&self, keys: &HashSet<K>) -> Result<HashMap<K, V>> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let keys: Vec<&K> = keys.iter().collect();
        let store_keys = keys
            .iter()
            .map(|key| self.store_key(key))
            .collect::<Result<Vec<_>>>()?;

        let raws = self.inner.store.get_many(&store_keys).await?;

        let mut found = HashMap::with_capacity(keys.len());
        for ((key, store_key), raw) in keys.iter().zip(&store_keys).zip(raws) {
            let Some(raw) = raw else { continue };
            let value = self.inner.value_codec.decode(&raw)?;
            self.touch(key, store_key).await?;
            found.insert((*key).clone(), value);
        }

        let hits = found.len() as u64;
        self.inner
            .stats
            .record_hits_and_misses(hits, keys.len() as u64 - hits);
        debug!(cache = %self.inner.name, requested = keys.len(), found = found.len(), "Batch read");
        Ok(found)
    }

    // == Contains Key ==
    /// Returns true if `key` is present. Does not count as an access.
    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        self.ensure_open()?;
        let store_key = self.store_key(key)?;
        Ok(self.inner.store.ttl(&store_key).await?.exists())
    }

    // == Listeners ==
    pub fn register_listener(&self, config: ListenerConfig<K, V>) -> Result<ListenerId> {
        self.ensure_open()?;
        Ok(self.inner.listeners.register(config))
    }

    /// Returns false if the id was not registered.
    pub fn deregister_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.deregister(id)
    }

    // == Close ==
    /// Stops the expiration bridge and releases listeners.
    ///
    /// Waits up to the configured close grace for the bridge and for
    /// asynchronous listener callbacks. Calling it again does nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let grace = self.inner.bridge_config.close_grace;
        if let Some(handle) = self.inner.bridge.lock().await.take() {
            handle.stop(grace).await;
        }

        if !self.inner.listeners.drain(grace).await {
            warn!(
                cache = %self.inner.name,
                in_flight = self.inner.listeners.in_flight(),
                "Listener callbacks still running after close grace"
            );
        }

        self.inner.listeners.clear();
        self.inner.shadows.clear();
        info!(cache = %self.inner.name, "Cache closed");
    }

    // == Monitoring ==
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    pub fn expiration_status(&self) -> BridgeStatus {
        self.inner.monitor.status()
    }

    /// Waits until the expiration bridge is subscribed or has given up.
    ///
    /// Expirations that happen before the bridge is active are not reported.
    pub async fn await_expiration_bridge(&self, timeout: Duration) -> BridgeState {
        self.inner.monitor.settle(timeout).await
    }

    // == Helpers ==
    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    fn store_key(&self, key: &K) -> Result<Vec<u8>> {
        let encoded = self.inner.key_codec.encode(key)?;
        let mut store_key = Vec::with_capacity(self.inner.key_prefix.len() + encoded.len());
        store_key.extend_from_slice(&self.inner.key_prefix);
        store_key.extend_from_slice(&encoded);
        Ok(store_key)
    }

    fn retain(&self, value: &V, raw: &[u8]) -> ShadowValue<V> {
        if self.inner.store_by_value {
            ShadowValue::Encoded(raw.to_vec())
        } else {
            ShadowValue::Retained(value.clone())
        }
    }

    /// Last written value known locally, if any.
    fn shadow_value(&self, store_key: &[u8]) -> Option<V> {
        self.inner
            .shadows
            .peek_value(store_key)
            .and_then(|value| value.into_value(self.inner.value_codec.as_ref()).ok())
    }

    fn wants(&self, event_type: EventType) -> bool {
        self.inner.listeners.has_listeners_for(event_type)
    }

    /// Applies the policy's access TTL to an entry that was just read.
    ///
    /// Runs under the key's guard, so the shadow record it installs holds
    /// whatever the store holds now, not the value read before.
    async fn touch(&self, key: &K, store_key: &[u8]) -> Result<()> {
        let Some(ttl) = self.inner.expiry.ttl_for(Operation::Access, None) else {
            return Ok(());
        };

        let ttl = match ttl {
            Ttl::After(ttl) if ttl.is_zero() => {
                return self.expire_on_access(key, store_key).await;
            }
            Ttl::After(ttl) => ttl,
            Ttl::Eternal => {
                debug!(cache = %self.inner.name, key = ?key, "Access cannot make an entry eternal, ignored");
                return Ok(());
            }
        };

        let _guard = self.inner.locks.lock(store_key).await;
        if !self.inner.store.expire(store_key, ttl).await? {
            return Ok(());
        }

        let expire_at_ms = current_timestamp_ms() + ttl.as_millis() as i64;
        let grace = self.inner.bridge_config.shadow_grace;
        if self.inner.shadows.refresh(store_key, expire_at_ms, grace) {
            return Ok(());
        }

        // No finite TTL was tracked for the key until now
        if let Some(raw) = self.inner.store.get(store_key).await? {
            let value = self.inner.value_codec.decode(&raw)?;
            let record = ShadowRecord::new(key.clone(), self.retain(&value, &raw), expire_at_ms, grace);
            self.inner.shadows.replace(store_key, record);
        }
        Ok(())
    }

    async fn expire_on_access(&self, key: &K, store_key: &[u8]) -> Result<()> {
        let raw = {
            let _guard = self.inner.locks.lock(store_key).await;
            self.inner.shadows.supersede(store_key);
            self.inner.store.get_and_delete(store_key).await?
        };
        let Some(raw) = raw else {
            return Ok(());
        };

        self.inner.stats.record_expiration();
        debug!(cache = %self.inner.name, key = ?key, "Entry expired on access");
        if self.wants(EventType::Expired) {
            let value = self.inner.value_codec.decode(&raw)?;
            self.notify(EventType::Expired, key.clone(), Some(value.clone()), Some(value))
                .await;
        }
        Ok(())
    }

    async fn notify(&self, event_type: EventType, key: K, value: Option<V>, old_value: Option<V>) {
        let event = CacheEntryEvent::new(Arc::clone(&self.inner.name), event_type, key)
            .with_value(value)
            .with_old_value(old_value);
        let report = self.inner.listeners.dispatch(event).await;
        report_failures(report, self.inner.error_handler.as_ref());
    }
}

/// Maps a policy decision to the TTL rule of a store write.
fn write_ttl(ttl: Option<Ttl>) -> WriteTtl {
    match ttl {
        None => WriteTtl::Keep,
        Some(Ttl::Eternal) => WriteTtl::Persist,
        Some(Ttl::After(ttl)) => WriteTtl::After(ttl),
    }
}
