//! In-process store client.
//!
//! Mirrors the passive expiry model of Redis: keys vanish once their TTL
//! elapses, either lazily when touched or when the sweeper task runs, and
//! every such removal is published to expiration subscribers. Also offers
//! failure injection for exercising the cache's degraded paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{ExpirationStream, KeyTtl, StoreClient, WriteTtl};
use crate::cache::{current_timestamp_ms, CacheEntry};
use crate::error::{CacheError, Result};

type Entries = HashMap<Vec<u8>, CacheEntry<Vec<u8>, Vec<u8>>>;

struct MemoryInner {
    entries: AsyncMutex<Entries>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    available: AtomicBool,
    subscriptions_enabled: AtomicBool,
}

// == Memory Store ==
/// Shared handle to an in-process key-value store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

/// Handle that does not keep the store alive.
#[derive(Clone)]
pub struct WeakMemoryStore {
    inner: Weak<MemoryInner>,
}

impl WeakMemoryStore {
    pub fn upgrade(&self) -> Option<MemoryStore> {
        self.inner.upgrade().map(|inner| MemoryStore { inner })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                entries: AsyncMutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                available: AtomicBool::new(true),
                subscriptions_enabled: AtomicBool::new(true),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakMemoryStore {
        WeakMemoryStore {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Starts the background sweeper that expires keys nobody touches.
    ///
    /// The task stops on its own once every handle to the store is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        crate::tasks::spawn_cleanup_task(self.downgrade(), interval)
    }

    // == Failure Injection ==
    /// When false, every command fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// When false, new expiration subscriptions are refused.
    pub fn set_subscriptions_enabled(&self, enabled: bool) {
        self.inner.subscriptions_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Ends every open expiration stream. Returns how many were closed.
    pub fn disconnect_subscribers(&self) -> usize {
        let mut subscribers = self.lock_subscribers();
        let count = subscribers.len();
        subscribers.clear();
        count
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    // == Expiration ==
    /// Removes every expired entry and publishes its key.
    ///
    /// Returns the removed keys.
    pub async fn purge_expired(&self) -> Vec<Vec<u8>> {
        let mut entries = self.inner.entries.lock().await;
        let expired: Vec<Vec<u8>> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.remove(key);
            self.publish_expired(key);
        }

        expired
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<Vec<u8>>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish_expired(&self, key: &[u8]) {
        debug!(key = %String::from_utf8_lossy(key), "Key expired");
        self.lock_subscribers()
            .retain(|tx| tx.send(key.to_vec()).is_ok());
    }

    /// Lazily expires `key` the way Redis does on access.
    fn expire_if_due(&self, entries: &mut Entries, key: &[u8]) {
        if entries.get(key).is_some_and(|entry| entry.is_expired()) {
            entries.remove(key);
            self.publish_expired(key);
        }
    }

    fn key_ttl(entries: &Entries, key: &[u8]) -> KeyTtl {
        match entries.get(key) {
            None => KeyTtl::Missing,
            Some(entry) => match entry.ttl_remaining() {
                None => KeyTtl::Persistent,
                Some(remaining) => KeyTtl::Expires(remaining),
            },
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::StoreUnavailable(
                "memory store is offline".to_string(),
            ))
        }
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let mut entries = self.inner.entries.lock().await;
        self.expire_if_due(&mut entries, key);
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn get_many(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        self.check_available()?;
        let mut entries = self.inner.entries.lock().await;
        let values = keys
            .iter()
            .map(|key| {
                self.expire_if_due(&mut entries, key);
                entries.get(key).map(|entry| entry.value.clone())
            })
            .collect();
        Ok(values)
    }

    async fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.check_available()?;
        let entry = CacheEntry::new(key.to_vec(), value.to_vec(), ttl);
        self.inner.entries.lock().await.insert(key.to_vec(), entry);
        Ok(())
    }

    async fn upsert(
        &self,
        key: &[u8],
        value: &[u8],
        on_create: WriteTtl,
        on_update: WriteTtl,
    ) -> Result<KeyTtl> {
        self.check_available()?;
        let mut entries = self.inner.entries.lock().await;
        self.expire_if_due(&mut entries, key);

        let previous = Self::key_ttl(&entries, key);
        let rule = if previous.exists() { on_update } else { on_create };
        match rule {
            WriteTtl::After(ttl) if ttl.is_zero() => {
                entries.remove(key);
            }
            WriteTtl::Keep => {
                let expire_at_ms = entries.get(key).and_then(|entry| entry.expire_at_ms);
                let entry = CacheEntry {
                    key: key.to_vec(),
                    value: value.to_vec(),
                    expire_at_ms,
                };
                entries.insert(key.to_vec(), entry);
            }
            rule => {
                let entry = CacheEntry::new(key.to_vec(), value.to_vec(), rule.applied(previous));
                entries.insert(key.to_vec(), entry);
            }
        }
        Ok(previous)
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        self.check_available()?;
        let mut entries = self.inner.entries.lock().await;
        self.expire_if_due(&mut entries, key);
        Ok(entries.remove(key).is_some())
    }

    async fn get_and_delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let mut entries = self.inner.entries.lock().await;
        self.expire_if_due(&mut entries, key);
        Ok(entries.remove(key).map(|entry| entry.value))
    }

    async fn expire(&self, key: &[u8], ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let mut entries = self.inner.entries.lock().await;
        self.expire_if_due(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expire_at_ms = Some(current_timestamp_ms() + ttl.as_millis() as i64);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &[u8]) -> Result<KeyTtl> {
        self.check_available()?;
        let mut entries = self.inner.entries.lock().await;
        self.expire_if_due(&mut entries, key);
        Ok(Self::key_ttl(&entries, key))
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationStream> {
        self.check_available()?;
        if !self.inner.subscriptions_enabled.load(Ordering::SeqCst) {
            return Err(CacheError::StoreUnavailable(
                "expiration subscriptions are refused".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_subscribers().push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
