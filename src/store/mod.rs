//! Store Client Module
//!
//! Boundary to the remote key-value store. Keys and values are opaque bytes.
//!
//! # Implementations
//! - [`RedisStore`]: Redis over a connection manager plus a keyspace-event subscription
//! - [`MemoryStore`]: in-process store with the same passive expiry semantics

#[cfg(test)]
mod lagging;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub use self::memory::{MemoryStore, WeakMemoryStore};
pub use self::redis_store::RedisStore;

#[cfg(test)]
pub(crate) use self::lagging::LaggingStore;

/// Stream of raw keys the store deleted because their TTL elapsed.
pub type ExpirationStream = BoxStream<'static, Vec<u8>>;

// == Key TTL ==
/// Remaining lifetime of a key as reported by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist
    Missing,
    /// The key exists without an expiration
    Persistent,
    /// The key expires after the given duration
    Expires(Duration),
}

impl KeyTtl {
    /// Interprets a Redis `PTTL` reply.
    pub fn from_pttl(millis: i64) -> Self {
        match millis {
            -2 => KeyTtl::Missing,
            ms if ms < 0 => KeyTtl::Persistent,
            ms => KeyTtl::Expires(Duration::from_millis(ms as u64)),
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, KeyTtl::Missing)
    }
}

// == Write TTL ==
/// TTL an [`upsert`](StoreClient::upsert) applies to the key it writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTtl {
    /// Keep the key's current TTL; a new key gets none
    Keep,
    /// Remove any expiration
    Persist,
    /// Expire after the duration; zero deletes the key instead of writing it
    After(Duration),
}

impl WriteTtl {
    /// TTL left on the key after the write, given its TTL before it.
    ///
    /// `None` means the key does not expire.
    pub fn applied(self, previous: KeyTtl) -> Option<Duration> {
        match (self, previous) {
            // A key about to lapse still counts as live
            (WriteTtl::Keep, KeyTtl::Expires(remaining)) => {
                Some(remaining.max(Duration::from_millis(1)))
            }
            (WriteTtl::Keep, _) | (WriteTtl::Persist, _) => None,
            (WriteTtl::After(ttl), _) => Some(ttl),
        }
    }
}

// == Store Client ==
/// Commands the cache issues against the remote store.
///
/// Every command either completes against the store or fails with
/// `StoreUnavailable`; implementations do not retry.
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    /// GET
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Fetches several keys; the result is positional.
    async fn get_many(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        futures::future::try_join_all(keys.iter().map(|key| self.get(key))).await
    }

    /// SET with an optional TTL, applied in one command.
    async fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Writes `value`, choosing its TTL by whether the key exists, in one
    /// atomic step.
    ///
    /// # Arguments
    /// * `on_create` - TTL applied when the key is absent
    /// * `on_update` - TTL applied when the key exists
    ///
    /// # Returns
    /// The key's TTL as it was just before the write.
    async fn upsert(
        &self,
        key: &[u8],
        value: &[u8],
        on_create: WriteTtl,
        on_update: WriteTtl,
    ) -> Result<KeyTtl>;

    /// DEL; returns true if a key was removed.
    async fn delete(&self, key: &[u8]) -> Result<bool>;

    /// GETDEL
    async fn get_and_delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// PEXPIRE; returns false if the key does not exist.
    async fn expire(&self, key: &[u8], ttl: Duration) -> Result<bool>;

    /// PTTL
    async fn ttl(&self, key: &[u8]) -> Result<KeyTtl>;

    /// Opens a subscription to TTL expirations.
    ///
    /// Returns once the store has acknowledged the subscription. The stream
    /// ends when the subscription connection drops.
    async fn subscribe_expirations(&self) -> Result<ExpirationStream>;
}
