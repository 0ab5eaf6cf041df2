//! Cache Entry Module
//!
//! Defines a key/value pair together with its absolute expiration time.

use std::time::Duration;

// == Cache Entry ==
/// A single entry with its expiration metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<K, V> {
    /// The entry key
    pub key: K,
    /// The stored value
    pub value: V,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expire_at_ms: Option<i64>,
}

impl<K, V> CacheEntry<K, V> {
    // == Constructor ==
    /// Creates a new entry expiring `ttl` from now.
    ///
    /// # Arguments
    /// * `key` - The entry key
    /// * `value` - The value to store
    /// * `ttl` - Optional TTL, None = never expires
    pub fn new(key: K, value: V, ttl: Option<Duration>) -> Self {
        let expire_at_ms = ttl.map(|ttl| current_timestamp_ms() + ttl.as_millis() as i64);

        Self {
            key,
            value,
            expire_at_ms,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time reaches its expiration time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Checks expiry against a given timestamp.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        match self.expire_at_ms {
            Some(expires) => now_ms >= expires,
            None => false,
        }
    }

    // == Time To Live ==
    /// Returns the remaining TTL, or None if no expiration is set.
    ///
    /// # Returns
    /// - `Some(Duration::ZERO)` if the entry has expired
    /// - `Some(remaining)` if the entry has a TTL that has not elapsed
    /// - `None` if the entry never expires
    pub fn ttl_remaining(&self) -> Option<Duration> {
        self.expire_at_ms.map(|expires| {
            let remaining = expires - current_timestamp_ms();
            Duration::from_millis(remaining.max(0) as u64)
        })
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
