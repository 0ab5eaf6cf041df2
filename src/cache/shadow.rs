//! Shadow Record Module
//!
//! Keeps the last written value of keys with a finite TTL so an expiration
//! event can carry the value after the store has already dropped it.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::codec::Codec;
use crate::error::Result;

// == Shadow Value ==
/// The retained value, either as written to the store or as a clone.
#[derive(Debug, Clone)]
pub enum ShadowValue<V> {
    /// Store-by-value: the encoded bytes, decoded on delivery
    Encoded(Vec<u8>),
    /// Store-by-reference: a clone of the caller's value
    Retained(V),
}

impl<V> ShadowValue<V> {
    pub fn into_value(self, codec: &dyn Codec<V>) -> Result<V> {
        match self {
            ShadowValue::Encoded(bytes) => codec.decode(&bytes),
            ShadowValue::Retained(value) => Ok(value),
        }
    }
}

// == Shadow Record ==
#[derive(Debug, Clone)]
pub struct ShadowRecord<K, V> {
    pub key: K,
    pub value: ShadowValue<V>,
    /// Expiration timestamp (Unix milliseconds); None marks a tombstone left
    /// by an eternal overwrite
    pub expire_at_ms: Option<i64>,
    /// The record is pruned after this timestamp
    pub retain_until_ms: i64,
}

impl<K, V> ShadowRecord<K, V> {
    pub fn new(key: K, value: ShadowValue<V>, expire_at_ms: i64, grace: Duration) -> Self {
        Self {
            key,
            value,
            expire_at_ms: Some(expire_at_ms),
            retain_until_ms: expire_at_ms + grace.as_millis() as i64,
        }
    }

    fn tombstone(self) -> Self {
        Self {
            expire_at_ms: None,
            ..self
        }
    }
}

// == Shadow Lookup ==
/// Outcome of matching an expiration event against the shadow table.
#[derive(Debug)]
pub enum ShadowLookup<K, V> {
    /// The record matched the expiration and was consumed
    Expired(ShadowRecord<K, V>),
    /// The key was rewritten after the expiring write
    Superseded,
    /// No record is held for the key
    Missing,
}

// == Shadow Table ==
/// Concurrent map of shadow records keyed by store key bytes.
#[derive(Debug)]
pub struct ShadowTable<K, V> {
    records: DashMap<Vec<u8>, ShadowRecord<K, V>>,
}

impl<K, V> Default for ShadowTable<K, V> {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl<K, V> ShadowTable<K, V>
where
    K: Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the record for a finite-TTL write, returning the one it replaces.
    pub fn replace(&self, store_key: &[u8], record: ShadowRecord<K, V>) -> Option<ShadowRecord<K, V>> {
        self.records.insert(store_key.to_vec(), record)
    }

    /// Marks the key as overwritten by an eternal write.
    ///
    /// A pending expiration for the old write must not fire, so a finite
    /// record becomes a tombstone kept until its grace window ends.
    pub fn supersede(&self, store_key: &[u8]) -> Option<ShadowRecord<K, V>> {
        match self.records.entry(store_key.to_vec()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.get().clone();
                let tombstone = previous.clone().tombstone();
                entry.insert(tombstone);
                Some(previous)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Drops the record for an explicitly removed key.
    pub fn invalidate(&self, store_key: &[u8]) -> Option<ShadowRecord<K, V>> {
        self.records.remove(store_key).map(|(_, record)| record)
    }

    /// Moves the expiration of a live record after a TTL refresh.
    ///
    /// Returns false if there was no live record to move.
    pub fn refresh(&self, store_key: &[u8], expire_at_ms: i64, grace: Duration) -> bool {
        match self.records.get_mut(store_key) {
            Some(mut record) if record.expire_at_ms.is_some() => {
                record.expire_at_ms = Some(expire_at_ms);
                record.retain_until_ms = expire_at_ms + grace.as_millis() as i64;
                true
            }
            _ => false,
        }
    }

    /// Last known value of a live (non-tombstone) record.
    pub fn peek_value(&self, store_key: &[u8]) -> Option<ShadowValue<V>> {
        self.records
            .get(store_key)
            .filter(|record| record.expire_at_ms.is_some())
            .map(|record| record.value.clone())
    }

    /// Matches an expiration of `store_key` observed at `now_ms`.
    ///
    /// A record counts as expired if its expiration is no later than
    /// `now_ms + tolerance`; the match removes it, so each record yields at
    /// most one event.
    pub fn take_expired(&self, store_key: &[u8], now_ms: i64, tolerance: Duration) -> ShadowLookup<K, V> {
        let deadline = now_ms + tolerance.as_millis() as i64;
        match self.records.entry(store_key.to_vec()) {
            Entry::Occupied(entry) => match entry.get().expire_at_ms {
                Some(expires) if expires <= deadline => ShadowLookup::Expired(entry.remove()),
                _ => ShadowLookup::Superseded,
            },
            Entry::Vacant(_) => ShadowLookup::Missing,
        }
    }

    /// Removes records past their grace window. Returns the number removed.
    pub fn prune(&self, now_ms: i64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.retain_until_ms > now_ms);
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&self) {
        self.records.clear();
    }
}
