//! Per-key write guards.
//!
//! Serializes the store write and the shadow update of a single key, so the
//! shadow table always holds the value of the write the store applied last.
//! Unrelated keys never wait on each other.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    locks: DashMap<Vec<u8>, Arc<Mutex<()>>>,
}

/// Held while a key is being written. Releasing the last guard of a key
/// drops its lock entry.
pub(crate) struct KeyGuard<'a> {
    owner: &'a KeyLocks,
    store_key: Vec<u8>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, store_key: &[u8]) -> KeyGuard<'_> {
        let lock = Arc::clone(&self.locks.entry(store_key.to_vec()).or_default());
        let guard = lock.lock_owned().await;
        KeyGuard {
            owner: self,
            store_key: store_key.to_vec(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a live lock entry.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map still holds the lock once no guard or waiter clones it
        self.owner
            .locks
            .remove_if(&self.store_key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_waits() {
        let locks = Arc::new(KeyLocks::new());
        let guard = locks.lock(b"k").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.lock(b"k").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_wait() {
        let locks = KeyLocks::new();
        let _a = locks.lock(b"a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(b"b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
