//! TTL Sweeper Task
//!
//! Background task that periodically expires untouched keys of a
//! [`MemoryStore`](crate::store::MemoryStore), publishing each one to the
//! store's expiration subscribers.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::store::WeakMemoryStore;

/// Spawns a background task that periodically purges expired keys.
///
/// The task sleeps for `interval` between runs and exits once the store has
/// been dropped.
///
/// # Arguments
/// * `store` - Weak handle to the store to sweep
/// * `interval` - Time between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be aborted early.
pub fn spawn_cleanup_task(store: WeakMemoryStore, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Starting TTL sweeper"
        );

        loop {
            tokio::time::sleep(interval).await;

            let Some(store) = store.upgrade() else {
                debug!("Store dropped, stopping TTL sweeper");
                break;
            };

            let removed = store.purge_expired().await;
            if removed.is_empty() {
                debug!("TTL sweep: no expired keys");
            } else {
                debug!(removed = removed.len(), "TTL sweep: expired keys removed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::store::{MemoryStore, StoreClient};
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sweeper_expires_untouched_keys() {
        let store = MemoryStore::new();
        let mut expirations = store.subscribe_expirations().await.unwrap();
        store
            .set_with_ttl(b"expire_soon", b"value", Some(Duration::from_millis(30)))
            .await
            .unwrap();

        let handle = store.spawn_sweeper(Duration::from_millis(10));

        let key = tokio::time::timeout(Duration::from_secs(1), expirations.next())
            .await
            .expect("sweeper should publish the expiration");
        assert_eq!(key, Some(b"expire_soon".to_vec()));
        assert!(store.is_empty().await);

        handle.abort();
    }

    #[tokio::test]
    async fn test_sweeper_preserves_valid_entries() {
        let store = MemoryStore::new();
        store
            .set_with_ttl(b"long_lived", b"value", Some(Duration::from_secs(3600)))
            .await
            .unwrap();

        let handle = store.spawn_sweeper(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(store.get(b"long_lived").await.unwrap(), Some(b"value".to_vec()));
        handle.abort();
    }

    #[tokio::test]
    async fn test_sweeper_stops_when_store_dropped() {
        let store = MemoryStore::new();
        let handle = store.spawn_sweeper(Duration::from_millis(10));
        drop(store);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should exit")
            .unwrap();
    }
}
