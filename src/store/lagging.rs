//! Store wrapper with injected latency, for exercising races in tests.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{ExpirationStream, KeyTtl, MemoryStore, StoreClient, WriteTtl};
use crate::error::Result;

/// Forwards to a [`MemoryStore`], holding back writes before they reach it.
pub(crate) struct LaggingStore {
    inner: MemoryStore,
    write_delay: Duration,
    /// Only writes of this value are delayed; all writes when None
    delayed_value: Option<Vec<u8>>,
    short_lived_subscriptions: bool,
}

impl LaggingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            write_delay: Duration::ZERO,
            delayed_value: None,
            short_lived_subscriptions: false,
        }
    }

    pub fn delay_writes(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn delay_writes_of(mut self, value: &[u8], delay: Duration) -> Self {
        self.delayed_value = Some(value.to_vec());
        self.write_delay = delay;
        self
    }

    /// Expiration streams end as soon as they are opened.
    pub fn short_lived_subscriptions(mut self) -> Self {
        self.short_lived_subscriptions = true;
        self
    }

    async fn lag(&self, value: &[u8]) {
        let delayed = match &self.delayed_value {
            Some(only) => only.as_slice() == value,
            None => true,
        };
        if delayed && !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
    }
}

#[async_trait]
impl StoreClient for LaggingStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.lag(value).await;
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn upsert(
        &self,
        key: &[u8],
        value: &[u8],
        on_create: WriteTtl,
        on_update: WriteTtl,
    ) -> Result<KeyTtl> {
        self.lag(value).await;
        self.inner.upsert(key, value, on_create, on_update).await
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn get_and_delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get_and_delete(key).await
    }

    async fn expire(&self, key: &[u8], ttl: Duration) -> Result<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &[u8]) -> Result<KeyTtl> {
        self.inner.ttl(key).await
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationStream> {
        let stream = self.inner.subscribe_expirations().await?;
        if self.short_lived_subscriptions {
            return Ok(futures::stream::empty().boxed());
        }
        Ok(stream)
    }
}
