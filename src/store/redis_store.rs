//! Redis-backed store client.
//!
//! Commands go through a `ConnectionManager`; expirations arrive on a
//! dedicated pub/sub connection subscribed to the `expired` keyevent channel.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info, warn};

use super::{ExpirationStream, KeyTtl, StoreClient, WriteTtl};
use crate::error::Result;

/// Reads the key's PTTL and writes it under the matching TTL rule.
///
/// ARGV: value, rule when absent, rule when present. A rule is `keep`,
/// `persist`, `0` (delete) or a TTL in milliseconds. Returns the PTTL read.
const UPSERT_SCRIPT: &str = r#"
local previous = redis.call('PTTL', KEYS[1])
local rule = ARGV[2]
if previous ~= -2 then
  rule = ARGV[3]
end
if rule == 'keep' then
  redis.call('SET', KEYS[1], ARGV[1], 'KEEPTTL')
elseif rule == 'persist' then
  redis.call('SET', KEYS[1], ARGV[1])
elseif rule == '0' then
  redis.call('DEL', KEYS[1])
else
  redis.call('SET', KEYS[1], ARGV[1], 'PX', rule)
end
return previous
"#;

/// Store client for a single Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    database: i64,
    upsert: Script,
}

fn rule_arg(rule: WriteTtl) -> String {
    match rule {
        WriteTtl::Keep => "keep".to_string(),
        WriteTtl::Persist => "persist".to_string(),
        WriteTtl::After(ttl) if ttl.is_zero() => "0".to_string(),
        // PX rejects zero
        WriteTtl::After(ttl) => ttl.as_millis().max(1).to_string(),
    }
}

impl RedisStore {
    /// Connects to the server at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        Self::from_client(client).await
    }

    /// Wraps an already configured client.
    pub async fn from_client(client: Client) -> Result<Self> {
        let conn = ConnectionManager::new(client.clone()).await?;
        let database = client.get_connection_info().redis.db;
        info!(database, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            database,
            upsert: Script::new(UPSERT_SCRIPT),
        })
    }

    fn expired_channel(&self) -> String {
        format!("__keyevent@{}__:expired", self.database)
    }

    /// Turns on expired keyevent notifications.
    ///
    /// Managed deployments often forbid CONFIG; notifications must then be
    /// enabled server-side, so a failure here is only logged.
    async fn enable_expired_events(&self) {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await;

        if let Err(e) = result {
            warn!(error = %e, "Could not enable keyspace notifications, relying on server config");
        }
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            // PX rejects zero
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }

        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn upsert(
        &self,
        key: &[u8],
        value: &[u8],
        on_create: WriteTtl,
        on_update: WriteTtl,
    ) -> Result<KeyTtl> {
        let mut conn = self.conn.clone();
        let previous: i64 = self
            .upsert
            .key(key)
            .arg(value)
            .arg(rule_arg(on_create))
            .arg(rule_arg(on_update))
            .invoke_async(&mut conn)
            .await?;
        Ok(KeyTtl::from_pttl(previous))
    }

    async fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn get_and_delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn expire(&self, key: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &[u8]) -> Result<KeyTtl> {
        let mut conn = self.conn.clone();
        let millis: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(KeyTtl::from_pttl(millis))
    }

    async fn subscribe_expirations(&self) -> Result<ExpirationStream> {
        self.enable_expired_events().await;

        let channel = self.expired_channel();
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        debug!(channel = %channel, "Subscribed to expiration events");

        let stream = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    //! Tests marked `#[ignore]` need a Redis server (6.2 or newer) at
    //! `REDIS_URL`, or `redis://127.0.0.1:6379` when unset. Run them with
    //! `cargo test -- --ignored`.

    use super::*;
    use crate::cache::{current_timestamp_ms, CacheBuilder};
    use crate::expiry::CreatedExpiryPolicy;
    use crate::listener::{CacheEntryEvent, CacheEntryListener, EventType, ListenerConfig};
    use crate::tasks::BridgeState;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    type Event = CacheEntryEvent<String, String>;

    struct Recorder(mpsc::UnboundedSender<Event>);

    #[async_trait]
    impl CacheEntryListener<String, String> for Recorder {
        async fn on_event(&self, event: &Event) -> anyhow::Result<()> {
            let _ = self.0.send(event.clone());
            Ok(())
        }
    }

    async fn live_store() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisStore::connect(&url).await.expect("connect to redis")
    }

    fn unique(name: &str) -> String {
        format!("{}_{}", name, current_timestamp_ms())
    }

    #[test]
    fn test_rule_args() {
        assert_eq!(rule_arg(WriteTtl::Keep), "keep");
        assert_eq!(rule_arg(WriteTtl::Persist), "persist");
        assert_eq!(rule_arg(WriteTtl::After(Duration::ZERO)), "0");
        assert_eq!(rule_arg(WriteTtl::After(Duration::from_micros(300))), "1");
        assert_eq!(rule_arg(WriteTtl::After(Duration::from_secs(2))), "2000");
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_upsert_against_redis() {
        let store = live_store().await;
        let key = unique("upsert").into_bytes();
        let create = WriteTtl::After(Duration::from_secs(60));

        let previous = store.upsert(&key, b"v1", create, WriteTtl::Keep).await.unwrap();
        assert_eq!(previous, KeyTtl::Missing);

        let previous = store.upsert(&key, b"v2", create, WriteTtl::Keep).await.unwrap();
        assert!(matches!(previous, KeyTtl::Expires(_)));
        assert!(matches!(store.ttl(&key).await.unwrap(), KeyTtl::Expires(left) if left > Duration::from_secs(50)));
        assert_eq!(store.get(&key).await.unwrap(), Some(b"v2".to_vec()));

        store.upsert(&key, b"v3", create, WriteTtl::Persist).await.unwrap();
        assert_eq!(store.ttl(&key).await.unwrap(), KeyTtl::Persistent);

        let previous = store
            .upsert(&key, b"v4", create, WriteTtl::After(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(previous, KeyTtl::Persistent);
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_keyevent_expiration_reaches_listener() {
        let store = live_store().await;
        let name = unique("expiring");
        let (tx, mut events) = mpsc::unbounded_channel();
        let cache = CacheBuilder::strings(name.clone(), Arc::new(store.clone()))
            .expiry_policy(Arc::new(CreatedExpiryPolicy(Duration::from_millis(200))))
            .listener(ListenerConfig::expired(Arc::new(Recorder(tx))))
            .build()
            .unwrap();
        assert_eq!(
            cache.await_expiration_bridge(Duration::from_secs(5)).await,
            BridgeState::Active
        );

        cache.put("123".into(), "90".into()).await.unwrap();
        let store_key = format!("{}:123", name);
        assert_eq!(
            store.get(store_key.as_bytes()).await.unwrap(),
            Some(b"90".to_vec())
        );

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("expiration should arrive")
            .unwrap();
        assert_eq!(event.event_type, EventType::Expired);
        assert_eq!(event.key, "123");
        assert_eq!(event.value.as_deref(), Some("90"));
        assert_eq!(store.get(store_key.as_bytes()).await.unwrap(), None);

        cache.close().await;
    }
}
