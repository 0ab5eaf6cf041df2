//! Configuration Module
//!
//! Handles loading the cache and server configuration from environment
//! variables or a JSON file.

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CacheError, Result};
use crate::expiry::{ExpiryPolicy, ExpiryPolicyKind};
use crate::tasks::BridgeConfig;

/// Store URL that selects the in-process store instead of Redis.
pub const MEMORY_STORE_URL: &str = "memory://";

/// Cache and server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache name, used as the key prefix in the store
    pub cache_name: String,
    /// Redis connection URL, or `memory://` for the in-process store
    pub redis_url: String,
    /// Which expiry policy to apply
    pub expiry_policy: ExpiryPolicyKind,
    /// TTL in milliseconds used by the expiry policy
    pub expiry_ttl_ms: u64,
    /// Keep encoded bytes (true) or value clones (false) for expiration events
    pub store_by_value: bool,
    /// HTTP server port
    pub server_port: u16,
    /// How long shadow records outlive their TTL, in milliseconds
    pub shadow_grace_ms: u64,
    /// Upper bound on close, in milliseconds
    pub close_grace_ms: u64,
    /// Failed subscription attempts tolerated before expiration events are disabled
    pub resubscribe_attempts: u32,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_NAME` - Cache name (default: "default")
    /// - `REDIS_URL` - Store URL (default: "redis://127.0.0.1:6379")
    /// - `EXPIRY_POLICY` - created, accessed, modified, touched or eternal (default: eternal)
    /// - `EXPIRY_TTL_MS` - Policy TTL in milliseconds (default: 60000)
    /// - `STORE_BY_VALUE` - true or false (default: true)
    /// - `SERVER_PORT` - HTTP server port (default: 3000)
    /// - `SHADOW_GRACE_MS` - Shadow record grace window (default: 30000)
    /// - `CLOSE_GRACE_MS` - Close grace period (default: 2000)
    /// - `RESUBSCRIBE_ATTEMPTS` - Subscription retries (default: 5)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_name: env::var("CACHE_NAME").unwrap_or(defaults.cache_name),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            expiry_policy: env_or("EXPIRY_POLICY", defaults.expiry_policy),
            expiry_ttl_ms: env_or("EXPIRY_TTL_MS", defaults.expiry_ttl_ms),
            store_by_value: env_or("STORE_BY_VALUE", defaults.store_by_value),
            server_port: env_or("SERVER_PORT", defaults.server_port),
            shadow_grace_ms: env_or("SHADOW_GRACE_MS", defaults.shadow_grace_ms),
            close_grace_ms: env_or("CLOSE_GRACE_MS", defaults.close_grace_ms),
            resubscribe_attempts: env_or("RESUBSCRIBE_ATTEMPTS", defaults.resubscribe_attempts),
        }
    }

    /// Loads configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CacheError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            CacheError::InvalidConfig(format!("invalid config {}: {}", path.display(), e))
        })
    }

    pub fn uses_memory_store(&self) -> bool {
        self.redis_url.starts_with(MEMORY_STORE_URL)
    }

    pub fn expiry_policy(&self) -> Arc<dyn ExpiryPolicy> {
        self.expiry_policy
            .build(Duration::from_millis(self.expiry_ttl_ms))
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            shadow_grace: Duration::from_millis(self.shadow_grace_ms),
            close_grace: Duration::from_millis(self.close_grace_ms),
            max_resubscribe_attempts: self.resubscribe_attempts,
            ..BridgeConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_name: "default".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            expiry_policy: ExpiryPolicyKind::Eternal,
            expiry_ttl_ms: 60_000,
            store_by_value: true,
            server_port: 3000,
            shadow_grace_ms: 30_000,
            close_grace_ms: 2_000,
            resubscribe_attempts: 5,
        }
    }
}
