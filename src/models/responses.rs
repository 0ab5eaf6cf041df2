//! Response DTOs for the cache server API
//!
//! Defines the structure of outgoing HTTP response bodies.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::cache::CacheStats;
use crate::tasks::BridgeStatus;

/// Response body for reads (GET /entries/:key, POST /entries/:key/take)
#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    /// The requested key
    pub key: String,
    /// The stored value
    pub value: String,
}

impl GetResponse {
    /// Creates a new GetResponse
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Response body for the PUT operation (PUT /entries/:key)
#[derive(Debug, Clone, Serialize)]
pub struct PutResponse {
    /// Success message
    pub message: String,
    /// The key that was written
    pub key: String,
}

impl PutResponse {
    /// Creates a new PutResponse
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' set successfully", key),
            key,
        }
    }
}

/// Response body for the DELETE operation (DELETE /entries/:key)
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    /// Success message
    pub message: String,
    /// The key that was deleted
    pub key: String,
}

impl DeleteResponse {
    /// Creates a new DeleteResponse
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' deleted successfully", key),
            key,
        }
    }
}

/// Response body for the batch read (POST /entries/batch)
#[derive(Debug, Clone, Serialize)]
pub struct BatchGetResponse {
    /// Values of the keys that were present, ordered by key
    pub entries: BTreeMap<String, String>,
    /// Requested keys that were absent, sorted
    pub missing: Vec<String>,
}

impl BatchGetResponse {
    pub fn new(requested: impl IntoIterator<Item = String>, found: HashMap<String, String>) -> Self {
        let mut missing: Vec<String> = requested
            .into_iter()
            .filter(|key| !found.contains_key(key))
            .collect();
        missing.sort();
        missing.dedup();
        Self {
            entries: found.into_iter().collect(),
            missing,
        }
    }
}

/// Response body for the stats endpoint (GET /stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    /// Cache name
    pub cache: String,
    /// Number of reads that found a value
    pub hits: u64,
    /// Number of reads that found nothing
    pub misses: u64,
    /// Number of successful writes
    pub puts: u64,
    /// Number of explicit removals
    pub removals: u64,
    /// Number of observed expirations
    pub expirations: u64,
    /// Hit rate (hits / (hits + misses))
    pub hit_rate: f64,
}

impl StatsResponse {
    /// Creates a new StatsResponse from a stats snapshot
    pub fn new(cache: impl Into<String>, stats: &CacheStats) -> Self {
        Self {
            cache: cache.into(),
            hits: stats.hits,
            misses: stats.misses,
            puts: stats.puts,
            removals: stats.removals,
            expirations: stats.expirations,
            hit_rate: stats.hit_rate(),
        }
    }
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// "healthy", or "degraded" once expiration events are lost
    pub status: String,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
    /// State of the expiration bridge
    pub expiration: BridgeStatus,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn from_status(expiration: BridgeStatus) -> Self {
        let status = if expiration.degraded { "degraded" } else { "healthy" };
        Self {
            status: status.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            expiration,
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.expiration.degraded
    }
}

/// Error response body for all error conditions
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error message describing what went wrong
    pub error: String,
}

impl ErrorResponse {
    /// Creates a new ErrorResponse
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}
