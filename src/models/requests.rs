//! Request DTOs for the cache server API
//!
//! Defines the structure of incoming HTTP request bodies.

use serde::Deserialize;

/// Maximum accepted value size in bytes
pub const MAX_VALUE_SIZE: usize = 1024 * 1024; // 1 MB

/// Maximum number of keys in one batch read
pub const MAX_BATCH_KEYS: usize = 1000;

/// Request body for the PUT operation (PUT /entries/:key)
///
/// # Fields
/// - `value`: The value to store
#[derive(Debug, Clone, Deserialize)]
pub struct PutRequest {
    /// The value to store
    pub value: String,
}

impl PutRequest {
    /// Validates the request data
    ///
    /// Returns an error message if validation fails, None if valid.
    pub fn validate(&self) -> Option<String> {
        if self.value.len() > MAX_VALUE_SIZE {
            return Some(format!(
                "Value exceeds maximum size of {} bytes",
                MAX_VALUE_SIZE
            ));
        }
        None
    }
}

/// Request body for the batch read (POST /entries/batch)
#[derive(Debug, Clone, Deserialize)]
pub struct BatchGetRequest {
    /// Keys to read; duplicates are ignored
    pub keys: Vec<String>,
}

impl BatchGetRequest {
    pub fn validate(&self) -> Option<String> {
        if self.keys.len() > MAX_BATCH_KEYS {
            return Some(format!(
                "Batch exceeds maximum of {} keys",
                MAX_BATCH_KEYS
            ));
        }
        if self.keys.iter().any(|key| key.is_empty()) {
            return Some("Key cannot be empty".to_string());
        }
        None
    }
}
