//! Error types for the cache facade
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::listener::ListenerId;
use crate::models::ErrorResponse;

// == Cache Error Enum ==
/// Unified error type for cache operations.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The remote store could not be reached
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The remote store rejected a command
    #[error("Store command failed: {0}")]
    StoreCommand(String),

    /// A key or value could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// A listener callback returned an error or panicked
    #[error("Listener {listener} failed: {message}")]
    ListenerCallback {
        listener: ListenerId,
        message: String,
    },

    /// The expiration subscription could not be re-established
    #[error("Expiration subscription lost: {0}")]
    SubscriptionLost(String),

    /// Configuration could not be loaded or is inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The cache has been closed
    #[error("Cache is closed")]
    Closed,

    /// Key not found (HTTP surface only)
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Malformed HTTP request (HTTP surface only)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
            CacheError::StoreUnavailable(e.to_string())
        } else {
            CacheError::StoreCommand(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Codec(e.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::Codec(_) | CacheError::InvalidConfig(_) | CacheError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            CacheError::StoreUnavailable(_) | CacheError::Closed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CacheError::StoreCommand(_)
            | CacheError::ListenerCallback { .. }
            | CacheError::SubscriptionLost(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse::new(self.to_string()));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
