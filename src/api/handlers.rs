//! API Handlers
//!
//! HTTP request handlers for each cache server endpoint.

use std::collections::HashSet;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::cache::Cache;
use crate::error::{CacheError, Result};
use crate::models::{
    BatchGetRequest, BatchGetResponse, DeleteResponse, GetResponse, HealthResponse, PutRequest,
    PutResponse, StatsResponse,
};

/// Application state shared across all handlers.
///
/// The cache is internally synchronized, so handlers share it without a lock.
#[derive(Clone)]
pub struct AppState {
    pub cache: Cache<String, String>,
}

impl AppState {
    /// Creates a new AppState around the given cache.
    pub fn new(cache: Cache<String, String>) -> Self {
        Self { cache }
    }
}

/// Handler for PUT /entries/:key
///
/// Stores a value under the key, with the TTL chosen by the expiry policy.
pub async fn put_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<PutRequest>,
) -> Result<Json<PutResponse>> {
    // Validate request
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    state.cache.put(key.clone(), req.value).await?;

    Ok(Json(PutResponse::new(key)))
}

/// Handler for GET /entries/:key
///
/// Retrieves a value from the cache by key.
pub async fn get_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    match state.cache.get(&key).await? {
        Some(value) => Ok(Json(GetResponse::new(key, value))),
        None => Err(CacheError::NotFound(key)),
    }
}

/// Handler for DELETE /entries/:key
///
/// Deletes a key from the cache.
pub async fn delete_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DeleteResponse>> {
    if state.cache.remove(&key).await? {
        Ok(Json(DeleteResponse::new(key)))
    } else {
        Err(CacheError::NotFound(key))
    }
}

/// Handler for POST /entries/:key/take
///
/// Atomically reads and deletes a key.
pub async fn take_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<GetResponse>> {
    match state.cache.get_and_remove(&key).await? {
        Some(value) => Ok(Json(GetResponse::new(key, value))),
        None => Err(CacheError::NotFound(key)),
    }
}

/// Handler for POST /entries/batch
///
/// Reads several keys in one store round trip.
pub async fn batch_get_handler(
    State(state): State<AppState>,
    Json(req): Json<BatchGetRequest>,
) -> Result<Json<BatchGetResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }

    let keys: HashSet<String> = req.keys.iter().cloned().collect();
    let found = state.cache.get_all(&keys).await?;

    Ok(Json(BatchGetResponse::new(req.keys, found)))
}

/// Handler for GET /stats
///
/// Returns current cache statistics.
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.cache.stats();
    Json(StatsResponse::new(state.cache.name(), &stats))
}

/// Handler for GET /health
///
/// Reports the expiration bridge; 503 once expiration events are lost.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let health = HealthResponse::from_status(state.cache.expiration_status());
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}
