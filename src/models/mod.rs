//! Request and Response models for the cache server API
//!
//! This module defines the DTOs (Data Transfer Objects) used for
//! serializing/deserializing HTTP request and response bodies.

pub mod requests;
pub mod responses;

// Re-export commonly used types
pub use requests::{BatchGetRequest, PutRequest, MAX_BATCH_KEYS, MAX_VALUE_SIZE};
pub use responses::{
    BatchGetResponse, DeleteResponse, ErrorResponse, GetResponse, HealthResponse, PutResponse,
    StatsResponse,
};
