//! API Module
//!
//! HTTP handlers and routing for the cache server REST API.
//!
//! # Endpoints
//! - `PUT /entries/:key` - Store a value
//! - `GET /entries/:key` - Retrieve a value
//! - `DELETE /entries/:key` - Delete a key
//! - `POST /entries/:key/take` - Retrieve and delete a key
//! - `POST /entries/batch` - Retrieve several keys
//! - `GET /stats` - Get cache statistics
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
