//! API Routes
//!
//! Configures the Axum router with all cache server endpoints.

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    batch_get_handler, delete_handler, get_handler, health_handler, put_handler, stats_handler,
    take_handler, AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `PUT /entries/:key` - Store a value
/// - `GET /entries/:key` - Retrieve a value
/// - `DELETE /entries/:key` - Delete a key
/// - `POST /entries/:key/take` - Retrieve and delete a key
/// - `POST /entries/batch` - Retrieve several keys
/// - `GET /stats` - Get cache statistics
/// - `GET /health` - Health check, including expiration events
///
/// # Middleware
/// - CORS: Allows any origin (configurable for production)
/// - Tracing: Logs all requests for debugging
pub fn create_router(state: AppState) -> Router {
    // Configure CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/entries/batch", post(batch_get_handler))
        .route(
            "/entries/:key",
            put(put_handler).get(get_handler).delete(delete_handler),
        )
        .route("/entries/:key/take", post(take_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
