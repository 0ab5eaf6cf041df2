//! Remote Cache server
//!
//! Serves a string cache over HTTP, backed by Redis or the in-process store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remote_cache::api::{create_router, AppState};
use remote_cache::store::{MemoryStore, RedisStore, StoreClient};
use remote_cache::{
    CacheBuilder, CacheEntryEvent, CacheEntryListener, CacheError, Config, ListenerConfig,
};

/// Sweep interval of the in-process store
const MEMORY_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Logs every entry the store expired.
struct ExpirationLogger;

#[async_trait]
impl CacheEntryListener<String, String> for ExpirationLogger {
    async fn on_event(&self, event: &CacheEntryEvent<String, String>) -> anyhow::Result<()> {
        info!(
            cache = %event.cache_name,
            key = %event.key,
            value = ?event.value,
            "Entry expired"
        );
        Ok(())
    }
}

/// Main entry point for the cache server.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Connect to the store
/// 4. Build the cache and start its expiration bridge
/// 5. Serve the HTTP API on the configured port
/// 6. On SIGINT/SIGTERM, stop serving and close the cache
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber with env filter
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "remote_cache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Remote Cache Server");

    let config = Config::from_env();
    info!(
        cache = %config.cache_name,
        policy = ?config.expiry_policy,
        ttl_ms = config.expiry_ttl_ms,
        port = config.server_port,
        "Configuration loaded"
    );

    let (store, sweeper) = if config.uses_memory_store() {
        let store = MemoryStore::new();
        let sweeper = store.spawn_sweeper(MEMORY_SWEEP_INTERVAL);
        info!("Using in-process store");
        let store: Arc<dyn StoreClient> = Arc::new(store);
        (store, Some(sweeper))
    } else {
        let store = RedisStore::connect(&config.redis_url)
            .await
            .with_context(|| format!("connecting to {}", config.redis_url))?;
        info!(url = %config.redis_url, "Connected to Redis");
        let store: Arc<dyn StoreClient> = Arc::new(store);
        (store, None)
    };

    let cache = CacheBuilder::strings(config.cache_name.clone(), store)
        .configure(&config)
        .listener(ListenerConfig::expired(Arc::new(ExpirationLogger)))
        .error_handler(|e: &CacheError| error!(error = %e, "Cache error"))
        .build()?;

    let bridge = cache.await_expiration_bridge(Duration::from_secs(5)).await;
    info!(state = %bridge, "Expiration bridge started");

    let app = create_router(AppState::new(cache.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    cache.close().await;
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
