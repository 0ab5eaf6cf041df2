//! Remote Cache - a typed cache facade over a remote key-value store
//!
//! Provides expiry policies, entry event listeners and delivery of
//! `Expired` events for keys the store drops on its own.

pub mod api;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod expiry;
pub mod listener;
pub mod models;
pub mod store;
pub mod tasks;

pub use api::AppState;
pub use cache::{Cache, CacheBuilder, CacheStats};
pub use config::Config;
pub use error::{CacheError, Result};
pub use listener::{CacheEntryEvent, CacheEntryListener, EventType, ListenerConfig, ListenerId};
pub use store::{MemoryStore, RedisStore, StoreClient};
pub use tasks::{BridgeState, BridgeStatus};
