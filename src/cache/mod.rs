//! Cache Module
//!
//! Provides the typed cache facade over a remote store, with expiry
//! policies and entry events.

mod builder;
mod entry;
pub(crate) mod locks;
pub(crate) mod shadow;
pub(crate) mod stats;
mod store;


use std::fmt::Debug;
use std::hash::Hash;

// Re-export public types
pub use builder::CacheBuilder;
pub use entry::{current_timestamp_ms, CacheEntry};
pub use stats::CacheStats;
pub use store::Cache;

// == Bounds ==
/// Requirements on cache key types.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Requirements on cache value types.
pub trait CacheValue: Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + 'static {}
