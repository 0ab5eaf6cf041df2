//! Background Tasks Module
//!
//! Contains the long-lived tasks that run beside the cache.
//!
//! # Tasks
//! - Expiration bridge: delivers `Expired` events for keys the store expired
//! - TTL sweeper: expires untouched keys of the in-process store

mod bridge;
mod cleanup;

pub use bridge::{
    BridgeConfig, BridgeHandle, BridgeMonitor, BridgeState, BridgeStatus, ErrorHandler,
    ExpirationBridge,
};
pub(crate) use bridge::report_failures;
pub use cleanup::spawn_cleanup_task;
