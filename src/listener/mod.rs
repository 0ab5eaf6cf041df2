//! Listener Module
//!
//! Cache entry events, listener registrations and fan-out dispatch.

mod event;
mod registry;

pub use event::{CacheEntryEvent, CacheEntryListener, EventFilter, EventType, ListenerConfig};
pub use registry::{DispatchReport, ListenerId, ListenerRegistry};
