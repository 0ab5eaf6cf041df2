//! Expiry Policy Module
//!
//! Maps cache operations to the time-to-live written to the store.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// == Operation ==
/// The cache operation that touched an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// The key did not exist before the write
    Create,
    /// The entry was read
    Access,
    /// An existing key was overwritten
    Update,
}

// == Ttl ==
/// Lifetime of an entry in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// No expiration
    Eternal,
    /// Expires after the given duration; zero means immediately
    After(Duration),
}

impl Ttl {
    /// Returns true if this TTL expires the entry on write.
    pub fn is_immediate(&self) -> bool {
        matches!(self, Ttl::After(d) if d.is_zero())
    }

    /// Converts to the optional duration accepted by the store.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Ttl::Eternal => None,
            Ttl::After(d) => Some(*d),
        }
    }
}

// == Expiry Policy ==
/// Computes the TTL an operation assigns to an entry.
///
/// `previous` is the TTL in effect before the operation when the caller
/// knows it. Returning `None` leaves the entry's TTL unchanged; for a
/// `Create` that means the entry is eternal.
///
/// Must be deterministic and free of side effects: it runs inline on every
/// cache operation.
pub trait ExpiryPolicy: Send + Sync + fmt::Debug {
    fn ttl_for(&self, op: Operation, previous: Option<Ttl>) -> Option<Ttl>;
}

/// Fixed TTL on create; access and update keep the current TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedExpiryPolicy(pub Duration);

impl ExpiryPolicy for CreatedExpiryPolicy {
    fn ttl_for(&self, op: Operation, _previous: Option<Ttl>) -> Option<Ttl> {
        match op {
            Operation::Create => Some(Ttl::After(self.0)),
            Operation::Access | Operation::Update => None,
        }
    }
}

/// TTL set on create and reset on every access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessedExpiryPolicy(pub Duration);

impl ExpiryPolicy for AccessedExpiryPolicy {
    fn ttl_for(&self, op: Operation, _previous: Option<Ttl>) -> Option<Ttl> {
        match op {
            Operation::Create | Operation::Access => Some(Ttl::After(self.0)),
            Operation::Update => None,
        }
    }
}

/// TTL set on create and reset on every update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifiedExpiryPolicy(pub Duration);

impl ExpiryPolicy for ModifiedExpiryPolicy {
    fn ttl_for(&self, op: Operation, _previous: Option<Ttl>) -> Option<Ttl> {
        match op {
            Operation::Create | Operation::Update => Some(Ttl::After(self.0)),
            Operation::Access => None,
        }
    }
}

/// TTL reset by any operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchedExpiryPolicy(pub Duration);

impl ExpiryPolicy for TouchedExpiryPolicy {
    fn ttl_for(&self, _op: Operation, _previous: Option<Ttl>) -> Option<Ttl> {
        Some(Ttl::After(self.0))
    }
}

/// Entries never expire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EternalExpiryPolicy;

impl ExpiryPolicy for EternalExpiryPolicy {
    fn ttl_for(&self, op: Operation, _previous: Option<Ttl>) -> Option<Ttl> {
        match op {
            Operation::Create => Some(Ttl::Eternal),
            Operation::Access | Operation::Update => None,
        }
    }
}

// == Policy Selection ==
/// Expiry policy named in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryPolicyKind {
    Created,
    Accessed,
    Modified,
    Touched,
    #[default]
    Eternal,
}

impl ExpiryPolicyKind {
    /// Builds the policy with the given TTL (ignored for `Eternal`).
    pub fn build(self, ttl: Duration) -> Arc<dyn ExpiryPolicy> {
        match self {
            ExpiryPolicyKind::Created => Arc::new(CreatedExpiryPolicy(ttl)),
            ExpiryPolicyKind::Accessed => Arc::new(AccessedExpiryPolicy(ttl)),
            ExpiryPolicyKind::Modified => Arc::new(ModifiedExpiryPolicy(ttl)),
            ExpiryPolicyKind::Touched => Arc::new(TouchedExpiryPolicy(ttl)),
            ExpiryPolicyKind::Eternal => Arc::new(EternalExpiryPolicy),
        }
    }
}

impl std::str::FromStr for ExpiryPolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(ExpiryPolicyKind::Created),
            "accessed" => Ok(ExpiryPolicyKind::Accessed),
            "modified" => Ok(ExpiryPolicyKind::Modified),
            "touched" => Ok(ExpiryPolicyKind::Touched),
            "eternal" => Ok(ExpiryPolicyKind::Eternal),
            other => Err(format!("unknown expiry policy '{}'", other)),
        }
    }
}
