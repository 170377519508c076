//! Error types for the subscription engine.

use crate::types::SubscriptionId;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Storage backend unreachable or refusing operations. Surfaces
    /// synchronously from every public operation; never retried internally.
    #[error("Adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A predicate referenced a named filter that was never registered.
    #[error("Unknown named filter: {0}")]
    UnknownFilter(String),

    /// An association spec nests deeper than the configured bound.
    #[error("Association depth {depth} exceeds bound {bound}")]
    AssociationTooDeep { depth: usize, bound: usize },

    /// A stored subscription payload is missing or unreadable.
    #[error("Corrupt subscription record: {0}")]
    Corruption(SubscriptionId),
}

impl From<rmp_serde::encode::Error> for SubscriptionError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SubscriptionError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SubscriptionError::Deserialization(e.to_string())
    }
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(e: serde_json::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

#[cfg(feature = "redis-adapter")]
impl From<redis::RedisError> for SubscriptionError {
    fn from(e: redis::RedisError) -> Self {
        SubscriptionError::AdapterUnavailable(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
