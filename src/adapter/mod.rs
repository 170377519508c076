//! Pluggable storage for subscriptions and subscribers.
//!
//! The adapter exclusively owns durable state; the engine holds none and is
//! restartable by re-reading the adapter. Two variants ship:
//! - [`MemoryAdapter`]: single-process, for tests and single-node
//!   deployments.
//! - `RedisAdapter` (feature `redis-adapter`): multi-process, so
//!   subscriptions registered on one worker are visible to mutations
//!   reported from another.
//!
//! Every write touching one subscriber's state is atomic per subscriber id,
//! using the adapter's own primitives (a process-wide lock in memory,
//! MULTI/EXEC pipelines on Redis).

mod memory;
#[cfg(feature = "redis-adapter")]
mod redis;

pub use memory::MemoryAdapter;
#[cfg(feature = "redis-adapter")]
pub use redis::{RedisAdapter, RedisAdapterConfig};

use crate::error::Result;
use crate::types::{StoredSubscription, SubscriberId, Subscription, SubscriptionId, Timestamp};

/// Storage operations the engine requires.
///
/// Reads are safe under concurrent mutation processing without external
/// locking. Unknown-subscriber operations are no-ops, never errors.
pub trait SubscriptionAdapter: Send + Sync {
    /// Store `subscriptions` under `subscriber`, creating the subscriber on
    /// first use. A subscription already stored (same content id) gains the
    /// subscriber as an additional owner; the stored payload is kept as-is
    /// since subscriptions are immutable.
    fn register(&self, subscriber: &SubscriberId, subscriptions: &[Subscription]) -> Result<()>;

    /// Remove the subscriber and its ownerships. Subscriptions it owned
    /// exclusively are deleted; shared ones survive for their other owners.
    fn unsubscribe(&self, subscriber: &SubscriberId) -> Result<()>;

    /// Point removal: drop one subscription from one subscriber.
    fn remove_subscription(&self, subscriber: &SubscriberId, id: &SubscriptionId) -> Result<()>;

    /// Mark the subscriber for deferred removal at `expiring_at`.
    fn expire(&self, subscriber: &SubscriberId, expiring_at: Timestamp) -> Result<()>;

    /// Clear a pending expiration, restoring the subscriber to active.
    fn persist(&self, subscriber: &SubscriberId) -> Result<()>;

    /// All subscriptions whose coverage touches `source` (top-level source
    /// or any source in the association tree), with their owners.
    fn subscriptions_for_source(&self, source: &str) -> Result<Vec<StoredSubscription>>;

    /// Subscription ids currently held by `subscriber`.
    fn subscription_ids_for(&self, subscriber: &SubscriberId) -> Result<Vec<SubscriptionId>>;

    /// Number of stored subscriptions.
    fn subscription_count(&self) -> Result<usize>;

    /// Remove every subscriber whose deadline is at or before `now`,
    /// dropping ownerships as `unsubscribe` would. Returns how many
    /// subscribers were removed.
    fn sweep(&self, now: Timestamp) -> Result<usize>;
}
