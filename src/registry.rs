//! Subscriber lifecycle on top of the adapter.
//!
//! Per subscriber, the states are `Active -> Expiring (expire) -> [Active
//! (persist) | Removed (TTL elapse)]`. Expiration is subscriber-scoped: a
//! subscription shared with a non-expiring owner stays fully active, and
//! only at zero active owners does it stop firing.

use crate::adapter::SubscriptionAdapter;
use crate::error::Result;
use crate::types::{SubscriberId, Subscription, SubscriptionId, Timestamp};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Translates registration and lifecycle requests into adapter writes.
pub struct SubscriberRegistry {
    adapter: Arc<dyn SubscriptionAdapter>,
}

impl SubscriberRegistry {
    pub fn new(adapter: Arc<dyn SubscriptionAdapter>) -> Self {
        Self { adapter }
    }

    /// Attach `subscriber` as an owner of each subscription, storing any it
    /// is the first owner of. Returns the subscription ids in input order.
    pub fn register_subscriptions(
        &self,
        subscriptions: &[Subscription],
        subscriber: &SubscriberId,
    ) -> Result<Vec<SubscriptionId>> {
        self.adapter.register(subscriber, subscriptions)?;
        let ids: Vec<SubscriptionId> = subscriptions.iter().map(|s| s.id.clone()).collect();
        debug!(subscriber = %subscriber, count = ids.len(), "registered subscriptions");
        Ok(ids)
    }

    /// Mark `subscriber` for removal once `ttl` elapses. Its subscriptions
    /// are suspended, not deleted; `persist` restores them.
    pub fn expire(&self, subscriber: &SubscriberId, ttl: Duration) -> Result<()> {
        let deadline = Timestamp::now().plus(ttl);
        self.adapter.expire(subscriber, deadline)?;
        debug!(subscriber = %subscriber, ?deadline, "subscriber expiring");
        Ok(())
    }

    /// Cancel a pending expiration. Unknown subscriber: no-op.
    pub fn persist(&self, subscriber: &SubscriberId) -> Result<()> {
        self.adapter.persist(subscriber)
    }

    /// Remove the subscriber and every ownership it holds. Idempotent.
    pub fn unsubscribe(&self, subscriber: &SubscriberId) -> Result<()> {
        self.adapter.unsubscribe(subscriber)?;
        debug!(subscriber = %subscriber, "unsubscribed");
        Ok(())
    }

    /// Drop a single subscription from a subscriber.
    pub fn remove_subscription(
        &self,
        subscriber: &SubscriberId,
        id: &SubscriptionId,
    ) -> Result<()> {
        self.adapter.remove_subscription(subscriber, id)
    }

    /// Subscription ids currently held by `subscriber`.
    pub fn subscription_ids(&self, subscriber: &SubscriberId) -> Result<Vec<SubscriptionId>> {
        self.adapter.subscription_ids_for(subscriber)
    }

    /// Remove subscribers whose expiration deadline has passed.
    pub fn sweep(&self, now: Timestamp) -> Result<usize> {
        let removed = self.adapter.sweep(now)?;
        if removed > 0 {
            debug!(removed, "swept expired subscribers");
        }
        Ok(removed)
    }
}
