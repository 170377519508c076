//! In-process adapter backed by hash maps.

use crate::error::Result;
use crate::types::{
    Owner, StoredSubscription, SubscriberId, Subscription, SubscriptionId, Timestamp,
};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};

use super::SubscriptionAdapter;

#[derive(Default)]
struct SubscriberEntry {
    subscription_ids: BTreeSet<SubscriptionId>,
    expiring_at: Option<Timestamp>,
}

#[derive(Default)]
struct MemoryState {
    /// Stored payloads by content id.
    subscriptions: HashMap<SubscriptionId, Subscription>,

    /// Owner sets per subscription; physical deletion at zero owners.
    owners: HashMap<SubscriptionId, BTreeSet<SubscriberId>>,

    /// Per-subscriber state.
    subscribers: HashMap<SubscriberId, SubscriberEntry>,

    /// Source name -> subscriptions whose coverage touches it.
    by_source: HashMap<String, BTreeSet<SubscriptionId>>,
}

impl MemoryState {
    /// Drop one ownership; delete the subscription at zero owners.
    fn drop_owner(&mut self, id: &SubscriptionId, subscriber: &SubscriberId) {
        let emptied = match self.owners.get_mut(id) {
            Some(owners) => {
                owners.remove(subscriber);
                owners.is_empty()
            }
            None => return,
        };

        if emptied {
            self.owners.remove(id);
            if let Some(subscription) = self.subscriptions.remove(id) {
                for source in subscription.touched_sources() {
                    if let Some(ids) = self.by_source.get_mut(source) {
                        ids.remove(id);
                        if ids.is_empty() {
                            self.by_source.remove(source);
                        }
                    }
                }
            }
        }
    }

    fn remove_subscriber(&mut self, subscriber: &SubscriberId) {
        if let Some(entry) = self.subscribers.remove(subscriber) {
            for id in &entry.subscription_ids {
                self.drop_owner(id, subscriber);
            }
        }
    }
}

/// Single-process adapter. All state behind one lock, which also provides
/// the per-subscriber write atomicity the engine relies on.
pub struct MemoryAdapter {
    state: RwLock<MemoryState>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionAdapter for MemoryAdapter {
    fn register(&self, subscriber: &SubscriberId, subscriptions: &[Subscription]) -> Result<()> {
        let mut state = self.state.write();

        for subscription in subscriptions {
            let id = subscription.id.clone();

            // First registration wins; subscriptions are immutable and two
            // registrations with the same id carry identical content.
            if !state.subscriptions.contains_key(&id) {
                for source in subscription.touched_sources() {
                    state
                        .by_source
                        .entry(source.to_string())
                        .or_default()
                        .insert(id.clone());
                }
                state.subscriptions.insert(id.clone(), subscription.clone());
            }

            state
                .owners
                .entry(id.clone())
                .or_default()
                .insert(subscriber.clone());
            state
                .subscribers
                .entry(subscriber.clone())
                .or_default()
                .subscription_ids
                .insert(id);
        }

        Ok(())
    }

    fn unsubscribe(&self, subscriber: &SubscriberId) -> Result<()> {
        self.state.write().remove_subscriber(subscriber);
        Ok(())
    }

    fn remove_subscription(&self, subscriber: &SubscriberId, id: &SubscriptionId) -> Result<()> {
        let mut state = self.state.write();
        let removed = state
            .subscribers
            .get_mut(subscriber)
            .map(|entry| entry.subscription_ids.remove(id))
            .unwrap_or(false);
        if removed {
            state.drop_owner(id, subscriber);
        }
        Ok(())
    }

    fn expire(&self, subscriber: &SubscriberId, expiring_at: Timestamp) -> Result<()> {
        let mut state = self.state.write();
        if let Some(entry) = state.subscribers.get_mut(subscriber) {
            entry.expiring_at = Some(expiring_at);
        }
        Ok(())
    }

    fn persist(&self, subscriber: &SubscriberId) -> Result<()> {
        let mut state = self.state.write();
        if let Some(entry) = state.subscribers.get_mut(subscriber) {
            entry.expiring_at = None;
        }
        Ok(())
    }

    fn subscriptions_for_source(&self, source: &str) -> Result<Vec<StoredSubscription>> {
        let state = self.state.read();

        let ids = match state.by_source.get(source) {
            Some(ids) => ids,
            None => return Ok(Vec::new()),
        };

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let subscription = match state.subscriptions.get(id) {
                Some(subscription) => subscription.clone(),
                None => continue,
            };
            let owners = state
                .owners
                .get(id)
                .map(|owners| {
                    owners
                        .iter()
                        .map(|subscriber| Owner {
                            subscriber: subscriber.clone(),
                            expiring_at: state
                                .subscribers
                                .get(subscriber)
                                .and_then(|entry| entry.expiring_at),
                        })
                        .collect()
                })
                .unwrap_or_default();

            results.push(StoredSubscription {
                subscription,
                owners,
            });
        }

        Ok(results)
    }

    fn subscription_ids_for(&self, subscriber: &SubscriberId) -> Result<Vec<SubscriptionId>> {
        Ok(self
            .state
            .read()
            .subscribers
            .get(subscriber)
            .map(|entry| entry.subscription_ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn subscription_count(&self) -> Result<usize> {
        Ok(self.state.read().subscriptions.len())
    }

    fn sweep(&self, now: Timestamp) -> Result<usize> {
        let mut state = self.state.write();

        let due: Vec<SubscriberId> = state
            .subscribers
            .iter()
            .filter(|(_, entry)| matches!(entry.expiring_at, Some(deadline) if deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();

        for subscriber in &due {
            state.remove_subscriber(subscriber);
        }

        Ok(due.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HandlerRef, Predicate, Query, Version};
    use serde_json::json;
    use std::time::Duration;

    fn subscription(source: &str, title: &str) -> Subscription {
        Subscription::from_query(
            Query::source(source).with_predicate(Predicate::equality([("title", json!(title))])),
            HandlerRef::new("noop"),
            Version::new("v1"),
        )
        .unwrap()
    }

    #[test]
    fn test_register_and_fetch_by_source() {
        let adapter = MemoryAdapter::new();
        let sub = subscription("posts", "foo");

        adapter
            .register(&SubscriberId::from("foo"), &[sub.clone()])
            .unwrap();

        let stored = adapter.subscriptions_for_source("posts").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].subscription.id, sub.id);
        assert_eq!(stored[0].owners.len(), 1);

        assert!(adapter.subscriptions_for_source("comments").unwrap().is_empty());
    }

    #[test]
    fn test_shared_subscription_reference_counting() {
        let adapter = MemoryAdapter::new();
        let sub = subscription("posts", "foo");

        adapter
            .register(&SubscriberId::from("foo"), &[sub.clone()])
            .unwrap();
        adapter
            .register(&SubscriberId::from("bar"), &[sub.clone()])
            .unwrap();
        assert_eq!(adapter.subscription_count().unwrap(), 1);

        adapter.unsubscribe(&SubscriberId::from("foo")).unwrap();
        assert_eq!(adapter.subscription_count().unwrap(), 1);

        adapter.unsubscribe(&SubscriberId::from("bar")).unwrap();
        assert_eq!(adapter.subscription_count().unwrap(), 0);
        assert!(adapter.subscriptions_for_source("posts").unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let adapter = MemoryAdapter::new();
        adapter.unsubscribe(&SubscriberId::from("ghost")).unwrap();
        adapter.persist(&SubscriberId::from("ghost")).unwrap();
        adapter
            .expire(&SubscriberId::from("ghost"), Timestamp::now())
            .unwrap();
    }

    #[test]
    fn test_remove_subscription_point_removal() {
        let adapter = MemoryAdapter::new();
        let a = subscription("posts", "foo");
        let b = subscription("posts", "bar");

        let subscriber = SubscriberId::from("foo");
        adapter.register(&subscriber, &[a.clone(), b.clone()]).unwrap();

        adapter.remove_subscription(&subscriber, &a.id).unwrap();

        let remaining = adapter.subscription_ids_for(&subscriber).unwrap();
        assert_eq!(remaining, vec![b.id]);
        assert_eq!(adapter.subscription_count().unwrap(), 1);
    }

    #[test]
    fn test_sweep_removes_due_subscribers_only() {
        let adapter = MemoryAdapter::new();
        let sub = subscription("posts", "foo");

        let foo = SubscriberId::from("foo");
        let bar = SubscriberId::from("bar");
        adapter.register(&foo, &[sub.clone()]).unwrap();
        adapter.register(&bar, &[sub.clone()]).unwrap();

        let now = Timestamp::now();
        adapter.expire(&foo, Timestamp(now.0 - 1)).unwrap();
        adapter
            .expire(&bar, now.plus(Duration::from_secs(3600)))
            .unwrap();

        assert_eq!(adapter.sweep(now).unwrap(), 1);
        assert!(adapter.subscription_ids_for(&foo).unwrap().is_empty());
        assert_eq!(adapter.subscription_ids_for(&bar).unwrap().len(), 1);
        // bar keeps the shared subscription alive.
        assert_eq!(adapter.subscription_count().unwrap(), 1);
    }

    #[test]
    fn test_persist_clears_expiration() {
        let adapter = MemoryAdapter::new();
        let sub = subscription("posts", "foo");
        let foo = SubscriberId::from("foo");

        adapter.register(&foo, &[sub]).unwrap();
        let now = Timestamp::now();
        adapter.expire(&foo, Timestamp(now.0 - 1)).unwrap();
        adapter.persist(&foo).unwrap();

        assert_eq!(adapter.sweep(now).unwrap(), 0);
        assert_eq!(adapter.subscription_ids_for(&foo).unwrap().len(), 1);
    }

    #[test]
    fn test_association_sources_indexed() {
        let adapter = MemoryAdapter::new();
        let sub = Subscription::from_query(
            Query::source("posts").including(crate::types::AssociationNode::new(
                "comments", "post_id",
            )),
            HandlerRef::new("noop"),
            Version::new("v1"),
        )
        .unwrap();

        adapter.register(&SubscriberId::from("foo"), &[sub]).unwrap();

        assert_eq!(adapter.subscriptions_for_source("posts").unwrap().len(), 1);
        assert_eq!(
            adapter.subscriptions_for_source("comments").unwrap().len(),
            1
        );
    }
}
