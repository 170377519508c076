//! Redis-backed adapter for multi-process deployments.
//!
//! Key layout (all under a configurable prefix):
//! - `subscription:{id}` — MessagePack payload of the subscription
//! - `subscriptions` — set of all stored subscription ids
//! - `source:{name}` — set of subscription ids touching the source
//! - `owners:{id}` — set of subscriber ids owning the subscription
//! - `subscriber:{id}` — set of subscription ids held by the subscriber
//! - `expiring` — sorted set of subscriber ids scored by deadline (micros)
//!
//! Writes for one subscriber go through MULTI/EXEC pipelines. Payloads are
//! immutable once stored, so a small LRU cache avoids re-fetching and
//! re-decoding them on every mutation.

use crate::error::{Result, SubscriptionError};
use crate::types::{
    Owner, StoredSubscription, SubscriberId, Subscription, SubscriptionId, Timestamp,
};
use lru::LruCache;
use parking_lot::Mutex;
use redis::{Client, Commands, Connection};
use std::num::NonZeroUsize;

use super::SubscriptionAdapter;

/// Connection settings for [`RedisAdapter`].
#[derive(Clone, Debug)]
pub struct RedisAdapterConfig {
    /// Redis connection URL.
    pub url: String,

    /// Prefix for every key written by this adapter.
    pub key_prefix: String,

    /// Capacity of the local payload cache.
    pub cache_size: usize,
}

impl Default for RedisAdapterConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "liveset".to_string(),
            cache_size: 1024,
        }
    }
}

/// Multi-process adapter backed by Redis.
pub struct RedisAdapter {
    config: RedisAdapterConfig,
    connection: Mutex<Connection>,
    payload_cache: Mutex<LruCache<SubscriptionId, Subscription>>,
}

impl RedisAdapter {
    /// Connect to Redis. Fails fast if the server is unreachable.
    pub fn connect(config: RedisAdapterConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = client.get_connection()?;
        let cache_size = NonZeroUsize::new(config.cache_size.max(1)).expect("non-zero");

        Ok(Self {
            config,
            connection: Mutex::new(connection),
            payload_cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    fn subscription_key(&self, id: &SubscriptionId) -> String {
        format!("{}:subscription:{}", self.config.key_prefix, id)
    }

    fn subscriptions_key(&self) -> String {
        format!("{}:subscriptions", self.config.key_prefix)
    }

    fn source_key(&self, source: &str) -> String {
        format!("{}:source:{}", self.config.key_prefix, source)
    }

    fn owners_key(&self, id: &SubscriptionId) -> String {
        format!("{}:owners:{}", self.config.key_prefix, id)
    }

    fn subscriber_key(&self, subscriber: &SubscriberId) -> String {
        format!("{}:subscriber:{}", self.config.key_prefix, subscriber)
    }

    fn expiring_key(&self) -> String {
        format!("{}:expiring", self.config.key_prefix)
    }

    /// Fetch and decode a payload, going through the local cache.
    fn fetch_subscription(
        &self,
        conn: &mut Connection,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>> {
        if let Some(subscription) = self.payload_cache.lock().get(id) {
            return Ok(Some(subscription.clone()));
        }

        let payload: Option<Vec<u8>> = conn.get(self.subscription_key(id))?;
        let payload = match payload {
            Some(payload) => payload,
            None => return Ok(None),
        };

        let subscription: Subscription = rmp_serde::from_slice(&payload)
            .map_err(|_| SubscriptionError::Corruption(id.clone()))?;
        self.payload_cache
            .lock()
            .put(id.clone(), subscription.clone());
        Ok(Some(subscription))
    }

    /// Drop one ownership; delete the subscription's keys at zero owners.
    fn drop_owner(
        &self,
        conn: &mut Connection,
        id: &SubscriptionId,
        subscriber: &SubscriberId,
    ) -> Result<()> {
        let owners_key = self.owners_key(id);
        let () = conn.srem(&owners_key, subscriber.0.as_str())?;

        let remaining: usize = conn.scard(&owners_key)?;
        if remaining > 0 {
            return Ok(());
        }

        // Last owner gone; tear down the payload and its source index
        // entries in one transaction.
        let subscription = self.fetch_subscription(conn, id)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.subscription_key(id)).ignore();
        pipe.del(&owners_key).ignore();
        pipe.srem(self.subscriptions_key(), id.0.as_str()).ignore();
        if let Some(subscription) = &subscription {
            for source in subscription.touched_sources() {
                pipe.srem(self.source_key(source), id.0.as_str()).ignore();
            }
        }
        pipe.query::<()>(conn)?;
        self.payload_cache.lock().pop(id);

        Ok(())
    }

    fn remove_subscriber(&self, conn: &mut Connection, subscriber: &SubscriberId) -> Result<()> {
        let ids: Vec<String> = conn.smembers(self.subscriber_key(subscriber))?;
        for id in ids {
            self.drop_owner(conn, &SubscriptionId(id), subscriber)?;
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.subscriber_key(subscriber)).ignore();
        pipe.zrem(self.expiring_key(), subscriber.0.as_str())
            .ignore();
        pipe.query::<()>(conn)?;

        Ok(())
    }
}

impl SubscriptionAdapter for RedisAdapter {
    fn register(&self, subscriber: &SubscriberId, subscriptions: &[Subscription]) -> Result<()> {
        let mut conn = self.connection.lock();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for subscription in subscriptions {
            let payload = rmp_serde::to_vec(subscription)?;
            let id = subscription.id.0.as_str();

            // NX keeps the first stored payload; ids are content digests, so
            // a second registration carries identical content anyway.
            pipe.cmd("SET")
                .arg(self.subscription_key(&subscription.id))
                .arg(payload)
                .arg("NX")
                .ignore();
            pipe.sadd(self.subscriptions_key(), id).ignore();
            for source in subscription.touched_sources() {
                pipe.sadd(self.source_key(source), id).ignore();
            }
            pipe.sadd(self.owners_key(&subscription.id), subscriber.0.as_str())
                .ignore();
            pipe.sadd(self.subscriber_key(subscriber), id).ignore();
        }
        pipe.query::<()>(&mut conn)?;

        Ok(())
    }

    fn unsubscribe(&self, subscriber: &SubscriberId) -> Result<()> {
        let mut conn = self.connection.lock();
        self.remove_subscriber(&mut conn, subscriber)
    }

    fn remove_subscription(&self, subscriber: &SubscriberId, id: &SubscriptionId) -> Result<()> {
        let mut conn = self.connection.lock();
        let removed: usize = conn.srem(self.subscriber_key(subscriber), id.0.as_str())?;
        if removed > 0 {
            self.drop_owner(&mut conn, id, subscriber)?;
        }
        Ok(())
    }

    fn expire(&self, subscriber: &SubscriberId, expiring_at: Timestamp) -> Result<()> {
        let mut conn = self.connection.lock();

        // Unknown subscribers stay untracked: a deadline with no owned
        // subscriptions would only leave a stray sorted-set member behind.
        let known: bool = conn.exists(self.subscriber_key(subscriber))?;
        if known {
            let () = conn.zadd(self.expiring_key(), subscriber.0.as_str(), expiring_at.0)?;
        }
        Ok(())
    }

    fn persist(&self, subscriber: &SubscriberId) -> Result<()> {
        let mut conn = self.connection.lock();
        let () = conn.zrem(self.expiring_key(), subscriber.0.as_str())?;
        Ok(())
    }

    fn subscriptions_for_source(&self, source: &str) -> Result<Vec<StoredSubscription>> {
        let mut conn = self.connection.lock();

        let ids: Vec<String> = conn.smembers(self.source_key(source))?;
        let mut results = Vec::with_capacity(ids.len());

        for id in ids {
            let id = SubscriptionId(id);
            let subscription = match self.fetch_subscription(&mut conn, &id)? {
                Some(subscription) => subscription,
                // Dangling index entry from a torn-down subscription.
                None => {
                    let () = conn.srem(self.source_key(source), id.0.as_str())?;
                    continue;
                }
            };

            let owner_ids: Vec<String> = conn.smembers(self.owners_key(&id))?;
            let mut owners = Vec::with_capacity(owner_ids.len());
            for owner_id in owner_ids {
                let score: Option<i64> =
                    conn.zscore(self.expiring_key(), owner_id.as_str())?;
                owners.push(Owner {
                    subscriber: SubscriberId(owner_id),
                    expiring_at: score.map(Timestamp),
                });
            }

            results.push(StoredSubscription {
                subscription,
                owners,
            });
        }

        Ok(results)
    }

    fn subscription_ids_for(&self, subscriber: &SubscriberId) -> Result<Vec<SubscriptionId>> {
        let mut conn = self.connection.lock();
        let ids: Vec<String> = conn.smembers(self.subscriber_key(subscriber))?;
        Ok(ids.into_iter().map(SubscriptionId).collect())
    }

    fn subscription_count(&self) -> Result<usize> {
        let mut conn = self.connection.lock();
        Ok(conn.scard(self.subscriptions_key())?)
    }

    fn sweep(&self, now: Timestamp) -> Result<usize> {
        let mut conn = self.connection.lock();

        let due: Vec<String> =
            conn.zrangebyscore(self.expiring_key(), i64::MIN, now.0)?;
        for subscriber in &due {
            self.remove_subscriber(&mut conn, &SubscriberId(subscriber.clone()))?;
        }

        Ok(due.len())
    }
}
