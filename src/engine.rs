//! The subscription engine tying all components together.

use crate::adapter::SubscriptionAdapter;
use crate::coverage::{CoverageEvaluator, NamedFilterRegistry, RecordLookup};
use crate::dispatch::{DispatchMode, Dispatcher, HandlerRegistry};
use crate::error::{Result, SubscriptionError};
use crate::registry::SubscriberRegistry;
use crate::types::{
    AssociationNode, HandlerRef, Mutation, Query, SubscriberId, Subscription, SubscriptionId,
    Timestamp, Version,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Current application version. Subscriptions created under a different
    /// version are skipped during mutation processing.
    pub version: Version,

    /// Inline or pooled handler dispatch.
    pub dispatch: DispatchMode,

    /// Bound on association spec nesting.
    pub max_association_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: Version::new("0"),
            dispatch: DispatchMode::Inline,
            max_association_depth: crate::coverage::DEFAULT_MAX_ASSOCIATION_DEPTH,
        }
    }
}

/// The component applications interact with.
///
/// Holds no persistent state of its own: every durable fact lives in the
/// adapter, so the engine is safely restartable by re-reading it. Exposes
/// `subscribe`, `unsubscribe`, `expire`, `persist`, and `did_mutate`.
pub struct SubscriptionEngine {
    config: EngineConfig,

    /// Durable subscription/subscriber state.
    adapter: Arc<dyn SubscriptionAdapter>,

    /// Lifecycle layer over the adapter.
    registry: SubscriberRegistry,

    /// Membership decisions.
    evaluator: CoverageEvaluator,

    /// Named filters shared with the live-query path.
    filters: Arc<NamedFilterRegistry>,

    /// Handlers resolvable at dispatch time.
    handlers: Arc<HandlerRegistry>,

    dispatcher: Dispatcher,

    /// Parent-record resolution for association coverage.
    lookup: Arc<dyn RecordLookup>,
}

impl SubscriptionEngine {
    pub fn new(
        config: EngineConfig,
        adapter: Arc<dyn SubscriptionAdapter>,
        lookup: Arc<dyn RecordLookup>,
    ) -> Self {
        let filters = Arc::new(NamedFilterRegistry::new());
        let handlers = Arc::new(HandlerRegistry::new());
        let evaluator = CoverageEvaluator::new(Arc::clone(&filters))
            .with_max_association_depth(config.max_association_depth);
        let dispatcher = Dispatcher::new(Arc::clone(&handlers), config.dispatch.clone());
        let registry = SubscriberRegistry::new(Arc::clone(&adapter));

        Self {
            config,
            adapter,
            registry,
            evaluator,
            filters,
            handlers,
            dispatcher,
            lookup,
        }
    }

    /// Named filter registry, for wiring up source-defined queries.
    pub fn filters(&self) -> &Arc<NamedFilterRegistry> {
        &self.filters
    }

    /// Handler registry, for wiring up handler implementations.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Configured application version.
    pub fn version(&self) -> &Version {
        &self.config.version
    }

    /// Register interest in `query`'s result set for `subscriber`, firing
    /// `handler` on covered mutations. Returns the subscription id; a
    /// subscriber re-registering an identical query gets the same id back.
    pub fn subscribe(
        &self,
        query: Query,
        subscriber: &SubscriberId,
        handler: HandlerRef,
    ) -> Result<SubscriptionId> {
        let ids = self.subscribe_all(vec![(query, handler)], subscriber)?;
        Ok(ids.into_iter().next().expect("one query in, one id out"))
    }

    /// Batch variant of [`subscribe`](Self::subscribe): registers every
    /// query atomically for the subscriber.
    pub fn subscribe_all(
        &self,
        queries: Vec<(Query, HandlerRef)>,
        subscriber: &SubscriberId,
    ) -> Result<Vec<SubscriptionId>> {
        let mut subscriptions = Vec::with_capacity(queries.len());
        for (query, handler) in queries {
            self.check_depth(&query)?;
            subscriptions.push(Subscription::from_query(
                query,
                handler,
                self.config.version.clone(),
            )?);
        }
        self.registry.register_subscriptions(&subscriptions, subscriber)
    }

    /// Remove the subscriber and every subscription it exclusively owns.
    /// Unknown subscribers are a no-op.
    pub fn unsubscribe(&self, subscriber: &SubscriberId) -> Result<()> {
        self.registry.unsubscribe(subscriber)
    }

    /// Point removal of one subscription from one subscriber.
    pub fn remove_subscription(
        &self,
        subscriber: &SubscriberId,
        id: &SubscriptionId,
    ) -> Result<()> {
        self.registry.remove_subscription(subscriber, id)
    }

    /// Suspend the subscriber for `ttl`; its subscriptions keep firing only
    /// through other active owners until the deadline passes or `persist`
    /// restores it.
    pub fn expire(&self, subscriber: &SubscriberId, ttl: Duration) -> Result<()> {
        self.registry.expire(subscriber, ttl)
    }

    /// Cancel a pending expiration.
    pub fn persist(&self, subscriber: &SubscriberId) -> Result<()> {
        self.registry.persist(subscriber)
    }

    /// Subscription ids held by `subscriber`.
    pub fn subscriptions(&self, subscriber: &SubscriberId) -> Result<Vec<SubscriptionId>> {
        self.registry.subscription_ids(subscriber)
    }

    /// Number of stored subscriptions.
    pub fn subscription_count(&self) -> Result<usize> {
        self.adapter.subscription_count()
    }

    /// Out-of-band expiration sweep.
    pub fn sweep(&self) -> Result<usize> {
        self.registry.sweep(Timestamp::now())
    }

    /// The hot path: report a committed mutation and dispatch every covered,
    /// version-matching, actively-owned subscription exactly once.
    ///
    /// Adapter errors surface to the caller; per-subscription coverage and
    /// handler failures are logged and skipped so one bad subscription never
    /// blocks delivery to the rest. Returns the number of dispatches.
    pub fn did_mutate(&self, mutation: &Mutation) -> Result<usize> {
        let now = Timestamp::now();

        // Lazy removal of subscribers whose grace period has elapsed.
        self.registry.sweep(now)?;

        let stored = self.adapter.subscriptions_for_source(&mutation.source)?;
        let mut dispatched = 0;

        for entry in stored {
            if entry.subscription.version != self.config.version {
                trace!(
                    subscription = %entry.subscription.id,
                    stored = %entry.subscription.version.0,
                    current = %self.config.version.0,
                    "skipping stale subscription"
                );
                continue;
            }

            if !entry.has_active_owner(now) {
                continue;
            }

            match self
                .evaluator
                .covers(&entry.subscription, mutation, self.lookup.as_ref())
            {
                Ok(true) => {
                    self.dispatcher.dispatch(&entry.subscription, mutation);
                    dispatched += 1;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(
                        subscription = %entry.subscription.id,
                        source = %mutation.source,
                        %error,
                        "coverage evaluation failed"
                    );
                }
            }
        }

        Ok(dispatched)
    }

    fn check_depth(&self, query: &Query) -> Result<()> {
        fn depth(node: &AssociationNode) -> usize {
            1 + node.children.iter().map(depth).max().unwrap_or(0)
        }

        if let Some(spec) = &query.association_spec {
            let found = depth(spec);
            if found > self.config.max_association_depth {
                return Err(SubscriptionError::AssociationTooDeep {
                    depth: found,
                    bound: self.config.max_association_depth,
                });
            }
        }
        Ok(())
    }
}
