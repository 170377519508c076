//! Core types for the subscription engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Attribute map for a single record, as reported by the data layer.
///
/// Ordered so that serialization (and therefore digesting) is deterministic.
pub type Attributes = BTreeMap<String, Value>;

/// Caller-supplied opaque identifier for a subscriber (e.g., a realtime
/// connection).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        SubscriberId(id.into())
    }
}

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        SubscriberId(s.to_string())
    }
}

/// Content digest identifying a subscription (hex-encoded SHA-256 over the
/// subscription's source, predicate, association spec, and handler).
///
/// Two subscribers registering the same logical subscription share one id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({}...)", &self.0[..self.0.len().min(8)])
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Application version a subscription was created under. Subscriptions from
/// a prior deploy are skipped during mutation processing, never dispatched.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Version(pub String);

impl Version {
    pub fn new(v: impl Into<String>) -> Self {
        Version(v.into())
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Version(s.to_string())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }

    /// Deadline `ttl` from this instant.
    pub fn plus(self, ttl: Duration) -> Self {
        Timestamp(self.0 + ttl.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of data-source mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

/// An ephemeral mutation event reported by the data layer after a
/// persistence operation commits. Never stored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mutation {
    /// Source the mutation occurred on.
    pub source: String,

    /// What happened.
    pub action: MutationAction,

    /// Record attributes. Post-mutation state for creates and updates;
    /// last-known (pre-delete) state for deletes.
    pub record: Attributes,

    /// Pre-mutation state. Present for updates only.
    pub previous_record: Option<Attributes>,
}

impl Mutation {
    pub fn create(source: impl Into<String>, record: Attributes) -> Self {
        Self {
            source: source.into(),
            action: MutationAction::Create,
            record,
            previous_record: None,
        }
    }

    pub fn update(
        source: impl Into<String>,
        record: Attributes,
        previous_record: Attributes,
    ) -> Self {
        Self {
            source: source.into(),
            action: MutationAction::Update,
            record,
            previous_record: Some(previous_record),
        }
    }

    /// A delete carries the record's last-known attributes.
    pub fn delete(source: impl Into<String>, record: Attributes) -> Self {
        Self {
            source: source.into(),
            action: MutationAction::Delete,
            record,
            previous_record: None,
        }
    }
}

/// Filter applied to a source to decide record membership.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Key/value equality terms. Every key must match the record attribute;
    /// an array-valued term matches by set membership. An empty map covers
    /// every record of the source.
    Equality { terms: BTreeMap<String, Value> },

    /// A named filter resolved through the filter registry, shared with the
    /// live-query path so the two can never disagree.
    NamedFilter { name: String, args: Vec<Value> },
}

impl Predicate {
    /// Predicate covering every record of the source.
    pub fn all() -> Self {
        Predicate::Equality {
            terms: BTreeMap::new(),
        }
    }

    /// Build an equality predicate from key/value pairs.
    pub fn equality<K, V, I>(terms: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Predicate::Equality {
            terms: terms
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Build a named-filter predicate.
    pub fn named(name: impl Into<String>, args: Vec<Value>) -> Self {
        Predicate::NamedFilter {
            name: name.into(),
            args,
        }
    }
}

/// One node of an association traversal tree.
///
/// `source` is the associated (child) source; its records carry
/// `foreign_key` referencing the parent record's `id` attribute. Nested
/// children describe deeper inclusions (posts -> comments -> tags).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssociationNode {
    /// Associated source name.
    pub source: String,

    /// Attribute on this source's records pointing at the parent record.
    pub foreign_key: String,

    /// Optional filter this source's records must additionally satisfy.
    pub predicate: Option<Predicate>,

    /// Nested inclusions under this source.
    pub children: Vec<AssociationNode>,
}

impl AssociationNode {
    pub fn new(source: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            foreign_key: foreign_key.into(),
            predicate: None,
            children: Vec::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_children(mut self, children: Vec<AssociationNode>) -> Self {
        self.children = children;
        self
    }

    /// Collect every source name in this subtree.
    pub fn collect_sources<'a>(&'a self, out: &mut Vec<&'a str>) {
        out.push(&self.source);
        for child in &self.children {
            child.collect_sources(out);
        }
    }
}

/// Reference to a handler: a name resolved through the handler registry at
/// dispatch time, plus serializable state handed to the handler.
///
/// Stored by name (not as a function) so subscriptions survive a round-trip
/// through a distributed adapter and fire in whichever process observes the
/// mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandlerRef {
    pub name: String,

    /// Constructor context passed through to the handler on every dispatch.
    #[serde(default)]
    pub state: Value,
}

impl HandlerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Value::Null,
        }
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }
}

/// A query definition as handed in by application code: the shape of a
/// subscription before it is tagged with a handler and version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub source: String,
    pub predicate: Predicate,
    pub association_spec: Option<AssociationNode>,
}

impl Query {
    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            predicate: Predicate::all(),
            association_spec: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn including(mut self, node: AssociationNode) -> Self {
        self.association_spec = Some(node);
        self
    }
}

/// One registered interest in a query's result set. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Subscription {
    /// Content digest over source, predicate, association spec, and handler.
    pub id: SubscriptionId,

    /// Source being watched.
    pub source: String,

    /// Membership filter.
    pub predicate: Predicate,

    /// Optional association traversal tree; lets coverage span joins.
    pub association_spec: Option<AssociationNode>,

    /// Handler fired on covered mutations.
    pub handler: HandlerRef,

    /// Application version active at creation.
    pub version: Version,
}

/// Digest input. Field order is part of the id format.
#[derive(Serialize)]
struct DigestInput<'a> {
    source: &'a str,
    predicate: &'a Predicate,
    association_spec: &'a Option<AssociationNode>,
    handler: &'a HandlerRef,
}

impl Subscription {
    /// Build a subscription from a query, computing its content id.
    pub fn from_query(query: Query, handler: HandlerRef, version: Version) -> Result<Self> {
        let id = Self::digest(
            &query.source,
            &query.predicate,
            &query.association_spec,
            &handler,
        )?;
        Ok(Self {
            id,
            source: query.source,
            predicate: query.predicate,
            association_spec: query.association_spec,
            handler,
            version,
        })
    }

    /// Content digest: SHA-256 over the MessagePack encoding of the
    /// identity fields, hex-encoded.
    fn digest(
        source: &str,
        predicate: &Predicate,
        association_spec: &Option<AssociationNode>,
        handler: &HandlerRef,
    ) -> Result<SubscriptionId> {
        let input = DigestInput {
            source,
            predicate,
            association_spec,
            handler,
        };
        let encoded = rmp_serde::to_vec(&input)?;
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(SubscriptionId(hex::encode(hasher.finalize())))
    }

    /// Every source name this subscription's coverage touches: the top-level
    /// source plus all sources in the association tree. Adapters index by
    /// these so mutations to included sources reach the subscription.
    pub fn touched_sources(&self) -> Vec<&str> {
        let mut sources = vec![self.source.as_str()];
        if let Some(spec) = &self.association_spec {
            spec.collect_sources(&mut sources);
        }
        sources
    }
}

/// Ownership entry for a stored subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Owner {
    pub subscriber: SubscriberId,

    /// Expiration deadline, when the owner is in the expiring state.
    pub expiring_at: Option<Timestamp>,
}

impl Owner {
    /// Active means not expiring, or expiring with the deadline still ahead.
    pub fn is_active(&self, now: Timestamp) -> bool {
        match self.expiring_at {
            None => true,
            Some(deadline) => deadline > now,
        }
    }
}

/// A subscription together with its current owners, as returned by adapter
/// reads on the mutation path.
#[derive(Clone, Debug)]
pub struct StoredSubscription {
    pub subscription: Subscription,
    pub owners: Vec<Owner>,
}

impl StoredSubscription {
    /// A subscription fires only while at least one owner is active.
    pub fn has_active_owner(&self, now: Timestamp) -> bool {
        self.owners.iter().any(|owner| owner.is_active(now))
    }
}
