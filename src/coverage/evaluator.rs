//! Record-against-subscription coverage decisions.

use crate::error::{Result, SubscriptionError};
use crate::types::{
    AssociationNode, Attributes, Mutation, MutationAction, Predicate, Subscription,
};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::filters::NamedFilterRegistry;

/// Attribute that association foreign keys point at.
const PRIMARY_KEY: &str = "id";

/// Default bound on association nesting depth.
pub const DEFAULT_MAX_ASSOCIATION_DEPTH: usize = 8;

/// Resolves a record by key in some source. Association coverage needs this:
/// a mutated child record identifies its parent only by foreign key, and the
/// parent's attributes must be fetched to test the parent predicate.
///
/// Implemented by the surrounding data layer; [`MapLookup`] is an in-memory
/// implementation for tests and single-process use.
pub trait RecordLookup: Send + Sync {
    /// Find one record in `source` whose `key` attribute equals `value`.
    fn find_record(&self, source: &str, key: &str, value: &Value) -> Option<Attributes>;
}

/// A lookup that never finds anything. Association coverage always fails;
/// flat coverage is unaffected.
pub struct NullLookup;

impl RecordLookup for NullLookup {
    fn find_record(&self, _source: &str, _key: &str, _value: &Value) -> Option<Attributes> {
        None
    }
}

/// In-memory lookup over per-source record lists.
pub struct MapLookup {
    records: RwLock<HashMap<String, Vec<Attributes>>>,
}

impl MapLookup {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Add a record under `source`.
    pub fn insert(&self, source: impl Into<String>, record: Attributes) {
        self.records.write().entry(source.into()).or_default().push(record);
    }

    /// Drop all records under `source`.
    pub fn clear(&self, source: &str) {
        self.records.write().remove(source);
    }
}

impl Default for MapLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordLookup for MapLookup {
    fn find_record(&self, source: &str, key: &str, value: &Value) -> Option<Attributes> {
        self.records
            .read()
            .get(source)?
            .iter()
            .find(|record| record.get(key) == Some(value))
            .cloned()
    }
}

/// Decides whether a mutated record is covered by a subscription.
pub struct CoverageEvaluator {
    filters: Arc<NamedFilterRegistry>,
    max_association_depth: usize,
}

impl CoverageEvaluator {
    pub fn new(filters: Arc<NamedFilterRegistry>) -> Self {
        Self {
            filters,
            max_association_depth: DEFAULT_MAX_ASSOCIATION_DEPTH,
        }
    }

    pub fn with_max_association_depth(mut self, bound: usize) -> Self {
        self.max_association_depth = bound;
        self
    }

    /// Is `mutation` covered by `subscription`?
    ///
    /// Creates test the new record, deletes the last-known record. Updates
    /// test post-state first and fall back to pre-state, so a record moving
    /// into or out of the result set both count — and a record matching in
    /// both states still yields a single `true`, which the engine turns into
    /// a single dispatch.
    pub fn covers(
        &self,
        subscription: &Subscription,
        mutation: &Mutation,
        lookup: &dyn RecordLookup,
    ) -> Result<bool> {
        match mutation.action {
            MutationAction::Create | MutationAction::Delete => {
                self.covers_record(subscription, &mutation.source, &mutation.record, lookup)
            }
            MutationAction::Update => {
                if self.covers_record(subscription, &mutation.source, &mutation.record, lookup)? {
                    return Ok(true);
                }
                match &mutation.previous_record {
                    Some(previous) => {
                        self.covers_record(subscription, &mutation.source, previous, lookup)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    /// Test a single record state against the subscription.
    fn covers_record(
        &self,
        subscription: &Subscription,
        source: &str,
        record: &Attributes,
        lookup: &dyn RecordLookup,
    ) -> Result<bool> {
        if subscription.source == source {
            return self.matches(&subscription.predicate, record);
        }

        let spec = match &subscription.association_spec {
            Some(spec) => spec,
            None => return Ok(false),
        };

        // A source may appear at several positions in the tree; any covered
        // path suffices.
        let mut paths = Vec::new();
        collect_paths(spec, source, &mut Vec::new(), &mut paths);

        for path in paths {
            if path.len() > self.max_association_depth {
                return Err(SubscriptionError::AssociationTooDeep {
                    depth: path.len(),
                    bound: self.max_association_depth,
                });
            }
            if self.path_covers(subscription, &path, record, lookup)? {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Climb one association path from the mutated record up to the
    /// subscription's top-level source, testing each node's predicate on
    /// the way and the subscription's own predicate at the root.
    fn path_covers(
        &self,
        subscription: &Subscription,
        path: &[&AssociationNode],
        record: &Attributes,
        lookup: &dyn RecordLookup,
    ) -> Result<bool> {
        let mut current = record.clone();

        for (index, node) in path.iter().enumerate().rev() {
            if let Some(predicate) = &node.predicate {
                if !self.matches(predicate, &current)? {
                    return Ok(false);
                }
            }

            let parent_id = match current.get(&node.foreign_key) {
                Some(value) if !value.is_null() => value.clone(),
                _ => return Ok(false),
            };

            let parent_source = if index == 0 {
                subscription.source.as_str()
            } else {
                path[index - 1].source.as_str()
            };

            current = match lookup.find_record(parent_source, PRIMARY_KEY, &parent_id) {
                Some(parent) => parent,
                None => return Ok(false),
            };
        }

        self.matches(&subscription.predicate, &current)
    }

    /// Evaluate a predicate against a record.
    fn matches(&self, predicate: &Predicate, record: &Attributes) -> Result<bool> {
        match predicate {
            Predicate::Equality { terms } => {
                Ok(terms.iter().all(|(key, expected)| match record.get(key) {
                    Some(actual) => match expected {
                        // Compound term: membership, not equality.
                        Value::Array(set) => set.contains(actual),
                        _ => expected == actual,
                    },
                    None => false,
                }))
            }
            Predicate::NamedFilter { name, args } => {
                let filter = self
                    .filters
                    .get(name)
                    .ok_or_else(|| SubscriptionError::UnknownFilter(name.clone()))?;
                Ok(filter(record, args))
            }
        }
    }
}

/// Collect every root-to-node path whose final node watches `source`.
fn collect_paths<'a>(
    node: &'a AssociationNode,
    source: &str,
    prefix: &mut Vec<&'a AssociationNode>,
    out: &mut Vec<Vec<&'a AssociationNode>>,
) {
    prefix.push(node);
    if node.source == source {
        out.push(prefix.clone());
    }
    for child in &node.children {
        collect_paths(child, source, prefix, out);
    }
    prefix.pop();
}
