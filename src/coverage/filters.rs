//! Registry of named filter predicates.

use crate::types::Attributes;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A pure membership test: does `record` belong to the filter's result set,
/// given the filter's positional arguments?
pub type NamedFilterFn = dyn Fn(&Attributes, &[Value]) -> bool + Send + Sync;

/// Maps filter names to membership functions.
///
/// A source that defines a `by_title` query registers its filter logic here
/// once; subscriptions then reference it by name
/// (`Predicate::named("by_title", args)`), and coverage evaluation applies
/// the same function the live-query path uses.
pub struct NamedFilterRegistry {
    filters: RwLock<HashMap<String, Arc<NamedFilterFn>>>,
}

impl NamedFilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: RwLock::new(HashMap::new()),
        }
    }

    /// Register a filter under `name`, replacing any previous registration.
    pub fn register<F>(&self, name: impl Into<String>, filter: F)
    where
        F: Fn(&Attributes, &[Value]) -> bool + Send + Sync + 'static,
    {
        self.filters.write().insert(name.into(), Arc::new(filter));
    }

    /// Look up a filter by name.
    pub fn get(&self, name: &str) -> Option<Arc<NamedFilterFn>> {
        self.filters.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.read().contains_key(name)
    }
}

impl Default for NamedFilterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
