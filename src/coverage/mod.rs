//! Coverage evaluation: deciding whether a mutated record belongs to a
//! subscription's result set.
//!
//! Evaluation is purely in-memory against the single candidate record;
//! mutation events arrive one record at a time and membership must be
//! decided without re-running the query against the datastore. Named-query
//! predicates resolve through [`NamedFilterRegistry`], which the live-query
//! path shares, so the two can never disagree.

mod evaluator;
mod filters;

pub use evaluator::{
    CoverageEvaluator, MapLookup, NullLookup, RecordLookup, DEFAULT_MAX_ASSOCIATION_DEPTH,
};
pub use filters::{NamedFilterFn, NamedFilterRegistry};
