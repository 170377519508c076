//! # Liveset
//!
//! A data subscription / live-query invalidation engine. Applications
//! register interest in a query's result set; when the data layer reports a
//! mutation, the engine decides which outstanding subscriptions the mutated
//! record is covered by — including across association traversals — and
//! fires each one's handler exactly once.
//!
//! ## Core Concepts
//!
//! - **Subscriptions**: A stored interest in a query's result set, tied to
//!   a handler and identified by content digest
//! - **Coverage**: In-memory membership tests for single mutated records,
//!   with pre/post-state handling for updates
//! - **Subscribers**: External owners of subscriptions, with a reversible
//!   expire/persist lifecycle and multi-owner reference counting
//! - **Adapters**: Pluggable storage — in-memory, or Redis for
//!   multi-process deployments
//!
//! ## Example
//!
//! ```ignore
//! use liveset::{
//!     EngineConfig, HandlerRef, MemoryAdapter, NullLookup, Predicate, Query,
//!     SubscriberId, SubscriptionEngine,
//! };
//!
//! let engine = SubscriptionEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(MemoryAdapter::new()),
//!     Arc::new(NullLookup),
//! );
//!
//! engine.handlers().register("reload", |context| {
//!     println!("{} changed", context.source);
//!     Ok(())
//! });
//!
//! engine.subscribe(
//!     Query::source("posts").with_predicate(Predicate::equality([("title", json!("foo"))])),
//!     &SubscriberId::from("connection-1"),
//!     HandlerRef::new("reload"),
//! )?;
//!
//! // Reported by the data layer after a write commits:
//! engine.did_mutate(&Mutation::create("posts", record))?;
//! ```

pub mod adapter;
pub mod coverage;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod registry;
pub mod types;

// Re-exports
#[cfg(feature = "redis-adapter")]
pub use adapter::{RedisAdapter, RedisAdapterConfig};
pub use adapter::{MemoryAdapter, SubscriptionAdapter};
pub use coverage::{
    CoverageEvaluator, MapLookup, NamedFilterRegistry, NullLookup, RecordLookup,
    DEFAULT_MAX_ASSOCIATION_DEPTH,
};
pub use dispatch::{
    DispatchMode, Dispatcher, Handler, HandlerContext, HandlerError, HandlerRegistry,
};
pub use engine::{EngineConfig, SubscriptionEngine};
pub use error::{Result, SubscriptionError};
pub use registry::SubscriberRegistry;
pub use types::*;
