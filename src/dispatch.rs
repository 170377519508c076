//! Handler resolution and isolated invocation.
//!
//! Handlers are registered by name and resolved at dispatch time, so a
//! subscription stored by one process can fire in another. A failing or
//! panicking handler is logged as a delivery failure for that subscription
//! only; it never reaches the orchestrator's per-subscription loop.

use crate::types::{Attributes, Mutation, MutationAction, Subscription, SubscriptionId};
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{trace, warn};

/// Everything a handler receives on invocation.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    /// Subscription that matched.
    pub subscription_id: SubscriptionId,

    /// Source the mutation occurred on.
    pub source: String,

    pub action: MutationAction,

    /// Mutated record (post-state; pre-delete state for deletes).
    pub record: Attributes,

    /// Pre-state for updates.
    pub previous_record: Option<Attributes>,

    /// Constructor context captured at subscribe time.
    pub state: Value,
}

/// Error type handlers may return.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A subscription handler. Implemented directly or via any matching closure.
pub trait Handler: Send + Sync {
    fn handle(&self, context: &HandlerContext) -> std::result::Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&HandlerContext) -> std::result::Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, context: &HandlerContext) -> std::result::Result<(), HandlerError> {
        self(context)
    }
}

/// Maps handler names to implementations.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under `name`, replacing any previous registration.
    pub fn register(&self, name: impl Into<String>, handler: impl Handler + 'static) {
        self.handlers.write().insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// How covered subscriptions are delivered.
#[derive(Clone, Debug, Default)]
pub enum DispatchMode {
    /// Run handlers on the calling thread.
    #[default]
    Inline,

    /// Hand jobs to a bounded worker pool. Ordering across subscriptions is
    /// not guaranteed; at-most-one dispatch per subscription per mutation
    /// still is. A full queue applies backpressure to the caller.
    Pool { workers: usize, queue_depth: usize },
}

type Job = Box<dyn FnOnce() + Send>;

struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(workers: usize, queue_depth: usize) -> Self {
        let (sender, receiver) = bounded::<Job>(queue_depth);
        let workers = (0..workers.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                std::thread::spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                })
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    fn submit(&self, job: Job) {
        match &self.sender {
            Some(sender) => {
                // Blocking send: delivery is best-effort but never silently
                // shed under load.
                if let Err(error) = sender.send(job) {
                    error.into_inner()();
                }
            }
            None => job(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Disconnect the channel so workers drain and exit.
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Resolves and invokes handlers for covered subscriptions.
pub struct Dispatcher {
    handlers: Arc<HandlerRegistry>,
    pool: Option<WorkerPool>,
}

impl Dispatcher {
    pub fn new(handlers: Arc<HandlerRegistry>, mode: DispatchMode) -> Self {
        let pool = match mode {
            DispatchMode::Inline => None,
            DispatchMode::Pool {
                workers,
                queue_depth,
            } => Some(WorkerPool::new(workers, queue_depth)),
        };

        Self { handlers, pool }
    }

    /// Deliver one mutation to one subscription's handler.
    pub fn dispatch(&self, subscription: &Subscription, mutation: &Mutation) {
        let handler = match self.handlers.get(&subscription.handler.name) {
            Some(handler) => handler,
            None => {
                warn!(
                    subscription = %subscription.id,
                    handler = %subscription.handler.name,
                    "no handler registered; delivery dropped"
                );
                return;
            }
        };

        let context = HandlerContext {
            subscription_id: subscription.id.clone(),
            source: mutation.source.clone(),
            action: mutation.action,
            record: mutation.record.clone(),
            previous_record: mutation.previous_record.clone(),
            state: subscription.handler.state.clone(),
        };

        let job = move || run_handler(handler, context);
        match &self.pool {
            Some(pool) => pool.submit(Box::new(job)),
            None => job(),
        }
    }
}

fn run_handler(handler: Arc<dyn Handler>, context: HandlerContext) {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(&context))) {
        Ok(Ok(())) => {
            trace!(subscription = %context.subscription_id, source = %context.source, "dispatched");
        }
        Ok(Err(error)) => {
            warn!(
                subscription = %context.subscription_id,
                source = %context.source,
                action = ?context.action,
                %error,
                "handler dispatch failed"
            );
        }
        Err(_) => {
            warn!(
                subscription = %context.subscription_id,
                source = %context.source,
                action = ?context.action,
                "handler panicked"
            );
        }
    }
}
