//! Server middleware chain
//!
//! Middleware wrap a worker's `perform` in onion order: the first entry is
//! the outermost layer. A middleware that does not call `next` stops the
//! invocation there. Entries are identified by their concrete type.

mod auto_delete;
mod auto_extend;
mod non_retryable;
mod retry;
mod timing;
mod unpause;

pub use auto_delete::AutoDelete;
pub use auto_extend::{AutoExtendVisibility, EXTEND_UPFRONT_SECONDS};
pub use non_retryable::NonRetryableError;
pub use retry::ExponentialBackoffRetry;
pub use timing::Timing;
pub use unpause::UnpauseQueue;

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::{type_name, TypeId};
use std::sync::Arc;
use tracing::warn;

use sv_common::{Payload, QueueAttributes};

use crate::context::Context;
use crate::polling::SharedStrategy;
use crate::worker::{Body, ResolvedWorker};

/// Everything a middleware sees about one worker invocation
pub struct Invocation {
    pub worker: ResolvedWorker,
    pub group: String,
    pub queue: String,
    pub payload: Payload,
    pub body: Body,
    /// The queue is a FIFO queue
    pub fifo: bool,
    pub context: Arc<Context>,
    pub strategy: SharedStrategy,
}

impl Invocation {
    /// Queue attributes, falling back to defaults when the backend cannot
    /// be reached.
    pub async fn queue_attributes(&self) -> QueueAttributes {
        match self.context.client().get_attributes(&self.queue).await {
            Ok(attributes) => attributes,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "Could not read queue attributes, using defaults");
                QueueAttributes {
                    fifo: self.fifo,
                    ..QueueAttributes::default()
                }
            }
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn call(&self, invocation: &mut Invocation, next: Next<'_>) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct Entry {
    id: TypeId,
    name: &'static str,
    middleware: Arc<dyn Middleware>,
}

impl Entry {
    fn new<M: Middleware>(middleware: M) -> Self {
        Self {
            id: TypeId::of::<M>(),
            name: type_name::<M>(),
            middleware: Arc::new(middleware),
        }
    }
}

/// The rest of the chain below the current middleware
pub struct Next<'a> {
    rest: &'a [Entry],
}

impl<'a> Next<'a> {
    /// Run the remaining middleware, then the worker.
    pub fn run<'b>(self, invocation: &'b mut Invocation) -> BoxFuture<'b, anyhow::Result<()>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, rest)) => head.middleware.call(invocation, Next { rest }).await,
                None => {
                    let worker = invocation.worker.instance.clone();
                    worker.perform(&invocation.payload, &invocation.body).await
                }
            }
        })
    }
}

#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Entry>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timing, ExponentialBackoffRetry, NonRetryableError, AutoDelete,
    /// AutoExtendVisibility, UnpauseQueue, outermost first.
    pub fn default_chain() -> Self {
        let mut chain = Self::new();
        chain
            .add(Timing)
            .add(ExponentialBackoffRetry)
            .add(NonRetryableError)
            .add(AutoDelete)
            .add(AutoExtendVisibility)
            .add(UnpauseQueue);
        chain
    }

    fn position<M: Middleware>(&self) -> Option<usize> {
        let id = TypeId::of::<M>();
        self.entries.iter().position(|entry| entry.id == id)
    }

    /// Append as the innermost layer. No-op when `M` is already present.
    pub fn add<M: Middleware>(&mut self, middleware: M) -> &mut Self {
        if self.position::<M>().is_none() {
            self.entries.push(Entry::new(middleware));
        }
        self
    }

    /// Insert as the outermost layer, moving an existing `M`.
    pub fn prepend<M: Middleware>(&mut self, middleware: M) -> &mut Self {
        self.remove::<M>();
        self.entries.insert(0, Entry::new(middleware));
        self
    }

    /// Insert `M` right before `Anchor`, or at the front when `Anchor` is absent.
    pub fn insert_before<Anchor: Middleware, M: Middleware>(&mut self, middleware: M) -> &mut Self {
        self.remove::<M>();
        let index = self.position::<Anchor>().unwrap_or(0);
        self.entries.insert(index, Entry::new(middleware));
        self
    }

    /// Insert `M` right after `Anchor`, or at the end when `Anchor` is absent.
    pub fn insert_after<Anchor: Middleware, M: Middleware>(&mut self, middleware: M) -> &mut Self {
        self.remove::<M>();
        let index = self
            .position::<Anchor>()
            .map(|i| i + 1)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, Entry::new(middleware));
        self
    }

    /// Returns whether `M` was present
    pub fn remove<M: Middleware>(&mut self) -> bool {
        match self.position::<M>() {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn exists<M: Middleware>(&self) -> bool {
        self.position::<M>().is_some()
    }

    /// Type names, outermost first
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the chain around the invocation's worker.
    pub async fn invoke(&self, invocation: &mut Invocation) -> anyhow::Result<()> {
        Next { rest: &self.entries }.run(invocation).await
    }
}
