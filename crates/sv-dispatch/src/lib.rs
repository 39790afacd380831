//! Stevedore dispatch core
//!
//! This crate turns queue messages into worker invocations:
//! - WorkerRegistry: queue to worker mapping and per-message worker resolution
//! - PollingStrategy: WeightedRoundRobin and StrictPriority queue selection
//! - Manager: per-group dispatch loop with bounded processor slots
//! - Fetcher / Processor: receive with retry, body parsing, middleware invocation
//! - MiddlewareChain: onion-ordered server middleware (retry, auto delete, ...)
//! - Launcher: starts and stops one manager per group
//! - Enqueuer: client side job enqueueing

pub mod context;
pub mod enqueue;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod launcher;
pub mod manager;
pub mod metrics;
pub mod middleware;
pub mod polling;
pub mod processor;
pub mod registry;
pub mod worker;

pub use context::{Context, DispatchOptions};
pub use enqueue::{EnqueueBody, EnqueueOptions, Enqueuer};
pub use error::DispatchError;
pub use events::{ErrorContext, LifecycleEvent};
pub use fetcher::{Fetched, Fetcher};
pub use launcher::Launcher;
pub use manager::{Manager, ManagerState, MIN_DISPATCH_INTERVAL};
pub use middleware::{Invocation, Middleware, MiddlewareChain, Next};
pub use polling::{PollingStrategy, SharedStrategy, StrictPriority, WeightedRoundRobin};
pub use processor::Processor;
pub use registry::WorkerRegistry;
pub use worker::{
    Body, BodyOnly, BodyParser, BodyWorker, ErrorKind, NonRetryable, ParseBody, ResolvedWorker, RetryIntervals,
    Worker, WorkerDefinition, WorkerOptions,
};

pub type Result<T> = std::result::Result<T, DispatchError>;
