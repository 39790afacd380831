//! Shared dispatch context
//!
//! Everything managers, fetchers and processors need is constructed once,
//! configured, and then shared behind an `Arc`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use sv_config::AppConfig;
use sv_queue::QueueClient;

use crate::events::{ErrorContext, ErrorHandler, EventHandler, LifecycleEvent};
use crate::middleware::MiddlewareChain;
use crate::registry::WorkerRegistry;

/// Runtime knobs for the dispatch core
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Surface fetch errors to the manager instead of treating them as empty
    pub raise_errors: bool,
    /// Base of the random 1-5x sleep between fetch retries
    pub fetch_retry_backoff: Duration,
    /// Manager back-off after a fetch error surfaced by `raise_errors`
    pub fetch_error_backoff: Duration,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            raise_errors: false,
            fetch_retry_backoff: Duration::from_secs(1),
            fetch_error_backoff: Duration::from_secs(1),
        }
    }
}

impl DispatchOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            raise_errors: config.raise_errors,
            ..Self::default()
        }
    }
}

pub struct Context {
    client: Arc<dyn QueueClient>,
    registry: Arc<WorkerRegistry>,
    middleware: MiddlewareChain,
    options: DispatchOptions,
    event_handlers: Vec<EventHandler>,
    error_handlers: Vec<ErrorHandler>,
}

impl Context {
    /// A context with the default middleware chain and default options
    pub fn new(client: Arc<dyn QueueClient>, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            client,
            registry,
            middleware: MiddlewareChain::default_chain(),
            options: DispatchOptions::default(),
            event_handlers: Vec::new(),
            error_handlers: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn middleware_mut(&mut self) -> &mut MiddlewareChain {
        &mut self.middleware
    }

    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
    }

    pub fn on_error<F>(&mut self, handler: F)
    where
        F: Fn(&anyhow::Error, &ErrorContext) + Send + Sync + 'static,
    {
        self.error_handlers.push(Arc::new(handler));
    }

    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn middleware(&self) -> &MiddlewareChain {
        &self.middleware
    }

    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Deliver an event to every handler. A panicking handler is logged and
    /// does not stop delivery to the others.
    pub fn fire_event(&self, event: LifecycleEvent) {
        for handler in &self.event_handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(event = ?event, "Lifecycle event handler panicked");
            }
        }
    }

    pub fn handle_error(&self, err: &anyhow::Error, context: &ErrorContext) {
        for handler in &self.error_handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(err, context))).is_err() {
                error!(queue = %context.queue, worker = %context.worker, "Error handler panicked");
            }
        }
    }
}
