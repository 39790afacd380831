//! Lifecycle events and error handler hooks

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Launcher validated queues and is starting managers
    Startup,
    /// A manager picked `queue` and is about to fetch
    Dispatch { group: String, queue: String },
    /// Busy processor count changed
    UtilizationUpdate { group: String, max: usize, busy: usize },
    /// Managers stopped fetching; in-flight work keeps running
    Quiet,
    /// Managers are draining or aborting in-flight work
    Shutdown,
    /// Every manager has stopped
    Stopped,
}

/// Where an error escaping the middleware chain came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub group: String,
    pub queue: String,
    pub worker: String,
    pub message_ids: Vec<String>,
}

pub type EventHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

pub type ErrorHandler = Arc<dyn Fn(&anyhow::Error, &ErrorContext) + Send + Sync>;
