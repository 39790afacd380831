//! Starts and stops one manager per group

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use sv_common::Group;
use sv_config::AppConfig;
use sv_queue::QueueError;

use crate::context::Context;
use crate::events::LifecycleEvent;
use crate::manager::Manager;
use crate::{DispatchError, Result};

pub struct Launcher {
    ctx: Arc<Context>,
    managers: Vec<Manager>,
    quieted: AtomicBool,
    stopping: AtomicBool,
}

impl Launcher {
    pub fn new(ctx: Arc<Context>, groups: Vec<Group>) -> Self {
        let managers = groups
            .into_iter()
            .map(|group| Manager::new(ctx.clone(), group))
            .collect();
        Self {
            ctx,
            managers,
            quieted: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn from_config(ctx: Arc<Context>, config: &AppConfig) -> Result<Self> {
        Ok(Self::new(ctx, config.groups()?))
    }

    /// Validate every configured queue, fire `Startup` and start the managers.
    ///
    /// A queue that does not exist is fatal. A queue without a worker is only
    /// warned about since messages may name their worker explicitly.
    pub async fn start(&self) -> Result<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(DispatchError::ShutdownInProgress);
        }
        self.validate_queues().await?;

        self.ctx.fire_event(LifecycleEvent::Startup);
        for manager in &self.managers {
            manager.start();
        }
        info!(groups = self.managers.len(), "Launcher started");
        Ok(())
    }

    async fn validate_queues(&self) -> Result<()> {
        let client = self.ctx.client();
        let registry = self.ctx.registry();

        for manager in &self.managers {
            for queue in manager.group().unique_queues() {
                match client.get_attributes(&queue).await {
                    Ok(_) => {}
                    Err(QueueError::QueueNotFound(name)) => {
                        return Err(DispatchError::Queue(QueueError::QueueNotFound(format!(
                            "{} (group {})",
                            name,
                            manager.group().name
                        ))));
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Could not validate queue, continuing");
                    }
                }
                if registry.workers(&queue).is_empty() {
                    warn!(
                        group = %manager.group().name,
                        queue = %queue,
                        "No worker registered for queue"
                    );
                }
            }
        }
        Ok(())
    }

    /// Stop fetching everywhere; in-flight work keeps running.
    pub async fn quiet(&self) {
        if self.quieted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.fire_event(LifecycleEvent::Quiet);
        join_all(self.managers.iter().map(|manager| manager.quiet())).await;
    }

    /// Soft stop: stop fetching everywhere, then wait for in-flight work.
    pub async fn stop(&self) {
        self.shutdown(None).await;
    }

    /// Hard stop: like `stop` but aborts work still running after `timeout`.
    pub async fn stop_now(&self, timeout: Duration) {
        self.shutdown(Some(timeout)).await;
    }

    async fn shutdown(&self, timeout: Option<Duration>) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            warn!("Launcher already stopping");
            return;
        }
        info!(timeout_secs = ?timeout.map(|t| t.as_secs()), "Launcher stopping");

        self.quiet().await;

        self.ctx.fire_event(LifecycleEvent::Shutdown);
        join_all(self.managers.iter().map(|manager| manager.stop(timeout))).await;

        self.ctx.fire_event(LifecycleEvent::Stopped);
        info!("Launcher stopped");
    }

    /// Every manager is still fetching
    pub fn healthy(&self) -> bool {
        !self.managers.is_empty() && self.managers.iter().all(Manager::running)
    }

    pub fn managers(&self) -> &[Manager] {
        &self.managers
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }
}
