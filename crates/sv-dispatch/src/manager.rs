//! Per-group dispatch loop
//!
//! A manager owns one group's polling strategy and processor slots:
//! - Picks the next queue from the strategy and fetches for the free slots
//! - Spawns one processor task per message (or per batch)
//! - Holds FIFO queues until their in-flight message is done
//! - Drains or aborts in-flight work on stop

use dashmap::DashMap;
use futures::future::{AbortHandle, Abortable};
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use sv_common::{Group, Payload};

use crate::context::Context;
use crate::events::LifecycleEvent;
use crate::fetcher::Fetcher;
use crate::metrics;
use crate::polling::{shared_strategy, SharedStrategy};
use crate::processor::Processor;

/// Sleep between dispatch attempts when nothing can be fetched
pub const MIN_DISPATCH_INTERVAL: Duration = Duration::from_millis(100);

/// How often `stop` checks whether in-flight work finished
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on waiting for aborted processors to release their slots
const ABORT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Running,
    Stopping,
    Stopped,
}

struct ManagerInner {
    group: Group,
    ctx: Arc<Context>,
    strategy: SharedStrategy,
    fetcher: Fetcher,
    processor: Processor,
    slots: Arc<Semaphore>,
    state: Mutex<ManagerState>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    in_flight: DashMap<u64, AbortHandle>,
    next_task_id: AtomicU64,
}

pub struct Manager {
    inner: Arc<ManagerInner>,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(ctx: Arc<Context>, group: Group) -> Self {
        let strategy = shared_strategy(&group);
        let (shutdown_tx, _) = broadcast::channel(1);
        let inner = ManagerInner {
            fetcher: Fetcher::new(ctx.clone(), group.name.clone()),
            processor: Processor::new(ctx.clone(), group.name.clone(), strategy.clone()),
            slots: Arc::new(Semaphore::new(group.concurrency)),
            state: Mutex::new(ManagerState::Created),
            running: AtomicBool::new(false),
            shutdown_tx,
            in_flight: DashMap::new(),
            next_task_id: AtomicU64::new(0),
            strategy,
            group,
            ctx,
        };
        Self {
            inner: Arc::new(inner),
            dispatch_loop: Mutex::new(None),
        }
    }

    /// Spawn the dispatch loop. Only the first call has any effect.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != ManagerState::Created {
                warn!(group = %self.inner.group.name, state = ?*state, "Manager already started");
                return;
            }
            *state = ManagerState::Running;
        }
        self.inner.running.store(true, Ordering::SeqCst);

        info!(
            group = %self.inner.group.name,
            concurrency = self.inner.group.concurrency,
            strategy = %self.inner.group.polling_strategy,
            "Manager started"
        );
        let shutdown_rx = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(ManagerInner::run(self.inner.clone(), shutdown_rx));
        *self.dispatch_loop.lock() = Some(handle);
    }

    /// Stop fetching. In-flight processors keep running.
    pub async fn quiet(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(());

        let handle = self.dispatch_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(group = %self.inner.group.name, error = %e, "Dispatch loop ended abnormally");
            }
            info!(group = %self.inner.group.name, "Manager quiet");
        }
    }

    /// Stop fetching, wait for in-flight work, then abort what remains.
    ///
    /// With `None` the wait is unbounded. Calling stop again, or while a stop
    /// is in progress, returns immediately.
    pub async fn stop(&self, timeout: Option<Duration>) {
        {
            let mut state = self.inner.state.lock();
            let current = *state;
            match current {
                ManagerState::Stopping | ManagerState::Stopped => {
                    debug!(group = %self.inner.group.name, "Manager already stopping");
                    return;
                }
                ManagerState::Created => {
                    *state = ManagerState::Stopped;
                    return;
                }
                ManagerState::Running => *state = ManagerState::Stopping,
            }
        }

        self.quiet().await;

        let busy = self.busy();
        if busy > 0 {
            info!(group = %self.inner.group.name, busy, "Waiting for in-flight processors");
        }
        let started = Instant::now();
        while self.busy() > 0 {
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    break;
                }
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        let remaining = self.inner.in_flight.len();
        if remaining > 0 {
            warn!(
                group = %self.inner.group.name,
                remaining,
                "Aborting in-flight processors, their messages will be redelivered"
            );
            for entry in self.inner.in_flight.iter() {
                entry.value().abort();
            }
            let aborted_at = Instant::now();
            while self.busy() > 0 && aborted_at.elapsed() < ABORT_GRACE {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }

        *self.inner.state.lock() = ManagerState::Stopped;
        info!(group = %self.inner.group.name, "Manager stopped");
    }

    pub fn group(&self) -> &Group {
        &self.inner.group
    }

    pub fn state(&self) -> ManagerState {
        *self.inner.state.lock()
    }

    /// Whether the dispatch loop is fetching
    pub fn running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn busy(&self) -> usize {
        self.inner.busy()
    }

    pub fn ready(&self) -> usize {
        self.inner.slots.available_permits()
    }

    pub fn strategy(&self) -> &SharedStrategy {
        &self.inner.strategy
    }
}

impl ManagerInner {
    async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(group = %self.group.name, "Dispatch loop received shutdown signal");
                    break;
                }
                _ = self.dispatch() => {}
            }
        }
    }

    fn busy(&self) -> usize {
        self.group
            .concurrency
            .saturating_sub(self.slots.available_permits())
    }

    /// One dispatch iteration
    async fn dispatch(self: &Arc<Self>) {
        let ready = self.slots.available_permits();
        if ready == 0 {
            tokio::time::sleep(MIN_DISPATCH_INTERVAL).await;
            return;
        }

        let next = self.strategy.lock().next_queue();
        let queue = match next {
            Some(queue) => queue,
            None => {
                tokio::time::sleep(MIN_DISPATCH_INTERVAL).await;
                return;
            }
        };

        self.ctx.fire_event(LifecycleEvent::Dispatch {
            group: self.group.name.clone(),
            queue: queue.name.clone(),
        });
        debug!(group = %self.group.name, queue = %queue.name, ready, "Dispatching");

        let fetched = match self.fetcher.fetch(&queue, ready, &self.strategy).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(group = %self.group.name, queue = %queue.name, error = %e, "Fetch failed, backing off");
                tokio::time::sleep(self.ctx.options().fetch_error_backoff).await;
                return;
            }
        };
        if fetched.messages.is_empty() {
            // Backends without long polling answer at once
            tokio::time::sleep(MIN_DISPATCH_INTERVAL).await;
            return;
        }

        if fetched.fifo {
            self.strategy.lock().hold_until_processed(&queue.name);
        }

        if self.ctx.registry().batch_receive_messages(&queue.name) {
            self.assign(&queue.name, Payload::Batch(fetched.messages), fetched.fifo)
                .await;
        } else {
            for message in fetched.messages {
                self.assign(&queue.name, Payload::Single(message), fetched.fifo)
                    .await;
            }
        }
    }

    async fn assign(self: &Arc<Self>, queue: &str, payload: Payload, fifo: bool) {
        let permit = match self.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!(group = %self.group.name, "Processor slots closed");
                return;
            }
        };
        self.utilization_update();

        let id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let (abort_handle, registration) = AbortHandle::new_pair();
        self.in_flight.insert(id, abort_handle);

        let inner = self.clone();
        let queue = queue.to_string();
        tokio::spawn(async move {
            let work = AssertUnwindSafe(inner.processor.process(&queue, payload, fifo)).catch_unwind();
            match Abortable::new(work, registration).await {
                Ok(Ok(_)) => {}
                Ok(Err(panic)) => error!(
                    group = %inner.group.name,
                    queue = %queue,
                    panic = %panic_message(&*panic),
                    "Processor panicked"
                ),
                Err(_) => debug!(group = %inner.group.name, queue = %queue, "Processor aborted"),
            }
            inner.processor_done(id, &queue, fifo, permit);
        });
    }

    fn processor_done(&self, id: u64, queue: &str, fifo: bool, permit: OwnedSemaphorePermit) {
        self.in_flight.remove(&id);
        drop(permit);
        if fifo {
            self.strategy.lock().message_processed(queue);
        }
        self.utilization_update();
    }

    fn utilization_update(&self) {
        let busy = self.busy();
        metrics::set_busy_processors(&self.group.name, busy);
        self.ctx.fire_event(LifecycleEvent::UtilizationUpdate {
            group: self.group.name.clone(),
            max: self.group.concurrency,
            busy,
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
