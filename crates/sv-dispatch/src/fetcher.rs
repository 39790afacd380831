//! Receives messages for a group's manager

use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, error, warn};

use sv_common::{QueueConfiguration, ReceivedMessage, MAX_BATCH_SIZE};
use sv_queue::{QueueError, ReceiveRequest};

use crate::context::Context;
use crate::polling::SharedStrategy;
use crate::{metrics, DispatchError, Result};

/// Transient receive errors are retried this many times
pub const MAX_FETCH_RETRIES: u32 = 3;

/// The result of one fetch
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub messages: Vec<ReceivedMessage>,
    pub fifo: bool,
}

pub struct Fetcher {
    ctx: Arc<Context>,
    group: String,
    /// FIFO flag per queue; it never changes for an existing queue
    fifo_queues: DashMap<String, bool>,
}

impl Fetcher {
    pub fn new(ctx: Arc<Context>, group: impl Into<String>) -> Self {
        Self {
            ctx,
            group: group.into(),
            fifo_queues: DashMap::new(),
        }
    }

    /// Fetch from `queue` for `available` free processors and report the
    /// count to the group's strategy.
    ///
    /// Errors are logged and turned into an empty fetch unless `raise_errors`
    /// is set.
    pub async fn fetch(
        &self,
        queue: &QueueConfiguration,
        available: usize,
        strategy: &SharedStrategy,
    ) -> Result<Fetched> {
        match self.receive_with_retry(queue, available).await {
            Ok(fetched) => {
                let count = fetched.messages.len();
                strategy.lock().messages_found(&queue.name, count);
                debug!(group = %self.group, queue = %queue.name, count, "Found messages");
                metrics::record_messages_fetched(&self.group, &queue.name, count);
                Ok(fetched)
            }
            Err(e) => {
                strategy.lock().messages_found(&queue.name, 0);
                metrics::record_fetch_error(&self.group, &queue.name);
                error!(group = %self.group, queue = %queue.name, error = %e, "Error fetching messages");
                if self.ctx.options().raise_errors {
                    Err(DispatchError::Fetch {
                        queue: queue.name.clone(),
                        source: e,
                    })
                } else {
                    Ok(Fetched::default())
                }
            }
        }
    }

    async fn receive_with_retry(
        &self,
        queue: &QueueConfiguration,
        available: usize,
    ) -> std::result::Result<Fetched, QueueError> {
        let mut retries = 0;
        loop {
            match self.receive(queue, available).await {
                Err(e) if e.is_transient() && retries < MAX_FETCH_RETRIES => {
                    retries += 1;
                    let factor: u32 = rand::rng().random_range(1..=5);
                    let backoff = self.ctx.options().fetch_retry_backoff * factor;
                    warn!(
                        queue = %queue.name,
                        attempt = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying fetch"
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn receive(
        &self,
        queue: &QueueConfiguration,
        available: usize,
    ) -> std::result::Result<Fetched, QueueError> {
        let client = self.ctx.client();
        let fifo = self.is_fifo(&queue.name).await?;

        let limit = if self.ctx.registry().batch_receive_messages(&queue.name) {
            MAX_BATCH_SIZE
        } else if fifo {
            1
        } else {
            available.clamp(1, MAX_BATCH_SIZE)
        };

        let mut request = ReceiveRequest::new(limit);
        request.wait_time_seconds = queue.option_i64("wait_time_seconds").map(|v| v as i32);
        request.visibility_timeout = queue.option_i64("visibility_timeout").map(|v| v as i32);

        let messages = client.receive_messages(&queue.name, request).await?;
        Ok(Fetched { messages, fifo })
    }

    async fn is_fifo(&self, queue: &str) -> std::result::Result<bool, QueueError> {
        let cached = self.fifo_queues.get(queue).map(|entry| *entry);
        if let Some(fifo) = cached {
            return Ok(fifo);
        }
        let fifo = self.ctx.client().get_attributes(queue).await?.fifo;
        self.fifo_queues.insert(queue.to_string(), fifo);
        Ok(fifo)
    }
}
