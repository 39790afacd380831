//! Client-side job enqueueing
//!
//! Sends a message to a worker's queue tagged with the worker name, so the
//! consuming side resolves exactly that worker.

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use sv_common::{MessageAttributeValue, OutgoingMessage, DEFAULT_GROUP, MAX_DELAY_SECONDS, WORKER_CLASS_ATTRIBUTE};
use sv_queue::QueueClient;

use crate::registry::WorkerRegistry;
use crate::{DispatchError, Result};

/// A job body as it goes on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueBody {
    /// Sent as-is
    Raw(String),
    /// Serialized to a JSON string
    Json(serde_json::Value),
}

impl EnqueueBody {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(EnqueueBody::Json(serde_json::to_value(value)?))
    }

    fn into_wire(self) -> Result<String> {
        match self {
            EnqueueBody::Raw(body) => Ok(body),
            EnqueueBody::Json(value) => Ok(serde_json::to_string(&value)?),
        }
    }
}

impl From<String> for EnqueueBody {
    fn from(body: String) -> Self {
        EnqueueBody::Raw(body)
    }
}

impl From<&str> for EnqueueBody {
    fn from(body: &str) -> Self {
        EnqueueBody::Raw(body.to_string())
    }
}

impl From<serde_json::Value> for EnqueueBody {
    fn from(value: serde_json::Value) -> Self {
        EnqueueBody::Json(value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Overrides the worker's queue
    pub queue: Option<String>,
    pub delay: Option<Duration>,
    /// FIFO only; `default` when unset
    pub message_group_id: Option<String>,
    /// FIFO only; SHA-256 of the body when unset
    pub message_deduplication_id: Option<String>,
}

pub struct Enqueuer {
    client: Arc<dyn QueueClient>,
    registry: Arc<WorkerRegistry>,
    fifo_queues: DashMap<String, bool>,
}

impl Enqueuer {
    pub fn new(client: Arc<dyn QueueClient>, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            client,
            registry,
            fifo_queues: DashMap::new(),
        }
    }

    /// Enqueue a job for `worker` to run as soon as possible.
    pub async fn perform_async(&self, worker: &str, body: impl Into<EnqueueBody>) -> Result<String> {
        self.enqueue(worker, body.into(), EnqueueOptions::default()).await
    }

    /// Enqueue a job for `worker` to run after `delay` (at most 15 minutes).
    pub async fn perform_in(
        &self,
        worker: &str,
        delay: Duration,
        body: impl Into<EnqueueBody>,
    ) -> Result<String> {
        let options = EnqueueOptions {
            delay: Some(delay),
            ..EnqueueOptions::default()
        };
        self.enqueue(worker, body.into(), options).await
    }

    /// Enqueue with explicit options; returns the backend message id.
    pub async fn enqueue(&self, worker: &str, body: EnqueueBody, options: EnqueueOptions) -> Result<String> {
        let definition = self
            .registry
            .definition(worker)
            .ok_or_else(|| DispatchError::UnknownWorker(worker.to_string()))?;
        let queue = options
            .queue
            .clone()
            .unwrap_or_else(|| definition.queue().to_string());

        let body = body.into_wire()?;
        let mut message = OutgoingMessage::new(body)
            .with_attribute(WORKER_CLASS_ATTRIBUTE, MessageAttributeValue::string(worker));

        if let Some(delay) = options.delay {
            let requested = delay.as_secs();
            let seconds = if requested > MAX_DELAY_SECONDS as u64 {
                warn!(
                    worker = %worker,
                    queue = %queue,
                    requested_secs = requested,
                    max_secs = MAX_DELAY_SECONDS,
                    "Delay exceeds the queue maximum, clamping"
                );
                MAX_DELAY_SECONDS
            } else {
                requested as u32
            };
            message = message.with_delay(seconds);
        }

        if self.is_fifo(&queue).await? {
            let group = options
                .message_group_id
                .unwrap_or_else(|| DEFAULT_GROUP.to_string());
            let dedup = options
                .message_deduplication_id
                .unwrap_or_else(|| content_deduplication_id(&message.body));
            message = message.with_group(group);
            message.message_deduplication_id = Some(dedup);
        }

        let message_id = self.client.send_message(&queue, message).await?;
        debug!(worker = %worker, queue = %queue, message_id = %message_id, "Job enqueued");
        Ok(message_id)
    }

    async fn is_fifo(&self, queue: &str) -> Result<bool> {
        let cached = self.fifo_queues.get(queue).map(|entry| *entry);
        if let Some(fifo) = cached {
            return Ok(fifo);
        }
        let fifo = self.client.get_attributes(queue).await?.fifo;
        self.fifo_queues.insert(queue.to_string(), fifo);
        Ok(fifo)
    }
}

/// Hex SHA-256 of a message body
pub fn content_deduplication_id(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_deduplication_id() {
        assert_eq!(
            content_deduplication_id("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_body_wire_format() {
        let body = EnqueueBody::json(&serde_json::json!({"id": 1})).unwrap();
        assert_eq!(body.into_wire().unwrap(), r#"{"id":1}"#);
        assert_eq!(EnqueueBody::from("plain").into_wire().unwrap(), "plain");
    }
}
