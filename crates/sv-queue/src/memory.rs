//! In-memory queue backend for development and tests.
//!
//! Models the SQS behaviour the dispatch core relies on:
//! - visibility timeouts and receive counts
//! - per-message delays
//! - FIFO queues: messages of one message group are handed out in send order,
//!   one at a time; a group is blocked while one of its messages is in flight

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use sv_common::{
    attributes, MessageAttributeValue, OutgoingMessage, QueueAttributes, ReceivedMessage,
    MAX_DELAY_SECONDS, MAX_VISIBILITY_TIMEOUT_SECONDS,
};

use crate::{queue_name_from_ref, BatchFailure, DeleteEntry, QueueClient, QueueError, ReceiveRequest, Result};

struct StoredMessage {
    message_id: String,
    body: String,
    message_attributes: HashMap<String, MessageAttributeValue>,
    group_id: Option<String>,
    sent_at_millis: i64,
    visible_at: Instant,
    receive_count: u32,
    receipt_handle: Option<String>,
}

impl StoredMessage {
    fn in_flight(&self, now: Instant) -> bool {
        self.receipt_handle.is_some() && self.visible_at > now
    }
}

struct MemoryQueue {
    attributes: QueueAttributes,
    messages: Vec<StoredMessage>,
}

/// A visibility change observed by the in-memory backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityChange {
    pub queue: String,
    pub message_id: String,
    pub seconds: u32,
}

/// In-memory `QueueClient`
#[derive(Default)]
pub struct InMemoryQueueClient {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    unavailable: AtomicBool,
    sequence: AtomicU64,
    visibility_changes: Mutex<Vec<VisibilityChange>>,
    deleted: Mutex<Vec<String>>,
    receive_calls: AtomicU64,
    attribute_calls: AtomicU64,
    /// Long poll wait used when a request does not set one
    wait_time_seconds: u64,
}

/// How often a long poll re-checks for visible messages
const LONG_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make empty receives wait up to `seconds` for a message, like SQS long polling.
    pub fn with_wait_time_seconds(mut self, seconds: u64) -> Self {
        self.wait_time_seconds = seconds;
        self
    }

    /// Create a queue. Names ending in `.fifo` are FIFO queues.
    pub fn create_queue(&self, name: &str, visibility_timeout: u32) {
        let attributes = QueueAttributes {
            visibility_timeout,
            fifo: name.ends_with(".fifo"),
        };
        self.queues.lock().insert(
            name.to_string(),
            MemoryQueue {
                attributes,
                messages: Vec::new(),
            },
        );
    }

    /// Simulate the backend being unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages still held by the queue (visible, delayed or in flight)
    pub fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    pub fn in_flight(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.messages.iter().filter(|m| m.in_flight(now)).count())
            .unwrap_or(0)
    }

    /// Ids of deleted messages in deletion order
    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    pub fn visibility_changes(&self) -> Vec<VisibilityChange> {
        self.visibility_changes.lock().clone()
    }

    pub fn receive_calls(&self) -> u64 {
        self.receive_calls.load(Ordering::SeqCst)
    }

    pub fn attribute_calls(&self) -> u64 {
        self.attribute_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory backend marked unavailable".to_string()));
        }
        Ok(())
    }

    fn try_receive(&self, name: &str, request: &ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        let now = Instant::now();
        let mut queues = self.queues.lock();
        let stored = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;

        let visibility = request
            .visibility_timeout
            .map(|v| v.max(0) as u32)
            .unwrap_or(stored.attributes.visibility_timeout);

        // A group with a message in flight blocks every later message of that group
        let mut blocked: HashSet<String> = if stored.attributes.fifo {
            stored
                .messages
                .iter()
                .filter(|m| m.in_flight(now))
                .filter_map(|m| m.group_id.clone())
                .collect()
        } else {
            HashSet::new()
        };
        let mut delayed_groups: HashSet<String> = HashSet::new();

        let mut received = Vec::new();
        for message in stored.messages.iter_mut() {
            if received.len() >= request.max_messages {
                break;
            }
            let group_blocked = message
                .group_id
                .as_ref()
                .map(|g| blocked.contains(g) || delayed_groups.contains(g))
                .unwrap_or(false);
            if message.visible_at > now || group_blocked {
                if stored.attributes.fifo {
                    if let Some(group) = &message.group_id {
                        delayed_groups.insert(group.clone());
                    }
                }
                continue;
            }

            message.receive_count += 1;
            let receipt_handle = format!("{}-{}", message.message_id, self.sequence.fetch_add(1, Ordering::SeqCst));
            message.receipt_handle = Some(receipt_handle.clone());
            message.visible_at = now + Duration::from_secs(visibility as u64);

            let mut attrs = HashMap::new();
            attrs.insert(attributes::APPROXIMATE_RECEIVE_COUNT.to_string(), message.receive_count.to_string());
            attrs.insert(attributes::SENT_TIMESTAMP.to_string(), message.sent_at_millis.to_string());
            if let Some(group) = &message.group_id {
                attrs.insert(attributes::MESSAGE_GROUP_ID.to_string(), group.clone());
                blocked.insert(group.clone());
            }

            received.push(ReceivedMessage {
                message_id: message.message_id.clone(),
                body: message.body.clone(),
                attributes: attrs,
                message_attributes: message.message_attributes.clone(),
                receipt_handle,
                queue_name: name.to_string(),
            });
        }

        debug!(queue = %name, count = received.len(), "In-memory receive");
        Ok(received)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn receive_messages(&self, queue: &str, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>> {
        self.check_available()?;
        self.receive_calls.fetch_add(1, Ordering::SeqCst);

        let name = queue_name_from_ref(queue);
        let wait = request
            .wait_time_seconds
            .map(|w| w.max(0) as u64)
            .unwrap_or(self.wait_time_seconds);
        let deadline = Instant::now() + Duration::from_secs(wait);
        loop {
            let received = self.try_receive(name, &request)?;
            let now = Instant::now();
            if !received.is_empty() || now >= deadline {
                return Ok(received);
            }
            tokio::time::sleep(LONG_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn delete_messages(&self, queue: &str, entries: Vec<DeleteEntry>) -> Result<Vec<BatchFailure>> {
        self.check_available()?;
        let name = queue_name_from_ref(queue);
        let mut queues = self.queues.lock();
        let stored = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;

        let mut failures = Vec::new();
        for entry in entries {
            let position = stored
                .messages
                .iter()
                .position(|m| m.receipt_handle.as_deref() == Some(entry.receipt_handle.as_str()));
            match position {
                Some(index) => {
                    let removed = stored.messages.remove(index);
                    self.deleted.lock().push(removed.message_id);
                }
                None => failures.push(BatchFailure {
                    id: entry.id,
                    code: "ReceiptHandleIsInvalid".to_string(),
                    message: Some(format!("unknown receipt handle {}", entry.receipt_handle)),
                    sender_fault: true,
                }),
            }
        }
        Ok(failures)
    }

    async fn send_message(&self, queue: &str, message: OutgoingMessage) -> Result<String> {
        self.check_available()?;
        let name = queue_name_from_ref(queue);
        let message_id = format!("{}-{}", uuid::Uuid::new_v4(), self.next_sequence());

        let mut queues = self.queues.lock();
        let stored = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;

        if stored.attributes.fifo && message.message_group_id.is_none() {
            return Err(QueueError::InvalidParameter(
                "MessageGroupId is required for FIFO queues".to_string(),
            ));
        }
        let delay = message.delay_seconds.unwrap_or(0);
        if delay > MAX_DELAY_SECONDS {
            return Err(QueueError::InvalidParameter(format!("DelaySeconds {delay} exceeds {MAX_DELAY_SECONDS}")));
        }

        stored.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: message.body,
            message_attributes: message.message_attributes,
            group_id: message.message_group_id,
            sent_at_millis: Utc::now().timestamp_millis(),
            visible_at: Instant::now() + Duration::from_secs(delay as u64),
            receive_count: 0,
            receipt_handle: None,
        });
        Ok(message_id)
    }

    async fn get_attributes(&self, queue: &str) -> Result<QueueAttributes> {
        self.attribute_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let name = queue_name_from_ref(queue);
        self.queues
            .lock()
            .get(name)
            .map(|q| q.attributes)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))
    }

    async fn change_visibility(&self, queue: &str, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.check_available()?;
        if seconds > MAX_VISIBILITY_TIMEOUT_SECONDS {
            return Err(QueueError::InvalidParameter(format!(
                "VisibilityTimeout {seconds} exceeds {MAX_VISIBILITY_TIMEOUT_SECONDS}"
            )));
        }
        let name = queue_name_from_ref(queue);
        let mut queues = self.queues.lock();
        let stored = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::QueueNotFound(name.to_string()))?;
        let message = stored
            .messages
            .iter_mut()
            .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::InvalidReceiptHandle(receipt_handle.to_string()))?;

        message.visible_at = Instant::now() + Duration::from_secs(seconds as u64);
        self.visibility_changes.lock().push(VisibilityChange {
            queue: name.to_string(),
            message_id: message.message_id.clone(),
            seconds,
        });
        Ok(())
    }
}
