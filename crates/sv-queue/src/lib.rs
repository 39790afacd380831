use async_trait::async_trait;
use sv_common::{OutgoingMessage, QueueAttributes, ReceivedMessage, MAX_BATCH_SIZE};

pub mod error;
pub mod memory;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use error::QueueError;
pub use memory::InMemoryQueueClient;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Parameters for a single receive call
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveRequest {
    /// Clamped to 10 by every backend
    pub max_messages: usize,
    /// Long poll wait; backend default when None
    pub wait_time_seconds: Option<i32>,
    /// Per-receive visibility override; queue default when None
    pub visibility_timeout: Option<i32>,
    pub attribute_names: Vec<String>,
    pub message_attribute_names: Vec<String>,
}

impl ReceiveRequest {
    /// A request for `max_messages` asking for every system and message attribute.
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.min(MAX_BATCH_SIZE),
            wait_time_seconds: None,
            visibility_timeout: None,
            attribute_names: vec!["All".to_string()],
            message_attribute_names: vec!["All".to_string()],
        }
    }
}

/// One entry of a batch delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteEntry {
    pub id: String,
    pub receipt_handle: String,
}

/// A failed entry of a batch call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: String,
    pub code: String,
    pub message: Option<String>,
    pub sender_fault: bool,
}

/// Delete entries for a set of received messages, ids numbered from 0.
pub fn delete_entries(messages: &[ReceivedMessage]) -> Vec<DeleteEntry> {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| DeleteEntry {
            id: i.to_string(),
            receipt_handle: m.receipt_handle.clone(),
        })
        .collect()
}

/// The messaging backend as seen by the dispatch core.
///
/// Queue references are queue names or full queue URLs.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `request.max_messages` messages
    async fn receive_messages(&self, queue: &str, request: ReceiveRequest) -> Result<Vec<ReceivedMessage>>;

    /// Delete (acknowledge) messages; returns the entries that failed
    async fn delete_messages(&self, queue: &str, entries: Vec<DeleteEntry>) -> Result<Vec<BatchFailure>>;

    /// Send one message, returning the backend message id
    async fn send_message(&self, queue: &str, message: OutgoingMessage) -> Result<String>;

    /// Send many messages; returns the entries that failed.
    /// Default implementation sends one at a time.
    async fn send_messages(&self, queue: &str, messages: Vec<OutgoingMessage>) -> Result<Vec<BatchFailure>> {
        let mut failures = Vec::new();
        for (i, message) in messages.into_iter().enumerate() {
            if let Err(e) = self.send_message(queue, message).await {
                failures.push(BatchFailure {
                    id: i.to_string(),
                    code: "SendFailed".to_string(),
                    message: Some(e.to_string()),
                    sender_fault: false,
                });
            }
        }
        Ok(failures)
    }

    /// Visibility timeout and FIFO flag of a queue
    async fn get_attributes(&self, queue: &str) -> Result<QueueAttributes>;

    /// Make a received message visible again after `seconds`
    async fn change_visibility(&self, queue: &str, receipt_handle: &str, seconds: u32) -> Result<()>;
}

/// Queue name from a name or a queue URL.
pub fn queue_name_from_ref(queue: &str) -> &str {
    queue.rsplit('/').next().unwrap_or(queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_receive_request_is_clamped() {
        assert_eq!(ReceiveRequest::new(25).max_messages, 10);
        assert_eq!(ReceiveRequest::new(3).max_messages, 3);
    }

    #[test]
    fn test_delete_entries_numbering() {
        let message = |rh: &str| ReceivedMessage {
            message_id: rh.to_string(),
            body: String::new(),
            attributes: HashMap::new(),
            message_attributes: HashMap::new(),
            receipt_handle: rh.to_string(),
            queue_name: "q".to_string(),
        };
        let entries = delete_entries(&[message("a"), message("b")]);
        assert_eq!(entries[0], DeleteEntry { id: "0".to_string(), receipt_handle: "a".to_string() });
        assert_eq!(entries[1].id, "1");
    }

    #[test]
    fn test_queue_name_from_ref() {
        assert_eq!(queue_name_from_ref("https://sqs.us-east-1.amazonaws.com/123/orders.fifo"), "orders.fifo");
        assert_eq!(queue_name_from_ref("orders"), "orders");
    }
}
