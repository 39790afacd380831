use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceiptHandle(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue client is stopped")]
    Stopped,

    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("AWS SQS error: {0}")]
    Sqs(String),
}

impl QueueError {
    /// Transport-level failures worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Unavailable(_) | QueueError::Sqs(_))
    }
}
