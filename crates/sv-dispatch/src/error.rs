use sv_config::ConfigError;
use sv_queue::QueueError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid worker registration: {0}")]
    InvalidWorkerRegistration(String),

    #[error("No worker found for queue {queue}")]
    WorkerNotFound { queue: String },

    #[error("Worker not registered: {0}")]
    UnknownWorker(String),

    #[error("Fetch from {queue} failed: {source}")]
    Fetch {
        queue: String,
        #[source]
        source: QueueError,
    },

    #[error("Body parse error: {0}")]
    BodyParse(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker failed: {0:#}")]
    Worker(anyhow::Error),

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}
