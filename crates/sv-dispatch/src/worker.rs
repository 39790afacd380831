//! Worker contract and per-worker options

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

use sv_common::{Payload, ReceivedMessage};

use crate::DispatchError;

/// A job handler bound to a queue.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Handle one message or one batch. `body` is the parsed body; for
    /// batches it is `Body::Batch` in message order.
    async fn perform(&self, payload: &Payload, body: &Body) -> anyhow::Result<()>;
}

/// A worker that only looks at the parsed body.
#[async_trait]
pub trait BodyWorker: Send + Sync {
    async fn perform(&self, body: &Body) -> anyhow::Result<()>;
}

/// Adapts a `BodyWorker` to the full `Worker` contract.
pub struct BodyOnly<W>(pub W);

#[async_trait]
impl<W: BodyWorker> Worker for BodyOnly<W> {
    async fn perform(&self, _payload: &Payload, body: &Body) -> anyhow::Result<()> {
        self.0.perform(body).await
    }
}

/// A parsed message body
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Text(String),
    Json(serde_json::Value),
    Batch(Vec<Body>),
}

impl Body {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Bodies of a batch; a single body is a batch of one.
    pub fn items(&self) -> &[Body] {
        match self {
            Body::Batch(items) => items,
            other => std::slice::from_ref(other),
        }
    }

    /// Deserialize a JSON or text body into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        match self {
            Body::Json(value) => Ok(serde_json::from_value(value.clone())?),
            Body::Text(text) => Ok(serde_json::from_str(text)?),
            Body::Batch(_) => Err(anyhow::anyhow!("cannot deserialize a batch body as a single value")),
        }
    }
}

/// A parser object for `BodyParser::Delegating`
pub trait ParseBody: Send + Sync {
    fn parse(&self, raw: &str) -> anyhow::Result<Body>;
}

pub type CustomParser = Arc<dyn Fn(&ReceivedMessage) -> anyhow::Result<Body> + Send + Sync>;

/// How a worker wants its message bodies parsed
#[derive(Clone, Default)]
pub enum BodyParser {
    Json,
    #[default]
    Text,
    Custom(CustomParser),
    Delegating(Arc<dyn ParseBody>),
}

impl fmt::Debug for BodyParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyParser::Json => f.write_str("Json"),
            BodyParser::Text => f.write_str("Text"),
            BodyParser::Custom(_) => f.write_str("Custom"),
            BodyParser::Delegating(_) => f.write_str("Delegating"),
        }
    }
}

impl BodyParser {
    pub fn custom<F>(parse: F) -> Self
    where
        F: Fn(&ReceivedMessage) -> anyhow::Result<Body> + Send + Sync + 'static,
    {
        BodyParser::Custom(Arc::new(parse))
    }

    pub fn parse_message(&self, message: &ReceivedMessage) -> Result<Body, DispatchError> {
        let parsed = match self {
            BodyParser::Text => return Ok(Body::Text(message.body.clone())),
            BodyParser::Json => serde_json::from_str(&message.body)
                .map(Body::Json)
                .map_err(anyhow::Error::from),
            BodyParser::Custom(parse) => parse(message),
            BodyParser::Delegating(parser) => parser.parse(&message.body),
        };
        parsed.map_err(|e| DispatchError::BodyParse(format!("message {}: {:#}", message.message_id, e)))
    }

    pub fn parse(&self, payload: &Payload) -> Result<Body, DispatchError> {
        match payload {
            Payload::Single(message) => self.parse_message(message),
            Payload::Batch(messages) => messages
                .iter()
                .map(|m| self.parse_message(m))
                .collect::<Result<Vec<_>, _>>()
                .map(Body::Batch),
        }
    }
}

/// Retry backoff schedule, in seconds
#[derive(Clone)]
pub enum RetryIntervals {
    List(Vec<u64>),
    Computed(Arc<dyn Fn(u32) -> Option<u64> + Send + Sync>),
}

impl fmt::Debug for RetryIntervals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryIntervals::List(list) => f.debug_tuple("List").field(list).finish(),
            RetryIntervals::Computed(_) => f.write_str("Computed"),
        }
    }
}

impl RetryIntervals {
    pub fn computed<F>(compute: F) -> Self
    where
        F: Fn(u32) -> Option<u64> + Send + Sync + 'static,
    {
        RetryIntervals::Computed(Arc::new(compute))
    }

    /// Interval for the given receive count. List indexes are
    /// `receive_count - 1`, clamped to the last entry.
    pub fn interval_for(&self, receive_count: u32) -> Option<u64> {
        match self {
            RetryIntervals::List(list) => {
                let last = list.len().checked_sub(1)?;
                let index = (receive_count.max(1) as usize - 1).min(last);
                list.get(index).copied()
            }
            RetryIntervals::Computed(compute) => compute(receive_count),
        }
    }
}

/// An error type matched anywhere in an error's cause chain
#[derive(Clone, Copy)]
pub struct ErrorKind {
    name: &'static str,
    matcher: fn(&anyhow::Error) -> bool,
}

fn chain_contains<E>(error: &anyhow::Error) -> bool
where
    E: std::error::Error + Send + Sync + 'static,
{
    error.chain().any(|cause| cause.is::<E>())
}

impl ErrorKind {
    pub fn of<E>() -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            name: std::any::type_name::<E>(),
            matcher: chain_contains::<E>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn matches(&self, error: &anyhow::Error) -> bool {
        (self.matcher)(error)
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Errors that must never be retried
#[derive(Clone)]
pub enum NonRetryable {
    Kinds(Vec<ErrorKind>),
    Predicate(Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>),
}

impl fmt::Debug for NonRetryable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NonRetryable::Kinds(kinds) => f.debug_tuple("Kinds").field(kinds).finish(),
            NonRetryable::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

impl NonRetryable {
    pub fn predicate<F>(predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        NonRetryable::Predicate(Arc::new(predicate))
    }

    pub fn matches(&self, error: &anyhow::Error) -> bool {
        match self {
            NonRetryable::Kinds(kinds) => kinds.iter().any(|kind| kind.matches(error)),
            NonRetryable::Predicate(predicate) => predicate(error),
        }
    }
}

/// Options declared by a worker
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue: String,
    /// Receive up to 10 messages and perform them as one batch
    pub batch: bool,
    /// Delete the message(s) after a successful perform
    pub auto_delete: bool,
    /// Keep the message invisible while perform runs
    pub auto_visibility_timeout: bool,
    pub retry_intervals: Option<RetryIntervals>,
    pub non_retryable: Option<NonRetryable>,
    pub body_parser: BodyParser,
}

impl WorkerOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            batch: false,
            auto_delete: false,
            auto_visibility_timeout: false,
            retry_intervals: None,
            non_retryable: None,
            body_parser: BodyParser::default(),
        }
    }

    pub fn batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn auto_visibility_timeout(mut self, enabled: bool) -> Self {
        self.auto_visibility_timeout = enabled;
        self
    }

    pub fn retry_intervals(mut self, intervals: RetryIntervals) -> Self {
        self.retry_intervals = Some(intervals);
        self
    }

    pub fn non_retryable(mut self, non_retryable: NonRetryable) -> Self {
        self.non_retryable = Some(non_retryable);
        self
    }

    pub fn body_parser(mut self, parser: BodyParser) -> Self {
        self.body_parser = parser;
        self
    }
}

type WorkerFactory = Arc<dyn Fn() -> Arc<dyn Worker> + Send + Sync>;

/// A registered worker type: its name, options and a factory producing a
/// fresh instance per message.
#[derive(Clone)]
pub struct WorkerDefinition {
    name: String,
    options: WorkerOptions,
    dispatcher: bool,
    factory: WorkerFactory,
}

impl fmt::Debug for WorkerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDefinition")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

impl WorkerDefinition {
    pub fn new<W, F>(name: impl Into<String>, options: WorkerOptions, factory: F) -> Self
    where
        W: Worker + 'static,
        F: Fn() -> W + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            options,
            dispatcher: false,
            factory: Arc::new(move || Arc::new(factory()) as Arc<dyn Worker>),
        }
    }

    /// Register a body-only worker; the adapter is applied here, once.
    pub fn from_body_worker<W, F>(name: impl Into<String>, options: WorkerOptions, factory: F) -> Self
    where
        W: BodyWorker + 'static,
        F: Fn() -> W + Send + Sync + 'static,
    {
        Self::new(name, options, move || BodyOnly(factory()))
    }

    /// Mark as a dispatcher: a worker that routes messages to other handlers
    /// and takes precedence over plain workers on its queue.
    pub fn dispatcher(mut self) -> Self {
        self.dispatcher = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn queue(&self) -> &str {
        &self.options.queue
    }

    pub fn is_dispatcher(&self) -> bool {
        self.dispatcher
    }

    pub fn instantiate(&self) -> Arc<dyn Worker> {
        (self.factory)()
    }
}

/// A worker instance resolved for one message or batch
#[derive(Clone)]
pub struct ResolvedWorker {
    pub definition: Arc<WorkerDefinition>,
    pub instance: Arc<dyn Worker>,
}

impl ResolvedWorker {
    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn options(&self) -> &WorkerOptions {
        self.definition.options()
    }
}
