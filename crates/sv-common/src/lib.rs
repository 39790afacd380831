use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub mod logging;

/// Message attribute carrying an explicit worker name, overriding the queue's worker.
pub const WORKER_CLASS_ATTRIBUTE: &str = "shoryuken_class";

/// SQS returns at most 10 messages per receive call.
pub const MAX_BATCH_SIZE: usize = 10;

/// SQS refuses visibility timeouts above 12 hours.
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: u32 = 43_200;

/// SQS refuses per-message delays above 15 minutes.
pub const MAX_DELAY_SECONDS: u32 = 900;

pub const DEFAULT_GROUP: &str = "default";

/// Longest pause a polling strategy applies to a queue, in seconds.
pub const MAX_PAUSE_SECONDS: f64 = 86_400.0;

/// Fractional seconds as a pause duration, bounded to `0..=MAX_PAUSE_SECONDS`.
/// NaN maps to zero.
pub fn pause_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.clamp(0.0, MAX_PAUSE_SECONDS)).unwrap_or_default()
}

pub mod attributes {
    pub const APPROXIMATE_RECEIVE_COUNT: &str = "ApproximateReceiveCount";
    pub const SENT_TIMESTAMP: &str = "SentTimestamp";
    pub const MESSAGE_GROUP_ID: &str = "MessageGroupId";
    pub const MESSAGE_DEDUPLICATION_ID: &str = "MessageDeduplicationId";
}

// ============================================================================
// Messages
// ============================================================================

/// A typed message attribute (SQS `MessageAttributeValue`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAttributeValue {
    pub data_type: String,
    pub string_value: Option<String>,
}

impl MessageAttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            data_type: "String".to_string(),
            string_value: Some(value.into()),
        }
    }
}

/// A message received from a queue, still owned by the backend until deleted.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    /// System attributes (ApproximateReceiveCount, SentTimestamp, MessageGroupId, ...)
    pub attributes: HashMap<String, String>,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    pub receipt_handle: String,
    pub queue_name: String,
}

impl ReceivedMessage {
    /// How many times the backend has handed out this message.
    /// A missing or malformed attribute counts as the first receive.
    pub fn receive_count(&self) -> u32 {
        self.attributes
            .get(attributes::APPROXIMATE_RECEIVE_COUNT)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1)
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.attributes
            .get(attributes::SENT_TIMESTAMP)
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
    }

    pub fn message_group_id(&self) -> Option<&str> {
        self.attributes
            .get(attributes::MESSAGE_GROUP_ID)
            .map(String::as_str)
    }

    /// Worker name from the explicit override attribute, if it is a string attribute.
    pub fn worker_class(&self) -> Option<&str> {
        self.message_attributes
            .get(WORKER_CLASS_ATTRIBUTE)
            .filter(|attr| attr.data_type.starts_with("String"))
            .and_then(|attr| attr.string_value.as_deref())
    }
}

/// One unit of work: a single message, or a batch for batch workers.
#[derive(Debug, Clone)]
pub enum Payload {
    Single(ReceivedMessage),
    Batch(Vec<ReceivedMessage>),
}

impl Payload {
    pub fn messages(&self) -> &[ReceivedMessage] {
        match self {
            Payload::Single(message) => std::slice::from_ref(message),
            Payload::Batch(messages) => messages,
        }
    }

    pub fn single(&self) -> Option<&ReceivedMessage> {
        match self {
            Payload::Single(message) => Some(message),
            Payload::Batch(_) => None,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Payload::Batch(_))
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }

    /// Comma separated message ids, for log fields.
    pub fn ids(&self) -> String {
        self.messages()
            .iter()
            .map(|m| m.message_id.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A message about to be sent to a queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingMessage {
    pub body: String,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    pub delay_seconds: Option<u32>,
    pub message_group_id: Option<String>,
    pub message_deduplication_id: Option<String>,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: MessageAttributeValue) -> Self {
        self.message_attributes.insert(name.into(), value);
        self
    }

    pub fn with_delay(mut self, seconds: u32) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.message_group_id = Some(group_id.into());
        self
    }
}

/// Queue attributes the dispatch core cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAttributes {
    pub visibility_timeout: u32,
    pub fifo: bool,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        // SQS default visibility timeout
        Self {
            visibility_timeout: 30,
            fifo: false,
        }
    }
}

// ============================================================================
// Queue configuration
// ============================================================================

/// A queue reference handed out by polling strategies.
///
/// Two configurations without options are equal when their names are, so a
/// plain queue name and `QueueConfiguration::new(name)` are interchangeable.
#[derive(Debug, Clone)]
pub struct QueueConfiguration {
    pub name: String,
    pub options: BTreeMap<String, serde_json::Value>,
}

impl QueueConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_options(name: impl Into<String>, options: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }

    pub fn option_i64(&self, key: &str) -> Option<i64> {
        self.options.get(key).and_then(|v| v.as_i64())
    }
}

impl PartialEq for QueueConfiguration {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.options == other.options
    }
}

impl Eq for QueueConfiguration {}

impl PartialEq<str> for QueueConfiguration {
    fn eq(&self, other: &str) -> bool {
        self.options.is_empty() && self.name == other
    }
}

impl PartialEq<&str> for QueueConfiguration {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

impl Hash for QueueConfiguration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for QueueConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Error)]
#[error("unknown polling strategy: {0}")]
pub struct UnknownPollingStrategy(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PollingStrategyKind {
    #[default]
    WeightedRoundRobin,
    StrictPriority,
}

impl FromStr for PollingStrategyKind {
    type Err = UnknownPollingStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WeightedRoundRobin" | "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            "StrictPriority" | "strict_priority" => Ok(Self::StrictPriority),
            other => Err(UnknownPollingStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for PollingStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WeightedRoundRobin => f.write_str("WeightedRoundRobin"),
            Self::StrictPriority => f.write_str("StrictPriority"),
        }
    }
}

/// A set of queues sharing one concurrency budget and one polling strategy.
///
/// `queues` repeats each name `weight` times; the repetition is the weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub name: String,
    pub concurrency: usize,
    /// Seconds an empty queue stays paused
    pub delay: f64,
    /// StrictPriority throughput shaping: seconds paused per message found
    pub interval: f64,
    pub polling_strategy: PollingStrategyKind,
    pub queues: Vec<String>,
    pub queue_options: HashMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Group {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
            delay: 0.0,
            interval: 0.0,
            polling_strategy: PollingStrategyKind::default(),
            queues: Vec::new(),
            queue_options: HashMap::new(),
        }
    }

    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_interval(mut self, interval: f64) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_strategy(mut self, kind: PollingStrategyKind) -> Self {
        self.polling_strategy = kind;
        self
    }

    pub fn with_queue(mut self, name: &str, weight: usize) -> Self {
        self.add_queue(name, weight);
        self
    }

    pub fn add_queue(&mut self, name: &str, weight: usize) {
        for _ in 0..weight {
            self.queues.push(name.to_string());
        }
    }

    /// Distinct queue names in first-seen order.
    pub fn unique_queues(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for queue in &self.queues {
            if !seen.contains(queue) {
                seen.push(queue.clone());
            }
        }
        seen
    }

    pub fn weight_of(&self, queue: &str) -> usize {
        self.queues.iter().filter(|q| q.as_str() == queue).count()
    }

    pub fn queue_configuration(&self, queue: &str) -> QueueConfiguration {
        match self.queue_options.get(queue) {
            Some(options) => QueueConfiguration::with_options(queue, options.clone()),
            None => QueueConfiguration::new(queue),
        }
    }

    pub fn delay_duration(&self) -> Duration {
        pause_duration(self.delay)
    }
}
