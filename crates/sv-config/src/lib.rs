//! Stevedore Configuration System
//!
//! TOML configuration with environment variable overrides. The root table
//! describes the `default` group; `[groups.<name>]` tables add more groups.
//!
//! ```toml
//! concurrency = 25
//! queues = ["default", { name = "high", weight = 3 }, ["low", 1]]
//!
//! [groups.fifo]
//! concurrency = 1
//! queues = ["orders.fifo"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

use sv_common::{Group, PollingStrategyKind, UnknownPollingStrategy, DEFAULT_GROUP, MAX_PAUSE_SECONDS};

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error(transparent)]
    PollingStrategy(#[from] UnknownPollingStrategy),

    #[error("No queues configured")]
    MissingQueues,

    #[error("Group {0} has zero concurrency")]
    ZeroConcurrency(String),
}

/// A queue entry: `"name"`, `["name", weight]` or `{ name = "...", weight = n }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueEntry {
    Name(String),
    Pair(String, usize),
    Weighted {
        name: String,
        #[serde(default = "default_weight")]
        weight: usize,
    },
}

fn default_weight() -> usize {
    1
}

impl QueueEntry {
    pub fn name(&self) -> &str {
        match self {
            QueueEntry::Name(name) => name,
            QueueEntry::Pair(name, _) => name,
            QueueEntry::Weighted { name, .. } => name,
        }
    }

    pub fn weight(&self) -> usize {
        match self {
            QueueEntry::Name(_) => 1,
            QueueEntry::Pair(_, weight) => *weight,
            QueueEntry::Weighted { weight, .. } => *weight,
        }
    }
}

/// Per-group settings; unset fields inherit from the root table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    pub concurrency: Option<usize>,
    pub delay: Option<f64>,
    pub interval: Option<f64>,
    pub polling_strategy: Option<String>,
    pub queues: Vec<QueueEntry>,
}

/// SQS client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqsConfig {
    /// AWS region; the default credential chain decides when empty
    pub region: String,
    /// Custom endpoint (LocalStack, ElasticMQ)
    pub endpoint_url: String,
    /// Long poll wait time, 0..=20
    pub wait_time_seconds: i32,
}

impl Default for SqsConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            endpoint_url: String::new(),
            wait_time_seconds: 5,
        }
    }
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Processors of the default group
    pub concurrency: usize,
    /// Seconds an empty queue stays paused
    pub delay: f64,
    /// StrictPriority seconds paused per message found
    pub interval: f64,
    /// Hard shutdown timeout in seconds
    pub timeout: u64,
    pub polling_strategy: String,
    pub queues: Vec<QueueEntry>,
    pub groups: BTreeMap<String, GroupConfig>,
    /// Per-queue receive options (`wait_time_seconds`, `visibility_timeout`)
    pub queue_options: HashMap<String, BTreeMap<String, serde_json::Value>>,
    /// Cache queue attributes instead of fetching them per message
    pub cache_visibility_timeout: bool,
    /// Surface fetch errors to the manager instead of treating them as empty receives
    pub raise_errors: bool,
    pub sqs: SqsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            concurrency: 25,
            delay: 0.0,
            interval: 0.0,
            timeout: 8,
            polling_strategy: PollingStrategyKind::default().to_string(),
            queues: Vec::new(),
            groups: BTreeMap::new(),
            queue_options: HashMap::new(),
            cache_visibility_timeout: false,
            raise_errors: false,
            sqs: SqsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Expand the configuration into validated groups, `default` first.
    pub fn groups(&self) -> Result<Vec<Group>, ConfigError> {
        let root_strategy: PollingStrategyKind = self.polling_strategy.parse()?;
        let mut groups = Vec::new();

        if !self.queues.is_empty() {
            let group = self.build_group(DEFAULT_GROUP, self.concurrency, self.delay, self.interval, root_strategy, &self.queues)?;
            groups.push(group);
        }

        for (name, cfg) in &self.groups {
            let strategy: PollingStrategyKind = match &cfg.polling_strategy {
                Some(s) => s.parse()?,
                None => root_strategy,
            };
            let group = self.build_group(
                name,
                cfg.concurrency.unwrap_or(self.concurrency),
                cfg.delay.unwrap_or(self.delay),
                cfg.interval.unwrap_or(self.interval),
                strategy,
                &cfg.queues,
            )?;
            groups.push(group);
        }

        if groups.is_empty() {
            return Err(ConfigError::MissingQueues);
        }

        let mut owner: HashMap<&str, &str> = HashMap::new();
        for group in &groups {
            for queue in &group.queues {
                if let Some(other) = owner.insert(queue.as_str(), group.name.as_str()) {
                    if other != group.name.as_str() {
                        return Err(ConfigError::ValidationError(format!(
                            "queue {} is configured in groups {} and {}",
                            queue, other, group.name
                        )));
                    }
                }
            }
        }

        Ok(groups)
    }

    fn build_group(
        &self,
        name: &str,
        concurrency: usize,
        delay: f64,
        interval: f64,
        strategy: PollingStrategyKind,
        queues: &[QueueEntry],
    ) -> Result<Group, ConfigError> {
        if concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency(name.to_string()));
        }
        if queues.is_empty() {
            return Err(ConfigError::ValidationError(format!("group {name} has no queues")));
        }
        for (field, value) in [("delay", delay), ("interval", interval)] {
            if !(0.0..=MAX_PAUSE_SECONDS).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "group {name} {field} must be within 0..={MAX_PAUSE_SECONDS} seconds, got {value}"
                )));
            }
        }

        let mut group = Group::new(name, concurrency)
            .with_delay(delay)
            .with_interval(interval)
            .with_strategy(strategy);
        for entry in queues {
            if entry.name().is_empty() {
                return Err(ConfigError::ValidationError(format!("group {name} has an unnamed queue")));
            }
            if entry.weight() == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "queue {} in group {} has zero weight",
                    entry.name(),
                    name
                )));
            }
            group.add_queue(entry.name(), entry.weight());
            if let Some(options) = self.queue_options.get(entry.name()) {
                group.queue_options.insert(entry.name().to_string(), options.clone());
            }
        }
        Ok(group)
    }

    /// Validate without keeping the expansion
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0..=20).contains(&self.sqs.wait_time_seconds) {
            return Err(ConfigError::ValidationError(format!(
                "sqs.wait_time_seconds must be within 0..=20, got {}",
                self.sqs.wait_time_seconds
            )));
        }
        self.groups().map(|_| ())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Stevedore Configuration
# Environment variables (STEVEDORE_*) override these settings

concurrency = 25
delay = 0.0
timeout = 8
polling_strategy = "WeightedRoundRobin"  # WeightedRoundRobin or StrictPriority
queues = ["default", { name = "high", weight = 3 }]
cache_visibility_timeout = false
raise_errors = false

[queue_options.high]
wait_time_seconds = 10

[groups.fifo]
concurrency = 1
polling_strategy = "StrictPriority"
queues = ["orders.fifo"]

[sqs]
region = "us-east-1"
endpoint_url = ""  # e.g. http://localhost:4566 for LocalStack
wait_time_seconds = 5
"#
        .to_string()
    }
}
