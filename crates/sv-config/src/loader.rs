//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "stevedore.toml",
    "config.toml",
    "./config/stevedore.toml",
    "./config/config.toml",
    "/etc/stevedore/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|_| {})
    }

    /// Like `load`, with `customize` applied after the environment and
    /// before validation (command line flags go here).
    pub fn load_with<F>(&self, customize: F) -> Result<AppConfig, ConfigError>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file()? {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok())?;
        customize(&mut config);
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use. An explicit path that does not
    /// exist is an error; the search paths are optional.
    fn find_config_file(&self) -> Result<Option<PathBuf>, ConfigError> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Ok(Some(path.clone()));
            }
            return Err(ConfigError::ValidationError(format!(
                "config file {} does not exist",
                path.display()
            )));
        }

        if let Ok(path) = env::var("STEVEDORE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
            warn!(?path, "STEVEDORE_CONFIG points at a missing file, searching standard paths");
        }

        Ok(CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `STEVEDORE_*` overrides read through `lookup`.
pub(crate) fn apply_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("STEVEDORE_CONCURRENCY") {
        config.concurrency = parse_value("STEVEDORE_CONCURRENCY", &val)?;
    }
    if let Some(val) = lookup("STEVEDORE_DELAY") {
        config.delay = parse_value("STEVEDORE_DELAY", &val)?;
    }
    if let Some(val) = lookup("STEVEDORE_TIMEOUT") {
        config.timeout = parse_value("STEVEDORE_TIMEOUT", &val)?;
    }
    if let Some(val) = lookup("STEVEDORE_POLLING_STRATEGY") {
        config.polling_strategy = val;
    }
    if let Some(val) = lookup("STEVEDORE_RAISE_ERRORS") {
        config.raise_errors = val == "true" || val == "1";
    }

    // SQS
    if let Some(val) = lookup("STEVEDORE_AWS_REGION") {
        config.sqs.region = val;
    }
    if let Some(val) = lookup("STEVEDORE_SQS_ENDPOINT") {
        config.sqs.endpoint_url = val;
    }

    Ok(())
}

fn parse_value<T: std::str::FromStr>(key: &str, val: &str) -> Result<T, ConfigError> {
    val.trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} has an invalid value: {val}")))
}
