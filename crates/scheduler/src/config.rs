//! Scheduler configuration.
//!
//! Concurrency budget, circuit-breaker threshold and transfer timeout for the
//! download queue. Configuration can be loaded from a file, environment
//! variables, or created programmatically.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default number of simultaneously active transfers.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default number of primary-transport failures that trips the breaker.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Configuration for the download queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of Active requests
    pub concurrency: usize,
    /// Primary-transport failures before every request switches to the fallback
    pub failure_threshold: u32,
    /// Per-attempt timeout; `None` lets a slow transfer hold its slot indefinitely
    pub transfer_timeout: Option<Duration>,
    /// User agent sent by the HTTP transports
    pub user_agent: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            transfer_timeout: Some(Duration::from_secs(30)),
            user_agent: format!("pageview/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SchedulerConfig {
    /// Sets the concurrency budget. Values below one are raised to one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the breaker threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Sets or clears the per-attempt timeout.
    pub fn with_transfer_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Sets the user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PAGEVIEW_CONCURRENCY`: active transfer budget (default: 5)
    /// - `PAGEVIEW_FAILURE_THRESHOLD`: breaker threshold (default: 5)
    /// - `PAGEVIEW_TRANSFER_TIMEOUT_MS`: per-attempt timeout, `0` disables (default: 30000)
    /// - `PAGEVIEW_USER_AGENT`: user agent string
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PAGEVIEW_CONCURRENCY") {
            config.concurrency = parse_concurrency("PAGEVIEW_CONCURRENCY", &val)?;
        }

        if let Ok(val) = std::env::var("PAGEVIEW_FAILURE_THRESHOLD") {
            config.failure_threshold = val.parse::<u32>().map_err(|_| {
                ConfigError::InvalidValue("PAGEVIEW_FAILURE_THRESHOLD".to_string())
            })?;
        }

        if let Ok(val) = std::env::var("PAGEVIEW_TRANSFER_TIMEOUT_MS") {
            config.transfer_timeout = parse_timeout("PAGEVIEW_TRANSFER_TIMEOUT_MS", &val)?;
        }

        if let Ok(val) = std::env::var("PAGEVIEW_USER_AGENT") {
            config.user_agent = val;
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// concurrency = 5
    /// failure_threshold = 5
    /// transfer_timeout_ms = 30000
    /// user_agent = "pageview"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;

        Self::from_toml(&contents)
    }

    fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in toml_str.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"');

                match key {
                    "concurrency" => config.concurrency = parse_concurrency(key, value)?,
                    "failure_threshold" => {
                        config.failure_threshold = value
                            .parse::<u32>()
                            .map_err(|_| ConfigError::InvalidValue(key.to_string()))?;
                    }
                    "transfer_timeout_ms" => config.transfer_timeout = parse_timeout(key, value)?,
                    "user_agent" => config.user_agent = value.to_string(),
                    _ => {}
                }
            }
        }

        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml())?;
        Ok(())
    }

    fn to_toml(&self) -> String {
        let timeout_ms = self
            .transfer_timeout
            .map(|timeout| timeout.as_millis())
            .unwrap_or(0);

        format!(
            "# PageView scheduler configuration\n\
             concurrency = {}\n\
             failure_threshold = {}\n\
             transfer_timeout_ms = {}\n\
             user_agent = \"{}\"\n",
            self.concurrency, self.failure_threshold, timeout_ms, self.user_agent
        )
    }
}

fn parse_concurrency(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(concurrency) if concurrency > 0 => Ok(concurrency),
        _ => Err(ConfigError::InvalidValue(key.to_string())),
    }
}

fn parse_timeout(key: &str, value: &str) -> Result<Option<Duration>, ConfigError> {
    let millis = value
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue(key.to_string()))?;

    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}
