//! Configuration module for uptrail.
//!
//! Settings come from an optional YAML file and are then overridden by
//! environment variables, falling back to sensible defaults.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("no endpoints configured to monitor")]
    NoEndpoints,
}

/// Which event channel implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// In-process queues; only usable when every component shares a process.
    #[default]
    Memory,
    Nats,
}

impl FromStr for BrokerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "nats" => Ok(Self::Nats),
            other => Err(ConfigError::Invalid(format!("unknown broker kind: {}", other))),
        }
    }
}

/// Event channel settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    /// Broker address (ignored by the memory broker).
    pub address: String,
    /// Topic carrying raw observations from the agent to the aggregator.
    pub observations_topic: String,
    /// Topic carrying aggregated snapshots to the presenter.
    pub summaries_topic: String,
    pub prefetch: usize,
    /// Per-topic buffer of the memory broker.
    pub capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            address: "nats://127.0.0.1:4222".to_string(),
            observations_topic: "urlstatus".to_string(),
            summaries_topic: "stats".to_string(),
            prefetch: 1,
            capacity: 1024,
        }
    }
}

/// Live feed settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenterConfig {
    pub listen_addr: String,
    /// Summaries a subscriber may fall behind before the oldest are dropped.
    pub subscriber_buffer: usize,
    pub write_timeout_ms: u64,
}

impl Default for PresenterConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:17657".to_string(),
            subscriber_buffer: 64,
            write_timeout_ms: 5000,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoints: Vec<String>,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub window_size: usize,
    /// Upper bound of the random delay before each probe (0 disables it).
    pub jitter_ms: u64,
    pub broker: BrokerConfig,
    pub presenter: PresenterConfig,
    pub shutdown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            interval_ms: 5000,
            timeout_ms: 5000,
            window_size: 120,
            jitter_ms: 0,
            broker: BrokerConfig::default(),
            presenter: PresenterConfig::default(),
            shutdown_grace_ms: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from an optional YAML file, then the environment.
    ///
    /// Environment variables (all optional):
    /// - `UPTRAIL_URLS`: comma-separated endpoints
    /// - `UPTRAIL_INTERVAL_MS`, `UPTRAIL_TIMEOUT_MS`, `UPTRAIL_WINDOW_SIZE`, `UPTRAIL_JITTER_MS`
    /// - `UPTRAIL_BROKER` (`memory` or `nats`), `UPTRAIL_BROKER_ADDR`
    /// - `UPTRAIL_OBSERVATIONS_TOPIC`, `UPTRAIL_SUMMARIES_TOPIC`
    /// - `UPTRAIL_LISTEN_ADDR`, `UPTRAIL_SHUTDOWN_GRACE_MS`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        cfg.apply_vars(|key| env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply `UPTRAIL_*` overrides using `lookup` as the variable source.
    fn apply_vars<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(urls) = lookup("UPTRAIL_URLS") {
            self.endpoints = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
        }

        parse_var(&lookup, "UPTRAIL_INTERVAL_MS", &mut self.interval_ms);
        parse_var(&lookup, "UPTRAIL_TIMEOUT_MS", &mut self.timeout_ms);
        parse_var(&lookup, "UPTRAIL_WINDOW_SIZE", &mut self.window_size);
        parse_var(&lookup, "UPTRAIL_JITTER_MS", &mut self.jitter_ms);
        parse_var(&lookup, "UPTRAIL_BROKER", &mut self.broker.kind);
        parse_var(&lookup, "UPTRAIL_SHUTDOWN_GRACE_MS", &mut self.shutdown_grace_ms);

        if let Some(addr) = lookup("UPTRAIL_BROKER_ADDR") {
            self.broker.address = addr;
        }
        if let Some(topic) = lookup("UPTRAIL_OBSERVATIONS_TOPIC") {
            self.broker.observations_topic = topic;
        }
        if let Some(topic) = lookup("UPTRAIL_SUMMARIES_TOPIC") {
            self.broker.summaries_topic = topic;
        }
        if let Some(addr) = lookup("UPTRAIL_LISTEN_ADDR") {
            self.presenter.listen_addr = addr;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::Invalid("interval_ms must be positive".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".to_string()));
        }
        if self.window_size == 0 {
            return Err(ConfigError::Invalid("window_size must be positive".to_string()));
        }
        if self.broker.observations_topic.is_empty() || self.broker.summaries_topic.is_empty() {
            return Err(ConfigError::Invalid("broker topics cannot be empty".to_string()));
        }
        if self.broker.capacity == 0 || self.presenter.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be positive".to_string()));
        }
        Ok(())
    }

    /// Fails unless at least one endpoint is configured.
    pub fn require_endpoints(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl PresenterConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => tracing::warn!("Ignoring unparseable {}={:?}", key, raw),
        }
    }
}
