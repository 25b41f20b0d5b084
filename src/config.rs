//! Configuration: YAML file plus environment variable overrides.
//!
//! Same two-phase load as the teacher's `Config::load`: try a YAML file,
//! fall back to defaults, then let environment variables win. Field names
//! here mirror the environment variables spec.md §6 names exactly.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::coordinator::MailboxOverflowPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker_url: String,
    pub event_store_url: Option<String>,
    pub event_store_key: Option<String>,
    pub org_id: Option<String>,
    pub agent_ids: Vec<String>,
    pub worker: WorkerSettings,
    pub coordinator: CoordinatorSettings,
    pub promotion_interval_ms: u64,
    pub poison_threshold: u32,
    pub metrics_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "amqp://127.0.0.1:5672/%2f".to_string(),
            event_store_url: None,
            event_store_key: None,
            org_id: None,
            agent_ids: Vec::new(),
            worker: WorkerSettings::default(),
            coordinator: CoordinatorSettings::default(),
            promotion_interval_ms: 5_000,
            poison_threshold: 3,
            metrics_port: 9464,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub prefetch: u16,
    pub concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            prefetch: 32,
            concurrency: 16,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub mailbox_capacity: usize,
    pub mailbox_overflow_policy: MailboxOverflowPolicy,
    pub liveness_timeout_ms: u64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            mailbox_overflow_policy: MailboxOverflowPolicy::Block,
            liveness_timeout_ms: 120_000,
        }
    }
}

impl Config {
    /// Load from `AGENTQUEUE_CONFIG` (default `config.yaml`) if present,
    /// then apply environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("AGENTQUEUE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BROKER_URL") {
            self.broker_url = url;
        }
        if let Ok(url) = std::env::var("EVENT_STORE_URL") {
            self.event_store_url = Some(url);
        }
        if let Ok(key) = std::env::var("EVENT_STORE_KEY") {
            self.event_store_key = Some(key);
        }
        if let Ok(org_id) = std::env::var("ORG_ID") {
            self.org_id = Some(org_id);
        }
        if let Ok(agent_ids) = std::env::var("AGENT_IDS") {
            self.agent_ids = agent_ids.split(',').map(str::trim).map(str::to_string).collect();
        } else if let Ok(agent_id) = std::env::var("AGENT_ID") {
            self.agent_ids = vec![agent_id];
        }
        if let Ok(prefetch) = std::env::var("WORKER_PREFETCH") {
            if let Ok(p) = prefetch.parse() {
                self.worker.prefetch = p;
            }
        }
        if let Ok(concurrency) = std::env::var("WORKER_CONCURRENCY") {
            if let Ok(c) = concurrency.parse() {
                self.worker.concurrency = c;
            }
        }
        if let Ok(capacity) = std::env::var("MAILBOX_CAPACITY") {
            if let Ok(c) = capacity.parse() {
                self.coordinator.mailbox_capacity = c;
            }
        }
        if let Ok(policy) = std::env::var("MAILBOX_OVERFLOW_POLICY") {
            match policy.as_str() {
                "block" => self.coordinator.mailbox_overflow_policy = MailboxOverflowPolicy::Block,
                "drop_oldest_non_p0" => {
                    self.coordinator.mailbox_overflow_policy = MailboxOverflowPolicy::DropOldestNonP0
                }
                other => warn!(policy = other, "unrecognized MAILBOX_OVERFLOW_POLICY, keeping default"),
            }
        }
        if let Ok(timeout) = std::env::var("AGENT_LIVENESS_TIMEOUT_MS") {
            if let Ok(t) = timeout.parse() {
                self.coordinator.liveness_timeout_ms = t;
            }
        }
        if let Ok(interval) = std::env::var("PROMOTION_INTERVAL_MS") {
            if let Ok(i) = interval.parse() {
                self.promotion_interval_ms = i;
            }
        }
        if let Ok(threshold) = std::env::var("POISON_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                self.poison_threshold = t;
            }
        }
        if let Ok(port) = std::env::var("METRICS_PORT") {
            if let Ok(p) = port.parse() {
                self.metrics_port = p;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    FileRead(String, String),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Initialize `tracing` with an `EnvFilter` driven by `AGENTQUEUE_LOG`,
/// defaulting to `info`, matching the teacher's `init_tracing`.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env("AGENTQUEUE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}
