//! Node configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RPCQ_CONFIG)
//! 3. Environment variables

use crate::DEFAULT_SEND_QUEUE_CAPACITY;
use rpcq_core::{ProcessorConfig, DEFAULT_BATCH_THRESHOLD, SERVER_PEER_ID};
use rpcq_history::{HistoryConfig, DEFAULT_HISTORY_DEPTH, MAX_HISTORY_DEPTH};
use rpcq_protocol::{
    PeerId, DEFAULT_MAX_CLIENTS, LENGTH_PREFIX_SIZE, MAX_ITEM_PAYLOAD, MESSAGE_HEADER_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// RPC queue configuration.
    pub queue: QueueConfig,
    /// Transport adapter configuration.
    pub transport: TransportConfig,
    /// Internal message configuration.
    pub internal: InternalConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RPCQ_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.queue.apply_env_overrides();
        self.transport.apply_env_overrides();
        self.internal.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Checks the conditions a node cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.transport.validate()?;
        self.internal.validate()?;
        self.metrics.validate()?;

        let largest = self.largest_reliable_message();
        let limit = self.transport.max_receive_message();
        if largest > limit {
            return Err(ConfigError::ValidationError(format!(
                "transport.max_receive_message {} is below the largest reliable message {} \
                 (queue.batch_threshold_bytes {})",
                limit, largest, self.queue.batch_threshold_bytes
            )));
        }
        Ok(())
    }

    /// Largest single message a peer with this config can put on a
    /// reliable stream. A batch flushes once it reaches the threshold, so it
    /// can overshoot by one full record.
    pub fn largest_reliable_message(&self) -> usize {
        let message = MESSAGE_HEADER_SIZE + MAX_ITEM_PAYLOAD;
        if self.queue.batching_enabled {
            self.queue.batch_threshold_bytes + LENGTH_PREFIX_SIZE + message
        } else {
            message
        }
    }

    /// Builds the queue processor configuration for the node `local_peer`.
    pub fn processor_config(&self, local_peer: PeerId) -> ProcessorConfig {
        ProcessorConfig::new()
            .with_history(
                HistoryConfig::new(self.queue.history_depth)
                    .with_max_clients(self.queue.max_clients),
            )
            .with_batching(self.queue.batching_enabled)
            .with_batch_threshold(self.queue.batch_threshold_bytes)
            .with_internal_lifetime(self.internal.message_lifetime())
            .with_local_peer(local_peer)
            .with_server_peer(self.queue.server_peer_id)
    }
}

/// RPC queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Frame history depth. The table holds two more slots than this.
    pub history_depth: usize,
    /// Largest target list an item may carry.
    pub max_clients: usize,
    /// Coalesce outbound messages per peer and channel.
    pub batching_enabled: bool,
    /// Batch size that triggers an early flush, in bytes.
    pub batch_threshold_bytes: usize,
    /// Peer id of the server.
    pub server_peer_id: PeerId,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            history_depth: DEFAULT_HISTORY_DEPTH,
            max_clients: DEFAULT_MAX_CLIENTS,
            batching_enabled: true,
            batch_threshold_bytes: DEFAULT_BATCH_THRESHOLD,
            server_peer_id: SERVER_PEER_ID,
        }
    }
}

impl QueueConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(depth) = std::env::var("RPCQ_HISTORY_DEPTH") {
            if let Ok(n) = depth.parse() {
                self.history_depth = n;
            }
        }

        if let Ok(max) = std::env::var("RPCQ_MAX_CLIENTS") {
            if let Ok(n) = max.parse() {
                self.max_clients = n;
            }
        }

        if let Ok(enabled) = std::env::var("RPCQ_BATCHING") {
            self.batching_enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }

        if let Ok(threshold) = std::env::var("RPCQ_BATCH_THRESHOLD") {
            if let Ok(n) = threshold.parse() {
                self.batch_threshold_bytes = n;
            }
        }

        if let Ok(id) = std::env::var("RPCQ_SERVER_PEER_ID") {
            if let Ok(n) = id.parse() {
                self.server_peer_id = n;
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.history_depth > MAX_HISTORY_DEPTH {
            return Err(ConfigError::ValidationError(format!(
                "queue.history_depth {} exceeds {}",
                self.history_depth, MAX_HISTORY_DEPTH
            )));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::ValidationError(
                "queue.max_clients must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transport adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Capacity of each per-(peer, channel) send queue, in bytes.
    pub send_queue_capacity: usize,
    /// Largest reassembled message accepted from a reliable stream.
    /// Defaults to the larger of the send queue capacity and two maximal
    /// item payloads, so a batch ending in a maximal message still fits.
    pub max_receive_message: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            max_receive_message: None,
        }
    }
}

impl TransportConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("RPCQ_SEND_QUEUE_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.send_queue_capacity = n;
            }
        }
    }

    /// Returns the effective receive limit.
    pub fn max_receive_message(&self) -> usize {
        self.max_receive_message
            .unwrap_or_else(|| self.send_queue_capacity.max(2 * MAX_ITEM_PAYLOAD))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.send_queue_capacity <= LENGTH_PREFIX_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "transport.send_queue_capacity must exceed {} bytes",
                LENGTH_PREFIX_SIZE
            )));
        }
        if self.max_receive_message() == 0 {
            return Err(ConfigError::ValidationError(
                "transport.max_receive_message must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Internal message configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalConfig {
    /// How long a lifecycle message waits for its targets, in seconds.
    pub message_lifetime_secs: u64,
}

impl Default for InternalConfig {
    fn default() -> Self {
        Self {
            message_lifetime_secs: 60,
        }
    }
}

impl InternalConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(lifetime) = std::env::var("RPCQ_INTERNAL_LIFETIME_SECS") {
            if let Ok(secs) = lifetime.parse() {
                self.message_lifetime_secs = secs;
            }
        }
    }

    /// Returns the message lifetime as Duration.
    pub fn message_lifetime(&self) -> Duration {
        Duration::from_secs(self.message_lifetime_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.message_lifetime_secs == 0 {
            return Err(ConfigError::ValidationError(
                "internal.message_lifetime_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Record queue statistics.
    #[serde(default)]
    pub enabled: bool,
    /// Prefix of every metric name.
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            namespace: "rpcq".to_string(),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("RPCQ_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.namespace.is_empty() {
            return Err(ConfigError::ValidationError(
                "metrics enabled but namespace is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
