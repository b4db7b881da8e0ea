//! Configuration management for trafficgate.
//!
//! Configuration is read from an optional YAML file and then overlaid with
//! environment variables of the form `TRAFFICGATE__SECTION__KEY`
//! (for example `TRAFFICGATE__RATE_LIMITING__LIMIT_PER_WINDOW=50`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TrafficGateError};
use crate::ratelimit::QuotaConfig;

/// Prefix used for environment variable overrides.
const ENV_PREFIX: &str = "TRAFFICGATE";

/// Main configuration for the trafficgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Quota and admission configuration
    #[serde(default)]
    pub rate_limiting: QuotaConfig,

    /// Window store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Usage event publication configuration
    #[serde(default)]
    pub usage: UsageConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which window store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis sorted sets (multi-instance deployments)
    Redis,
    /// Process-local store (single instance, development and tests)
    Memory,
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Redis
    }
}

/// Window store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// Per-operation timeout as a `Duration`.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_op_timeout_ms() -> u64 {
    500
}

/// Where admitted-request usage events are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// Structured log events on the `usage` target
    Log,
    /// Entries appended to a Redis stream
    RedisStream,
    /// No publication
    Disabled,
}

impl Default for SinkKind {
    fn default() -> Self {
        SinkKind::Log
    }
}

/// Usage event publication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Sink receiving the events
    #[serde(default)]
    pub sink: SinkKind,

    /// Stream key for the `redis_stream` sink
    #[serde(default = "default_stream_key")]
    pub stream_key: String,

    /// Approximate maximum stream length (`XADD ... MAXLEN ~`)
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: u64,

    /// Bounded queue capacity between the limiter and the workers
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of worker tasks draining the queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            sink: SinkKind::default(),
            stream_key: default_stream_key(),
            stream_max_len: default_stream_max_len(),
            queue_capacity: default_queue_capacity(),
            worker_count: default_worker_count(),
        }
    }
}

fn default_stream_key() -> String {
    "traffic-log".to_string()
}

fn default_stream_max_len() -> u64 {
    100_000
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_worker_count() -> usize {
    20
}

impl GateConfig {
    /// Load configuration from an optional file, overlaid with environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: GateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TrafficGateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()?;

        if self.usage.queue_capacity == 0 {
            return Err(TrafficGateError::Config(
                "usage.queue_capacity must be greater than zero".to_string(),
            ));
        }
        if self.usage.worker_count == 0 {
            return Err(TrafficGateError::Config(
                "usage.worker_count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
