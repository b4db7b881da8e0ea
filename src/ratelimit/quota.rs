//! Quota configuration.
//!
//! A quota is loaded once at startup and never changes for the lifetime of the
//! process. Every resource shares the same window length; the per-window limit
//! may be overridden per resource.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::key::DEFAULT_KEY_PREFIX;
use crate::error::{Result, TrafficGateError};

/// How the four window steps (evict, count, insert, expire) reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    /// One store-side unit per decision. Never admits more than the limit.
    Atomic,
    /// Four separate store round-trips. Racing callers may overshoot the limit.
    Sequential,
}

impl Default for AdmissionMode {
    fn default() -> Self {
        AdmissionMode::Atomic
    }
}

/// Quota and admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Length of the sliding window in seconds
    #[serde(default = "default_window_size_seconds")]
    pub window_size_seconds: u64,

    /// Admitted requests allowed per window for resources without an override
    #[serde(default = "default_limit_per_window")]
    pub limit_per_window: u64,

    /// Per-resource overrides of `limit_per_window`
    #[serde(default)]
    pub resource_limits: HashMap<String, u64>,

    /// Store interaction mode
    #[serde(default)]
    pub mode: AdmissionMode,

    /// Prefix for window keys in the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            window_size_seconds: default_window_size_seconds(),
            limit_per_window: default_limit_per_window(),
            resource_limits: HashMap::new(),
            mode: AdmissionMode::default(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Longest accepted window, one year.
///
/// Keeps the window in milliseconds and the key expiry well inside `i64`.
pub const MAX_WINDOW_SIZE_SECONDS: u64 = 365 * 24 * 60 * 60;

fn default_window_size_seconds() -> u64 {
    60
}

fn default_limit_per_window() -> u64 {
    100
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl QuotaConfig {
    /// Create a quota with a single limit for every resource.
    pub fn new(window_size_seconds: u64, limit_per_window: u64) -> Self {
        Self {
            window_size_seconds,
            limit_per_window,
            ..Self::default()
        }
    }

    /// Set the store interaction mode.
    pub fn with_mode(mut self, mode: AdmissionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the limit for one resource.
    pub fn with_resource_limit(mut self, resource: &str, limit: u64) -> Self {
        self.resource_limits.insert(resource.to_string(), limit);
        self
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.window_size_seconds == 0 {
            return Err(TrafficGateError::Config(
                "rate_limiting.window_size_seconds must be greater than zero".to_string(),
            ));
        }
        if self.window_size_seconds > MAX_WINDOW_SIZE_SECONDS {
            return Err(TrafficGateError::Config(format!(
                "rate_limiting.window_size_seconds must be at most {}",
                MAX_WINDOW_SIZE_SECONDS
            )));
        }
        if self.key_prefix.is_empty() {
            return Err(TrafficGateError::Config(
                "rate_limiting.key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The admitted-request limit for a resource.
    pub fn limit_for(&self, resource: &str) -> u64 {
        self.resource_limits
            .get(resource)
            .copied()
            .unwrap_or(self.limit_per_window)
    }

    /// Window length in milliseconds.
    ///
    /// Saturates at `i64::MAX` for windows that failed validation.
    pub fn window_millis(&self) -> i64 {
        i64::try_from(self.window_size_seconds)
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .unwrap_or(i64::MAX)
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_size_seconds)
    }

    /// Expiry applied to a window key after each admission.
    ///
    /// One second longer than the window so the newest entry always outlives it.
    pub fn key_ttl_seconds(&self) -> u64 {
        self.window_size_seconds.saturating_add(1)
    }
}
