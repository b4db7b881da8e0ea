//! Error types for the trafficgate service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for trafficgate operations.
#[derive(Error, Debug)]
pub enum TrafficGateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared window store could not be reached or timed out
    #[error("Window store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// HTTP server errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for TrafficGateError {
    fn from(err: ::config::ConfigError) -> Self {
        TrafficGateError::Config(err.to_string())
    }
}

/// Result type alias for trafficgate operations.
pub type Result<T> = std::result::Result<T, TrafficGateError>;
