//! Error types shared across the crate

use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineState;

/// Failures of the key-value store backing locks and status
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    #[error("State store operation `{op}` timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("Malformed store value: {0}")]
    Decode(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Failures reported by an exchange adapter
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    /// Network hiccup, rate limit, 5xx. Safe to retry on the next tick.
    #[error("Transient exchange error: {0}")]
    Transient(String),

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Exchange call `{op}` timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("Operation not supported by this market: {0}")]
    Unsupported(String),
}

/// Crate-level error
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("Invalid engine transition {from:?} -> {to:?}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error("Strategy catalog error: {0}")]
    Catalog(String),

    #[error("Strategy {strategy_id} is pinned to worker '{pinned}'")]
    NotAssigned { strategy_id: u64, pinned: String },

    #[error("No live worker has a free slot")]
    NoCapacity,

    #[error("Worker runtime is shut down")]
    RuntimeClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Settings error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Configuration problems are never retried
    pub fn is_config(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::Catalog(_))
    }
}

/// Result type for crate operations
pub type Result<T> = std::result::Result<T, Error>;
