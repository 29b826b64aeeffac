//! Strategy execution: the lifecycle state machine and the trading loop

pub mod runner;
pub mod state;

use std::time::Duration;

use crate::config::{CoordinationSettings, EngineSettings};
use crate::grid::DayBoundary;

pub use runner::{EngineOutcome, ExitReason, TradingEngine};
pub use state::EngineState;

/// Limits and timings of one engine, resolved from [`EngineSettings`] and
/// [`CoordinationSettings`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_price_failures: u32,
    pub max_iteration_failures: u32,
    pub exchange_timeout: Duration,
    pub flatten_attempts: u32,
    pub retry_base_delay: Duration,
    pub error_retention: Duration,
    pub stop_poll: Duration,
    /// Lock TTL; also the TTL of a running status record
    pub lock_ttl: Duration,
    /// How long a final ERRORED or risk-stopped status stays readable
    pub status_retention: Duration,
    pub day_boundary: DayBoundary,
}

impl EngineConfig {
    pub fn from_settings(engine: &EngineSettings, coordination: &CoordinationSettings) -> Self {
        Self {
            max_price_failures: engine.max_price_failures,
            max_iteration_failures: engine.max_iteration_failures,
            exchange_timeout: Duration::from_millis(engine.exchange_timeout_ms),
            flatten_attempts: engine.flatten_attempts,
            retry_base_delay: Duration::from_millis(engine.retry_base_delay_ms),
            error_retention: Duration::from_secs(engine.error_retention_secs),
            stop_poll: Duration::from_millis(coordination.stop_poll_ms),
            lock_ttl: coordination.lock_ttl(),
            status_retention: coordination.status_retention(),
            day_boundary: DayBoundary::Local,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_settings(&EngineSettings::default(), &CoordinationSettings::default())
    }
}
