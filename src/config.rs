use std::path::PathBuf;
use std::time::Duration;

use config::{Config, File};
pub use config::ConfigError;
use serde::Deserialize;

/// Process-wide worker settings
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    /// Identity and capacity of this worker
    #[serde(default)]
    pub worker: WorkerSettings,
    /// Key-value store backing locks and status
    #[serde(default)]
    pub store: StoreSettings,
    /// Lock, heartbeat and freshness timings
    #[serde(default)]
    pub coordination: CoordinationSettings,
    /// Trading loop limits
    #[serde(default)]
    pub engine: EngineSettings,
    /// Where strategy definitions are read from
    #[serde(default)]
    pub catalog: CatalogSettings,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Control/status HTTP server
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Unique worker name; defaults to `worker@{hostname}`
    #[serde(default)]
    pub name: Option<String>,
    /// Maximum number of strategies this worker runs at once
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            name: None,
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    16
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSettings {
    /// `redis://...` URL, or `memory` for a single-process store
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Upper bound on any single store round-trip
    #[serde(default = "default_store_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            op_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl StoreSettings {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_store_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationSettings {
    /// Lock TTL. Expiry is reserved for crash detection, so keep it long.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Status older than this is reported as not running
    #[serde(default = "default_freshness")]
    pub freshness_secs: u64,
    /// Secondary stop-signal check inside the polling sleep
    #[serde(default = "default_stop_poll")]
    pub stop_poll_ms: u64,
    /// How long an ERRORED status (and a stop request) stays readable
    #[serde(default = "default_status_retention")]
    pub status_retention_secs: u64,
    /// Worker registry refresh period
    #[serde(default = "default_worker_heartbeat")]
    pub worker_heartbeat_secs: u64,
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_lock_ttl(),
            freshness_secs: default_freshness(),
            stop_poll_ms: default_stop_poll(),
            status_retention_secs: default_status_retention(),
            worker_heartbeat_secs: default_worker_heartbeat(),
        }
    }
}

impl CoordinationSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn status_retention(&self) -> Duration {
        Duration::from_secs(self.status_retention_secs)
    }

    pub fn worker_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_heartbeat_secs * 3)
    }
}

fn default_lock_ttl() -> u64 {
    86_400
}

fn default_freshness() -> u64 {
    30
}

fn default_stop_poll() -> u64 {
    500
}

fn default_status_retention() -> u64 {
    3_600
}

fn default_worker_heartbeat() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Consecutive price fetch failures tolerated before ERRORED
    #[serde(default = "default_max_price_failures")]
    pub max_price_failures: u32,
    /// Consecutive failed iterations tolerated before ERRORED
    #[serde(default = "default_max_iteration_failures")]
    pub max_iteration_failures: u32,
    /// Upper bound on any single exchange call; must stay below every
    /// strategy's polling interval
    #[serde(default = "default_exchange_timeout_ms")]
    pub exchange_timeout_ms: u64,
    /// Attempts to flatten positions on a risk stop
    #[serde(default = "default_flatten_attempts")]
    pub flatten_attempts: u32,
    /// Base delay for exponential backoff between flatten attempts
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    /// Clean iterations after which a transient `last_error` is cleared
    #[serde(default = "default_error_retention")]
    pub error_retention_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_price_failures: default_max_price_failures(),
            max_iteration_failures: default_max_iteration_failures(),
            exchange_timeout_ms: default_exchange_timeout_ms(),
            flatten_attempts: default_flatten_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            error_retention_secs: default_error_retention(),
        }
    }
}

fn default_max_price_failures() -> u32 {
    5
}

fn default_max_iteration_failures() -> u32 {
    3
}

fn default_exchange_timeout_ms() -> u64 {
    800
}

fn default_flatten_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_error_retention() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSettings {
    /// JSON file with the strategy definitions
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("strategies.json")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Serve the control/status API
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    /// Server port (default 3000)
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Server host (default 127.0.0.1)
    #[serde(default = "default_server_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            port: default_server_port(),
            host: default_server_host(),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_server_enabled() -> bool {
    true
}

fn default_server_port() -> u16 {
    3000
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            // e.g. APP_STORE__URL=redis://redis:6379/
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Cross-field checks that serde defaults cannot express
    pub fn validate(&self) -> Result<(), String> {
        let ttl_ms = self.coordination.lock_ttl_secs.saturating_mul(1000);
        if ttl_ms == 0 {
            return Err("coordination.lock_ttl_secs must be positive".into());
        }
        if self.coordination.stop_poll_ms == 0 {
            return Err("coordination.stop_poll_ms must be positive".into());
        }
        if self.store.op_timeout_ms >= ttl_ms / 2 {
            return Err("store.op_timeout_ms must be well below lock_ttl/2".into());
        }
        if self.worker.capacity == 0 {
            return Err("worker.capacity must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.coordination.lock_ttl(), Duration::from_secs(86_400));
        assert_eq!(settings.engine.max_iteration_failures, 3);
        assert_eq!(settings.server.addr(), "127.0.0.1:3000");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = Settings::new("does/not/exist/settings").unwrap();
        assert_eq!(settings.store.url, "redis://127.0.0.1:6379/");
        assert_eq!(settings.worker.capacity, 16);
    }

    #[test]
    fn test_store_timeout_must_fit_in_ttl() {
        let mut settings = Settings::default();
        settings.coordination.lock_ttl_secs = 1;
        settings.store.op_timeout_ms = 600;
        assert!(settings.validate().is_err());
    }
}
