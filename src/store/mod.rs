//! Key-value + TTL store shared by every worker
//!
//! One store instance backs the strategy locks, the status records, stop
//! requests and the worker registry. All of them are plain keys:
//!
//! | Key | Type | Written by |
//! |---|---|---|
//! | `lock:strategy:{id}` | string `token\|worker` | [`crate::coordinator::LockManager`] |
//! | `status:strategy:{id}` | hash, see [`StatusRecord`] | owning engine |
//! | `stop:strategy:{id}` | string, request time in millis | any process |
//! | `worker:info:{name}` | hash | each worker's heartbeat |

pub mod memory;
pub mod redis_store;
pub mod status;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::StoreSettings;
use crate::errors::{Result, StoreError};
use crate::grid::StrategyId;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use status::{StatusReader, StatusRecord, StatusView};

/// Result of a single store round-trip
pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub const WORKER_KEY_PREFIX: &str = "worker:info:";

pub fn lock_key(strategy_id: StrategyId) -> String {
    format!("lock:strategy:{}", strategy_id)
}

pub fn status_key(strategy_id: StrategyId) -> String {
    format!("status:strategy:{}", strategy_id)
}

pub fn stop_key(strategy_id: StrategyId) -> String {
    format!("stop:strategy:{}", strategy_id)
}

pub fn worker_key(name: &str) -> String {
    format!("{}{}", WORKER_KEY_PREFIX, name)
}

/// Store primitives. Conditional operations are single store-side steps,
/// never read-then-write from the client.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create `key` only if it does not exist (or has expired)
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Reset the TTL of `key` if it still holds `value`
    async fn renew_if_owner(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete `key` if it still holds `value`
    async fn delete_if_owner(&self, key: &str, value: &str) -> StoreResult<bool>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Remaining TTL; `None` if the key is missing or never expires
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Replace the whole hash at `key`
    async fn put_hash(&self, key: &str, fields: &[(String, String)], ttl: Option<Duration>) -> StoreResult<()>;

    /// Empty map when the key is missing
    async fn get_hash(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Open the store named by the settings: `memory` or a `redis://` URL
pub async fn connect(settings: &StoreSettings) -> Result<Arc<dyn StateStore>> {
    if settings.url == "memory" {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = RedisStore::connect(&settings.url, settings.op_timeout()).await?;
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(lock_key(42), "lock:strategy:42");
        assert_eq!(status_key(42), "status:strategy:42");
        assert_eq!(stop_key(42), "stop:strategy:42");
        assert_eq!(worker_key("w1"), "worker:info:w1");
    }

    #[tokio::test]
    async fn test_connect_memory() {
        let settings = StoreSettings {
            url: "memory".into(),
            ..StoreSettings::default()
        };
        let store = connect(&settings).await.unwrap();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
