//! Distributed single-owner scheduling
//!
//! - [`lock`] - per-strategy lock (tryAcquire / renew / release)
//! - [`registry`] - worker identity and heartbeat registry
//! - [`assign`] - pure worker selection
//!
//! [`Coordinator`] ties them to one worker identity and adds cross-process
//! stop requests.

pub mod assign;
pub mod lock;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use crate::config::CoordinationSettings;
use crate::grid::StrategyId;
use crate::store::status::{parse_millis, store_time};
use crate::store::{stop_key, StateStore, StoreResult};

pub use assign::{assign_worker, Assignment};
pub use lock::{LockHandle, LockHolder, LockManager};
pub use registry::{WorkerIdentity, WorkerRegistry, WorkerSnapshot};

/// Outcome of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Requested,
    /// Nobody holds the lock; nothing to stop
    NotRunning,
}

/// Coordination entry point for one worker
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn StateStore>,
    identity: WorkerIdentity,
    locks: LockManager,
    registry: WorkerRegistry,
    stop_ttl: Duration,
}

impl Coordinator {
    pub fn new(store: Arc<dyn StateStore>, identity: WorkerIdentity, settings: &CoordinationSettings) -> Self {
        Self {
            locks: LockManager::new(store.clone(), settings.lock_ttl()),
            registry: WorkerRegistry::new(store.clone(), settings.worker_ttl()),
            stop_ttl: settings.status_retention(),
            identity,
            store,
        }
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Acquire the strategy lock for this worker.
    ///
    /// A stop request left over from an earlier run is cleared once the
    /// lock is ours, so it cannot stop the new run.
    pub async fn try_acquire(&self, strategy_id: StrategyId) -> StoreResult<Option<LockHandle>> {
        let handle = self.locks.try_acquire(strategy_id, &self.identity).await?;
        if handle.is_some() {
            self.clear_stop(strategy_id).await?;
        }
        Ok(handle)
    }

    /// Ask whichever worker owns the strategy to stop
    pub async fn request_stop(&self, strategy_id: StrategyId, now: DateTime<Utc>) -> StoreResult<StopOutcome> {
        if self.locks.holder(strategy_id).await?.is_none() {
            return Ok(StopOutcome::NotRunning);
        }
        let stamp = store_time(now).timestamp_millis().to_string();
        self.store
            .set(&stop_key(strategy_id), &stamp, Some(self.stop_ttl))
            .await?;
        info!("[strategy {}] stop requested", strategy_id);
        Ok(StopOutcome::Requested)
    }

    /// When a pending stop was requested, if any
    pub async fn stop_requested(&self, strategy_id: StrategyId) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get(&stop_key(strategy_id))
            .await?
            .and_then(|raw| parse_millis(&raw)))
    }

    pub async fn clear_stop(&self, strategy_id: StrategyId) -> StoreResult<()> {
        self.store.delete(&stop_key(strategy_id)).await
    }
}
