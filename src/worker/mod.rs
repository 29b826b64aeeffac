//! Worker process: engine supervision, strategy lookup and dispatch
//!
//! A worker receives `Start`/`Stop` commands, owns the engines it started
//! and keeps its entry in the worker registry alive. Where a start request
//! should go is decided by [`select_worker`] over a registry snapshot.

pub mod catalog;
pub mod runtime;

use crate::coordinator::{assign_worker, Assignment, WorkerRegistry, WorkerSnapshot};
use crate::errors::{Error, Result};
use crate::grid::StrategyId;

pub use catalog::{FileCatalog, StaticCatalog, StrategyCatalog};
pub use runtime::{StartOutcome, WorkerCommand, WorkerHandle, WorkerRuntime};

/// Choose the live worker a start request for `strategy_id` is sent to
pub async fn select_worker(
    registry: &WorkerRegistry,
    catalog: &dyn StrategyCatalog,
    strategy_id: StrategyId,
    hint: Option<&str>,
) -> Result<WorkerSnapshot> {
    let config = catalog.get(strategy_id).await?;
    let workers = registry.list_workers().await?;

    match assign_worker(config.worker_name.as_deref(), hint, &workers) {
        Assignment::Worker(name) => workers
            .into_iter()
            .find(|w| w.identity.name == name)
            .ok_or(Error::NoCapacity),
        Assignment::PinnedUnavailable(pinned) => Err(Error::NotAssigned {
            strategy_id,
            pinned,
        }),
        Assignment::NoCapacity => Err(Error::NoCapacity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::WorkerIdentity;
    use crate::grid::StrategyConfig;
    use crate::store::{MemoryStore, StateStore};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::time::Duration;

    async fn registry_with(workers: &[(&str, usize)]) -> WorkerRegistry {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let registry = WorkerRegistry::new(store, Duration::from_secs(30));
        for (name, running) in workers {
            registry
                .heartbeat(&WorkerSnapshot {
                    identity: WorkerIdentity::new(*name, "host", "10.0.0.2"),
                    control_addr: Some(format!("{}:3000", name)),
                    capacity: 2,
                    running: *running,
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_select_least_loaded_or_pinned() {
        let registry = registry_with(&[("a", 2), ("b", 1)]).await;
        let catalog = StaticCatalog::new([
            StrategyConfig::new(1, "BTC/USDT", dec!(1), 3, dec!(1), dec!(1)),
            StrategyConfig::new(2, "BTC/USDT", dec!(1), 3, dec!(1), dec!(1)).with_worker("c"),
        ]);

        let chosen = select_worker(&registry, &catalog, 1, Some("a")).await.unwrap();
        assert_eq!(chosen.identity.name, "b");
        assert_eq!(chosen.control_addr.as_deref(), Some("b:3000"));

        assert!(matches!(
            select_worker(&registry, &catalog, 2, None).await,
            Err(Error::NotAssigned { strategy_id: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_select_without_capacity() {
        let registry = registry_with(&[("a", 2)]).await;
        let catalog = StaticCatalog::new([StrategyConfig::new(1, "BTC/USDT", dec!(1), 3, dec!(1), dec!(1))]);
        assert!(matches!(
            select_worker(&registry, &catalog, 1, None).await,
            Err(Error::NoCapacity)
        ));
    }
}
