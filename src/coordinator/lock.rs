//! Per-strategy distributed lock
//!
//! The lock is a single store key holding `token|worker`. Acquisition is
//! `SET NX PX` and renew/release are owner-checked scripts, so every
//! transition is one store-side step. Expiry is left entirely to the store
//! TTL; a holder learns it lost the lock only when a renewal fails.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use uuid::Uuid;

use super::WorkerIdentity;
use crate::grid::StrategyId;
use crate::store::{lock_key, StateStore, StoreResult};

/// Proof of ownership returned by a successful acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    strategy_id: StrategyId,
    token: String,
    worker: String,
}

impl LockHandle {
    pub fn strategy_id(&self) -> StrategyId {
        self.strategy_id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    fn value(&self) -> String {
        format!("{}|{}", self.token, self.worker)
    }
}

/// Current owner of a lock as seen by any reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub token: String,
    pub worker: String,
    pub remaining: Option<Duration>,
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Latest point at which a holder must have renewed
    pub fn renew_deadline(&self) -> Duration {
        self.ttl / 2
    }

    /// Claim the lock for `worker`.
    ///
    /// `Ok(None)` means another owner holds it. Store errors are returned
    /// as-is and never retried here.
    pub async fn try_acquire(&self, strategy_id: StrategyId, worker: &WorkerIdentity) -> StoreResult<Option<LockHandle>> {
        let handle = LockHandle {
            strategy_id,
            token: Uuid::new_v4().to_string(),
            worker: worker.name.clone(),
        };

        let acquired = self
            .store
            .set_if_absent(&lock_key(strategy_id), &handle.value(), self.ttl)
            .await?;

        if acquired {
            info!("[strategy {}] lock acquired by {}", strategy_id, worker.name);
            Ok(Some(handle))
        } else {
            debug!("[strategy {}] lock already held", strategy_id);
            Ok(None)
        }
    }

    /// Extend the TTL. `Ok(false)` means the lock is gone or owned by someone else.
    pub async fn renew(&self, handle: &LockHandle) -> StoreResult<bool> {
        let renewed = self
            .store
            .renew_if_owner(&lock_key(handle.strategy_id), &handle.value(), self.ttl)
            .await?;
        if !renewed {
            warn!("[strategy {}] lock renewal rejected", handle.strategy_id);
        }
        Ok(renewed)
    }

    /// Delete the lock if this handle still owns it
    pub async fn release(&self, handle: &LockHandle) -> StoreResult<bool> {
        let released = self
            .store
            .delete_if_owner(&lock_key(handle.strategy_id), &handle.value())
            .await?;
        if released {
            info!("[strategy {}] lock released", handle.strategy_id);
        } else {
            debug!("[strategy {}] lock was no longer ours at release", handle.strategy_id);
        }
        Ok(released)
    }

    pub async fn holder(&self, strategy_id: StrategyId) -> StoreResult<Option<LockHolder>> {
        let key = lock_key(strategy_id);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let (token, worker) = value.split_once('|').unwrap_or((value.as_str(), ""));
        Ok(Some(LockHolder {
            token: token.to_string(),
            worker: worker.to_string(),
            remaining: self.store.ttl(&key).await?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn worker(name: &str) -> WorkerIdentity {
        WorkerIdentity::new(name, "host", "127.0.0.1")
    }

    #[tokio::test]
    async fn test_concurrent_acquisition_has_exactly_one_winner() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store, Duration::from_secs(60));

        let mut handles = Vec::new();
        for i in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks.try_acquire(5, &worker(&format!("w{}", i))).await.unwrap()
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Some(lock) = handle.await.unwrap() {
                winners.push(lock);
            }
        }
        assert_eq!(winners.len(), 1);

        let holder = locks.holder(5).await.unwrap().unwrap();
        assert_eq!(holder.worker, winners[0].worker());
        assert_eq!(holder.token, winners[0].token());
    }

    #[tokio::test(start_paused = true)]
    async fn test_takeover_only_after_ttl() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(30);
        let locks = LockManager::new(store, ttl);

        let a = locks.try_acquire(1, &worker("a")).await.unwrap().unwrap();

        // `a` stops renewing; `b` keeps trying
        tokio::time::advance(ttl - Duration::from_millis(1)).await;
        assert!(locks.try_acquire(1, &worker("b")).await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(2)).await;
        let b = locks.try_acquire(1, &worker("b")).await.unwrap().unwrap();

        // The old holder can neither renew nor release the new lock
        assert!(!locks.renew(&a).await.unwrap());
        assert!(!locks.release(&a).await.unwrap());
        assert!(locks.renew(&b).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_ownership() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let ttl = Duration::from_secs(10);
        let locks = LockManager::new(store, ttl);
        let a = locks.try_acquire(1, &worker("a")).await.unwrap().unwrap();

        for _ in 0..5 {
            tokio::time::advance(locks.renew_deadline()).await;
            assert!(locks.renew(&a).await.unwrap());
        }
        assert!(locks.try_acquire(1, &worker("b")).await.unwrap().is_none());

        assert!(locks.release(&a).await.unwrap());
        assert!(locks.holder(1).await.unwrap().is_none());
        assert!(locks.try_acquire(1, &worker("b")).await.unwrap().is_some());
    }
}
