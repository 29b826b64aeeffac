//! Process-wide supervisor of trading engines

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::catalog::StrategyCatalog;
use crate::coordinator::{Coordinator, LockHandle, StopOutcome, WorkerSnapshot};
use crate::engine::{EngineConfig, EngineOutcome, EngineState, ExitReason, TradingEngine};
use crate::errors::{Error, Result};
use crate::exchange::ExchangeFactory;
use crate::grid::{StrategyConfig, StrategyId};
use crate::store::status::store_time;
use crate::store::{status_key, StatusRecord};

/// Result of a start command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { task_id: String },
    /// Running here or on another worker
    AlreadyRunning,
    /// Pinned to a different worker
    NotAssigned { pinned: String },
    NoCapacity,
}

/// Commands delivered by the dispatch transport
#[derive(Debug)]
pub enum WorkerCommand {
    Start {
        strategy_id: StrategyId,
        reply: Option<oneshot::Sender<Result<StartOutcome>>>,
    },
    Stop {
        strategy_id: StrategyId,
        reply: Option<oneshot::Sender<Result<StopOutcome>>>,
    },
    /// Stop every engine, deregister and exit
    Shutdown { reply: Option<oneshot::Sender<()>> },
}

/// Cloneable sender side of a [`WorkerRuntime`]
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    /// Fire-and-forget delivery
    pub async fn send(&self, command: WorkerCommand) -> Result<()> {
        self.tx.send(command).await.map_err(|_| Error::RuntimeClosed)
    }

    pub async fn start(&self, strategy_id: StrategyId) -> Result<StartOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerCommand::Start {
            strategy_id,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| Error::RuntimeClosed)?
    }

    pub async fn stop(&self, strategy_id: StrategyId) -> Result<StopOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerCommand::Stop {
            strategy_id,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| Error::RuntimeClosed)?
    }

    /// Returns once every engine has stopped
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerCommand::Shutdown { reply: Some(reply) }).await?;
        rx.await.map_err(|_| Error::RuntimeClosed)
    }
}

struct RunningEngine {
    task_id: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns every engine running on this worker.
///
/// Engines never share state; the runtime only tracks their stop channels
/// and join handles, and publishes this worker's registry entry.
pub struct WorkerRuntime {
    coordinator: Coordinator,
    catalog: Arc<dyn StrategyCatalog>,
    exchanges: Arc<dyn ExchangeFactory>,
    engine: EngineConfig,
    capacity: usize,
    heartbeat_every: Duration,
    control_addr: Option<String>,
    running: HashMap<StrategyId, RunningEngine>,
    tx: mpsc::Sender<WorkerCommand>,
    commands: mpsc::Receiver<WorkerCommand>,
    done_tx: mpsc::UnboundedSender<EngineOutcome>,
    done_rx: mpsc::UnboundedReceiver<EngineOutcome>,
}

impl WorkerRuntime {
    pub fn new(
        coordinator: Coordinator,
        catalog: Arc<dyn StrategyCatalog>,
        exchanges: Arc<dyn ExchangeFactory>,
        engine: EngineConfig,
    ) -> Self {
        let (tx, commands) = mpsc::channel(64);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            coordinator,
            catalog,
            exchanges,
            engine,
            capacity: 16,
            heartbeat_every: Duration::from_secs(10),
            control_addr: None,
            running: HashMap::new(),
            tx,
            commands,
            done_tx,
            done_rx,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_heartbeat(mut self, every: Duration) -> Self {
        self.heartbeat_every = every;
        self
    }

    /// Address other processes use to reach this worker's control server
    pub fn with_control_addr(mut self, addr: impl Into<String>) -> Self {
        self.control_addr = Some(addr.into());
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle { tx: self.tx.clone() }
    }

    pub async fn run(mut self) {
        let name = self.coordinator.identity().name.clone();
        info!("Worker {} up, capacity {}", name, self.capacity);

        let mut heartbeat = tokio::time::interval(self.heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(WorkerCommand::Start { strategy_id, reply }) => {
                        let result = self.start(strategy_id).await;
                        match &result {
                            Ok(outcome) => info!("[strategy {}] start: {:?}", strategy_id, outcome),
                            Err(e) => warn!("[strategy {}] start failed: {}", strategy_id, e),
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Some(WorkerCommand::Stop { strategy_id, reply }) => {
                        let result = self.stop(strategy_id).await;
                        if let Err(e) = &result {
                            warn!("[strategy {}] stop failed: {}", strategy_id, e);
                        }
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Some(WorkerCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        if let Some(reply) = reply {
                            let _ = reply.send(());
                        }
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(outcome) = self.done_rx.recv() => self.on_finished(outcome),
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }
    }

    async fn start(&mut self, strategy_id: StrategyId) -> Result<StartOutcome> {
        if let Some(running) = self.running.get(&strategy_id) {
            if !running.handle.is_finished() {
                return Ok(StartOutcome::AlreadyRunning);
            }
        }
        if self.active() >= self.capacity {
            return Ok(StartOutcome::NoCapacity);
        }

        let config = self.catalog.get(strategy_id).await?;
        if let Some(pinned) = &config.worker_name {
            if pinned != &self.coordinator.identity().name {
                return Ok(StartOutcome::NotAssigned {
                    pinned: pinned.clone(),
                });
            }
        }

        let Some(lock) = self.coordinator.try_acquire(strategy_id).await? else {
            debug!("[strategy {}] lock held elsewhere", strategy_id);
            return Ok(StartOutcome::AlreadyRunning);
        };

        let exchange = match self.exchanges.create(&config) {
            Ok(exchange) => exchange,
            Err(e) => {
                let message = e.to_string();
                publish_failure(&self.coordinator, &config, "", &message, self.engine.status_retention).await;
                release(&self.coordinator, &lock).await;
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = watch::channel(false);
        let engine = TradingEngine::new(
            config.clone(),
            exchange,
            self.coordinator.clone(),
            lock.clone(),
            stop_rx,
            self.engine.clone(),
        );
        let task_id = engine.task_id().to_string();
        let handle = tokio::spawn(supervise(
            engine,
            config,
            lock,
            self.coordinator.clone(),
            self.engine.status_retention,
            self.done_tx.clone(),
        ));
        self.running.insert(
            strategy_id,
            RunningEngine {
                task_id: task_id.clone(),
                stop_tx,
                handle,
            },
        );
        Ok(StartOutcome::Started { task_id })
    }

    async fn stop(&mut self, strategy_id: StrategyId) -> Result<StopOutcome> {
        if let Some(running) = self.running.get(&strategy_id) {
            if running.stop_tx.send(true).is_ok() {
                return Ok(StopOutcome::Requested);
            }
        }
        // Owned by another worker, or by nobody
        Ok(self.coordinator.request_stop(strategy_id, Utc::now()).await?)
    }

    fn on_finished(&mut self, outcome: EngineOutcome) {
        let current = self
            .running
            .get(&outcome.strategy_id)
            .is_some_and(|r| r.task_id == outcome.task_id);
        if current {
            self.running.remove(&outcome.strategy_id);
        }
        match &outcome.reason {
            ExitReason::Failed(msg) => {
                error!("[strategy {}] finished {}: {}", outcome.strategy_id, outcome.final_state, msg)
            }
            reason => info!(
                "[strategy {}] finished {} ({:?}), realized {}",
                outcome.strategy_id, outcome.final_state, reason, outcome.realized_pnl
            ),
        }
    }

    fn active(&self) -> usize {
        self.running.values().filter(|r| !r.handle.is_finished()).count()
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            identity: self.coordinator.identity().clone(),
            control_addr: self.control_addr.clone(),
            capacity: self.capacity,
            running: self.active(),
            updated_at: Utc::now(),
        }
    }

    async fn heartbeat(&self) {
        if let Err(e) = self.coordinator.registry().heartbeat(&self.snapshot()).await {
            warn!("Worker heartbeat failed: {}", e);
        }
    }

    async fn shutdown(&mut self) {
        info!("Worker shutting down, stopping {} engine(s)", self.running.len());
        for running in self.running.values() {
            let _ = running.stop_tx.send(true);
        }
        for (_, running) in self.running.drain() {
            let _ = running.handle.await;
        }
        let name = self.coordinator.identity().name.clone();
        if let Err(e) = self.coordinator.registry().deregister(&name).await {
            warn!("Worker deregistration failed: {}", e);
        }
    }
}

/// Run one engine and turn a panic into an ERRORED status
async fn supervise(
    engine: TradingEngine,
    config: StrategyConfig,
    lock: LockHandle,
    coordinator: Coordinator,
    retention: Duration,
    done: mpsc::UnboundedSender<EngineOutcome>,
) {
    let task_id = engine.task_id().to_string();
    let outcome = match tokio::spawn(engine.run()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = if e.is_panic() {
                format!("engine panicked: {}", panic_message(e.into_panic()))
            } else {
                "engine task cancelled".to_string()
            };
            error!("{} {}", config.log_prefix(), message);
            publish_failure(&coordinator, &config, &task_id, &message, retention).await;
            release(&coordinator, &lock).await;
            EngineOutcome {
                strategy_id: config.strategy_id,
                task_id,
                final_state: EngineState::Errored,
                reason: ExitReason::Failed(message.clone()),
                last_error: Some(message),
                realized_pnl: Decimal::ZERO,
            }
        }
    };
    let _ = done.send(outcome);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Keep an ERRORED record visible for a run that never got its own status
async fn publish_failure(
    coordinator: &Coordinator,
    config: &StrategyConfig,
    task_id: &str,
    message: &str,
    retention: Duration,
) {
    let now = store_time(Utc::now());
    let record = StatusRecord {
        strategy_id: config.strategy_id,
        task_id: task_id.to_string(),
        worker: coordinator.identity().clone(),
        running_state: EngineState::Errored,
        strategy_name: config.name.clone(),
        symbol: config.symbol.clone(),
        current_price: None,
        pending_buys: 0,
        pending_sells: 0,
        open_position_count: 0,
        realized_pnl: Decimal::ZERO,
        daily_pnl: Decimal::ZERO,
        buy_orders: Vec::new(),
        sell_orders: Vec::new(),
        last_error: Some(message.to_string()),
        started_at: now,
        updated_at: now,
        stop_requested_at: None,
    };
    if let Err(e) = coordinator
        .store()
        .put_hash(&status_key(config.strategy_id), &record.to_fields(), Some(retention))
        .await
    {
        warn!("{} status write failed: {}", config.log_prefix(), e);
    }
}

async fn release(coordinator: &Coordinator, lock: &LockHandle) {
    if let Err(e) = coordinator.locks().release(lock).await {
        warn!("[strategy {}] lock release failed: {}", lock.strategy_id(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationSettings;
    use crate::coordinator::WorkerIdentity;
    use crate::exchange::PaperExchangeFactory;
    use crate::store::{MemoryStore, StateStore, StatusReader};
    use crate::worker::StaticCatalog;
    use rust_decimal_macros::dec;

    fn strategy(id: StrategyId) -> StrategyConfig {
        StrategyConfig::new(id, "BTC/USDT", dec!(0.01), 3, dec!(1), dec!(1.5))
    }

    fn runtime(store: &Arc<dyn StateStore>, name: &str, strategies: Vec<StrategyConfig>) -> WorkerRuntime {
        let coordinator = Coordinator::new(
            store.clone(),
            WorkerIdentity::new(name, "host", "127.0.0.1"),
            &CoordinationSettings::default(),
        );
        let engine = EngineConfig {
            stop_poll: Duration::from_millis(100),
            ..EngineConfig::default()
        };
        WorkerRuntime::new(
            coordinator,
            Arc::new(StaticCatalog::new(strategies)),
            Arc::new(PaperExchangeFactory::new(dec!(100))),
            engine,
        )
        .with_heartbeat(Duration::from_secs(1))
    }

    fn spawn(runtime: WorkerRuntime) -> (WorkerHandle, JoinHandle<()>) {
        let handle = runtime.handle();
        (handle, tokio::spawn(runtime.run()))
    }

    fn reader(store: &Arc<dyn StateStore>) -> StatusReader {
        StatusReader::new(store.clone(), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_cleans_up() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let (worker, _task) = spawn(runtime(&store, "w1", vec![strategy(1)]));

        assert!(matches!(worker.start(1).await.unwrap(), StartOutcome::Started { .. }));
        assert_eq!(worker.start(1).await.unwrap(), StartOutcome::AlreadyRunning);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let view = reader(&store).query(1, Utc::now()).await.unwrap();
        assert!(view.running);
        assert_eq!(view.status.unwrap().worker.name, "w1");

        assert_eq!(worker.stop(1).await.unwrap(), StopOutcome::Requested);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(reader(&store).read(1).await.unwrap().is_none());
        assert_eq!(worker.stop(1).await.unwrap(), StopOutcome::NotRunning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_worker_defers_and_stops_remotely() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let (a, _ta) = spawn(runtime(&store, "a", vec![strategy(1)]));
        let (b, _tb) = spawn(runtime(&store, "b", vec![strategy(1)]));

        assert!(matches!(a.start(1).await.unwrap(), StartOutcome::Started { .. }));
        assert_eq!(b.start(1).await.unwrap(), StartOutcome::AlreadyRunning);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(b.stop(1).await.unwrap(), StopOutcome::Requested);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(reader(&store).read(1).await.unwrap().is_none());

        // Free again: the other worker may now take it
        assert!(matches!(b.start(1).await.unwrap(), StartOutcome::Started { .. }));
        b.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_strategy_rejected_elsewhere() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let (worker, _task) = spawn(runtime(&store, "w1", vec![strategy(5).with_worker("w2")]));
        assert_eq!(
            worker.start(5).await.unwrap(),
            StartOutcome::NotAssigned { pinned: "w2".into() }
        );
        assert!(matches!(worker.start(6).await, Err(Error::Catalog(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_limit() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let (worker, _task) = spawn(runtime(&store, "w1", vec![strategy(1), strategy(2)]).with_capacity(1));
        assert!(matches!(worker.start(1).await.unwrap(), StartOutcome::Started { .. }));
        assert_eq!(worker.start(2).await.unwrap(), StartOutcome::NoCapacity);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_exchange_fails_fast() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let mut config = strategy(3);
        config.account.exchange = "binance".into();
        let (worker, _task) = spawn(runtime(&store, "w1", vec![config]));

        let err = worker.start(3).await.unwrap_err();
        assert!(err.is_config());

        let record = reader(&store).read(3).await.unwrap().unwrap();
        assert_eq!(record.running_state, EngineState::Errored);
        assert!(record.last_error.unwrap().contains("binance"));
        let holder = Coordinator::new(
            store.clone(),
            WorkerIdentity::new("probe", "host", "127.0.0.1"),
            &CoordinationSettings::default(),
        )
        .locks()
        .holder(3)
        .await
        .unwrap();
        assert!(holder.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_and_shutdown() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let runtime = runtime(&store, "w1", vec![strategy(1)]).with_control_addr("127.0.0.1:3000");
        let registry = runtime.coordinator.registry().clone();
        let (worker, task) = spawn(runtime);

        worker.start(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let workers = registry.list_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].running, 1);
        assert_eq!(workers[0].control_addr.as_deref(), Some("127.0.0.1:3000"));

        worker.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(registry.list_workers().await.unwrap().is_empty());
        assert!(reader(&store).read(1).await.unwrap().is_none());
    }
}
