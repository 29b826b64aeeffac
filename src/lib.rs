#![deny(unreachable_pub)]
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod errors;
pub mod exchange;
pub mod grid;
pub mod server;
pub mod store;
pub mod worker;

pub use config::Settings;
pub use coordinator::{Coordinator, LockHandle, LockManager, StopOutcome, WorkerIdentity, WorkerRegistry};
pub use engine::{EngineConfig, EngineOutcome, EngineState, ExitReason, TradingEngine};
pub use errors::{Error, ExchangeError, Result, StoreError};
pub use exchange::{ExchangeAdapter, ExchangeFactory, MarketKind, PaperExchange, PaperExchangeFactory};
pub use grid::{GridStrategy, PositionTracker, RiskManager, StrategyConfig};
pub use store::{StateStore, StatusReader, StatusRecord, StatusView};
pub use worker::{FileCatalog, StartOutcome, StrategyCatalog, WorkerCommand, WorkerHandle, WorkerRuntime};
