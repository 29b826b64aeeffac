//! Grid trading decision logic
//!
//! Everything in this module is synchronous and free of I/O. A running
//! strategy composes these pieces inside [`crate::engine::TradingEngine`]:
//!
//! - [`config`] - Strategy configuration and validation
//! - [`types`] - Orders, fills and order intents
//! - [`position`] - Open-position ledger and realized P&L
//! - [`risk`] - Stop-loss, position limit, drawdown and loss-streak checks
//! - [`strategy`] - Desired standing orders and the reconcile diff
//!
//! # Example
//!
//! ```rust,ignore
//! use grid_worker::grid::{GridStrategy, PositionTracker, RiskManager, StrategyConfig};
//!
//! let config = StrategyConfig::new(1, "BTC/USDT", dec!(0.01), 3, dec!(1), dec!(1.5));
//! let strategy = GridStrategy::from_config(&config);
//! let risk = RiskManager::new(config.risk.clone());
//! let tracker = PositionTracker::new();
//!
//! let verdict = risk.evaluate(price, &tracker, Utc::now());
//! let desired = strategy.desired_orders(price, &tracker.positions(), verdict.buy_budget);
//! let plan = strategy.reconcile(&desired, &live_orders);
//! ```

pub mod config;
pub mod position;
pub mod risk;
pub mod strategy;
pub mod types;

pub use config::{AccountConfig, RiskConfig, StopLossAction, StrategyConfig};
pub use position::{CloseReason, ClosedTrade, Position, PositionTracker};
pub use risk::{BuyBlock, DayBoundary, RiskManager, RiskVerdict};
pub use strategy::{GridStrategy, ReconcilePlan};
pub use types::{Fill, LiveOrder, OrderId, OrderIntent, OrderSide, OrderSlot, OrderSummary, StrategyId};
