//! Strategy configuration as stored by the persistence layer

use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

use super::types::StrategyId;

/// What to do when a position breaches its stop-loss
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossAction {
    /// Market-close only the breached positions and keep trading
    #[default]
    ClosePosition,
    /// Cancel everything, close every position and stop the strategy
    Flatten,
}

/// Exchange account the strategy trades on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Adapter name, e.g. "paper", "binance", "polymarket_updown15m"
    pub exchange: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub testnet: bool,
}

impl AccountConfig {
    pub fn paper() -> Self {
        Self {
            exchange: "paper".to_string(),
            api_key: None,
            api_secret: None,
            testnet: false,
        }
    }

    /// Paper adapters (`paper`, `paper_prediction`, ...) trade without keys
    pub fn is_simulated(&self) -> bool {
        self.exchange.starts_with("paper")
    }

    pub fn has_credentials(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.api_key) && present(&self.api_secret)
    }
}

/// Risk limits, all evaluated fresh every iteration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Loss percentage (e.g. 5 = 5%) that closes a position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    /// Minimum position age before the stop-loss may fire
    #[serde(default)]
    pub stop_loss_delay_secs: u64,
    #[serde(default)]
    pub stop_loss_action: StopLossAction,
    /// New buys are blocked at this many open positions
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    /// Realized loss (quote currency) per local day that triggers the cooldown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_daily_drawdown: Option<Decimal>,
    /// Losing trades within `loss_window_secs` that trigger a cooldown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loss_count: Option<u32>,
    #[serde(default = "default_loss_window")]
    pub loss_window_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss: None,
            stop_loss_delay_secs: 0,
            stop_loss_action: StopLossAction::default(),
            max_open_positions: default_max_open_positions(),
            max_daily_drawdown: None,
            max_loss_count: None,
            loss_window_secs: default_loss_window(),
            cooldown_secs: default_cooldown(),
        }
    }
}

fn default_max_open_positions() -> u32 {
    10
}

fn default_loss_window() -> u64 {
    300
}

fn default_cooldown() -> u64 {
    3_600
}

/// Immutable configuration of one strategy run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy_id: StrategyId,

    #[serde(default)]
    pub name: String,

    /// Trading pair, e.g. "BTC/USDT"
    pub symbol: String,

    pub account: AccountConfig,

    /// Quantity of every grid buy
    pub base_order_size: Decimal,

    /// Number of buy rungs below the reference price
    pub grid_levels: u32,

    /// Percent spacing between buy rungs (1 = 1%)
    pub buy_price_deviation: Decimal,

    /// Percent markup of a paired sell over its entry
    pub sell_price_deviation: Decimal,

    /// Loop period
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,

    /// Percent drift tolerated before a standing order is repriced
    #[serde(default = "default_price_tolerance")]
    pub price_tolerance: Decimal,

    #[serde(default)]
    pub risk: RiskConfig,

    /// Only this worker may run the strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,

    /// Flatten positions on a normal stop as well
    #[serde(default)]
    pub close_positions_on_stop: bool,
}

fn default_polling_interval() -> u64 {
    1_000
}

fn default_price_tolerance() -> Decimal {
    Decimal::new(5, 1)
}

impl StrategyConfig {
    /// Create a paper-traded configuration with default risk limits
    pub fn new(
        strategy_id: StrategyId,
        symbol: impl Into<String>,
        base_order_size: Decimal,
        grid_levels: u32,
        buy_price_deviation: Decimal,
        sell_price_deviation: Decimal,
    ) -> Self {
        Self {
            strategy_id,
            name: String::new(),
            symbol: symbol.into(),
            account: AccountConfig::paper(),
            base_order_size,
            grid_levels,
            buy_price_deviation,
            sell_price_deviation,
            polling_interval_ms: default_polling_interval(),
            price_tolerance: default_price_tolerance(),
            risk: RiskConfig::default(),
            worker_name: None,
            close_positions_on_stop: false,
        }
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_price_tolerance(mut self, tolerance: Decimal) -> Self {
        self.price_tolerance = tolerance;
        self
    }

    pub fn with_risk(mut self, risk: RiskConfig) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker_name = Some(worker.into());
        self
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn stop_loss_delay(&self) -> Duration {
        Duration::from_secs(self.risk.stop_loss_delay_secs)
    }

    /// Log prefix used by every component of a run
    pub fn log_prefix(&self) -> String {
        format!("[strategy {} {}]", self.strategy_id, self.symbol)
    }

    /// Validate the configuration against the lock TTL it will run under
    pub fn validate(&self, lock_ttl: Duration) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.symbol.trim().is_empty() {
            return invalid("symbol must not be empty".into());
        }
        if self.grid_levels == 0 {
            return invalid("grid_levels must be at least 1".into());
        }
        if self.base_order_size <= Decimal::ZERO {
            return invalid(format!("base_order_size must be positive, got {}", self.base_order_size));
        }
        if self.buy_price_deviation <= Decimal::ZERO || self.sell_price_deviation <= Decimal::ZERO {
            return invalid("price deviations must be positive".into());
        }
        // The deepest rung must still be a positive price
        if self.buy_price_deviation * Decimal::from(self.grid_levels) >= Decimal::ONE_HUNDRED {
            return invalid(format!(
                "{} levels at {}% reach a non-positive price",
                self.grid_levels, self.buy_price_deviation
            ));
        }
        if self.price_tolerance < Decimal::ZERO {
            return invalid("price_tolerance must not be negative".into());
        }
        if self.polling_interval_ms == 0 {
            return invalid("polling_interval_ms must be positive".into());
        }
        if self.polling_interval() >= lock_ttl / 2 {
            return invalid(format!(
                "polling interval {:?} must be shorter than half the lock TTL {:?}",
                self.polling_interval(),
                lock_ttl
            ));
        }
        if let Some(stop_loss) = self.risk.stop_loss {
            if stop_loss <= Decimal::ZERO || stop_loss >= Decimal::ONE_HUNDRED {
                return invalid(format!("stop_loss must be in (0, 100), got {}", stop_loss));
            }
        }
        if let Some(limit) = self.risk.max_daily_drawdown {
            if limit <= Decimal::ZERO {
                return invalid("max_daily_drawdown must be positive".into());
            }
        }
        if !self.account.is_simulated() && !self.account.has_credentials() {
            return invalid(format!(
                "account for exchange '{}' has no API credentials",
                self.account.exchange
            ));
        }
        Ok(())
    }

    /// Load a single configuration from a JSON file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const TTL: Duration = Duration::from_secs(86_400);

    fn config() -> StrategyConfig {
        StrategyConfig::new(7, "BTC/USDT", dec!(0.01), 3, dec!(1), dec!(1.5))
    }

    #[test]
    fn test_valid_config() {
        assert!(config().validate(TTL).is_ok());
    }

    #[test]
    fn test_rejects_zero_levels() {
        let mut c = config();
        c.grid_levels = 0;
        assert!(matches!(c.validate(TTL), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_ladder_below_zero() {
        let mut c = config();
        c.grid_levels = 100;
        assert!(c.validate(TTL).is_err());
    }

    #[test]
    fn test_polling_interval_must_fit_in_ttl() {
        let c = config().with_polling_interval(Duration::from_secs(10));
        assert!(c.validate(Duration::from_secs(20)).is_err());
        assert!(c.validate(Duration::from_secs(21)).is_ok());
    }

    #[test]
    fn test_live_exchange_requires_credentials() {
        let mut c = config();
        c.account.exchange = "binance".into();
        assert!(c.validate(TTL).is_err());

        c.account.api_key = Some("key".into());
        c.account.api_secret = Some("  ".into());
        assert!(c.validate(TTL).is_err());

        c.account.api_secret = Some("secret".into());
        assert!(c.validate(TTL).is_ok());
    }

    #[test]
    fn test_paper_adapters_need_no_credentials() {
        let mut c = config();
        c.account.exchange = "paper_prediction".into();
        assert!(c.validate(TTL).is_ok());
    }

    #[test]
    fn test_json_defaults() {
        let json = r#"{
            "strategy_id": 3,
            "symbol": "ETH/USDT",
            "account": {"exchange": "paper"},
            "base_order_size": "0.5",
            "grid_levels": 4,
            "buy_price_deviation": "0.8",
            "sell_price_deviation": "1.2",
            "risk": {"stop_loss": "5", "stop_loss_delay_secs": 60, "stop_loss_action": "flatten"}
        }"#;
        let c: StrategyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.polling_interval_ms, 1_000);
        assert_eq!(c.price_tolerance, dec!(0.5));
        assert_eq!(c.risk.max_open_positions, 10);
        assert_eq!(c.risk.stop_loss_action, StopLossAction::Flatten);
        assert_eq!(c.stop_loss_delay(), Duration::from_secs(60));
    }
}
