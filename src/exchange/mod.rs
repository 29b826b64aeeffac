//! Exchange adapter boundary
//!
//! The engine only ever talks to an exchange through [`ExchangeAdapter`].
//! Concrete connectivity lives outside this crate; [`PaperExchange`] is the
//! in-process implementation used by tests and by paper-traded strategies.

pub mod paper;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, ExchangeError, Result};
use crate::grid::{Fill, OrderId, OrderIntent, StrategyConfig};

pub use paper::{PaperCall, PaperExchange, RandomWalk};

/// Result of a single adapter call
pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Capability set of the market behind an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Spot,
    /// Margin or futures account
    Margin,
    /// Binary outcome market, prices are probabilities
    Prediction,
}

impl MarketKind {
    /// Exclusive price range the market accepts
    pub fn price_bounds(&self) -> Option<(Decimal, Decimal)> {
        match self {
            MarketKind::Prediction => Some((Decimal::ZERO, Decimal::ONE)),
            MarketKind::Spot | MarketKind::Margin => None,
        }
    }
}

/// Exchange operations used by the trading loop.
///
/// Every call is fallible; the engine bounds each one with a timeout.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn market_kind(&self) -> MarketKind;

    /// Current reference price
    async fn get_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    /// Place limit orders, returning the exchange ids in input order
    async fn place_orders(&self, symbol: &str, orders: &[OrderIntent]) -> ExchangeResult<Vec<OrderId>>;

    /// Cancel orders; unknown ids are ignored
    async fn cancel_orders(&self, symbol: &str, order_ids: &[OrderId]) -> ExchangeResult<()>;

    /// Fills since the previous poll
    async fn poll_fills(&self, symbol: &str) -> ExchangeResult<Vec<Fill>>;

    /// Ids of every order currently resting for `symbol`
    async fn open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderId>>;

    /// Market-sell `quantity` of the base asset
    async fn close_position(&self, symbol: &str, quantity: Decimal) -> ExchangeResult<Fill>;
}

/// Builds the adapter for a strategy's account
pub trait ExchangeFactory: Send + Sync {
    fn create(&self, config: &StrategyConfig) -> Result<Arc<dyn ExchangeAdapter>>;
}

/// Factory for simulated accounts (`paper` and `paper_prediction`)
#[derive(Debug, Clone)]
pub struct PaperExchangeFactory {
    initial_price: Decimal,
    walk: Option<RandomWalk>,
}

impl PaperExchangeFactory {
    pub fn new(initial_price: Decimal) -> Self {
        Self {
            initial_price,
            walk: None,
        }
    }

    /// Drive every created adapter with a random walk
    pub fn with_random_walk(mut self, walk: RandomWalk) -> Self {
        self.walk = Some(walk);
        self
    }
}

impl ExchangeFactory for PaperExchangeFactory {
    fn create(&self, config: &StrategyConfig) -> Result<Arc<dyn ExchangeAdapter>> {
        let (kind, price) = match config.account.exchange.as_str() {
            "paper" => (MarketKind::Spot, self.initial_price),
            "paper_prediction" => (MarketKind::Prediction, Decimal::new(5, 1)),
            other => {
                return Err(Error::InvalidConfig(format!(
                    "exchange '{}' is not available on this worker",
                    other
                )))
            }
        };

        let mut exchange = PaperExchange::new(price).with_market_kind(kind);
        if let Some(walk) = &self.walk {
            // Bounded markets keep the walk one tick inside their range
            let walk = match kind.price_bounds() {
                Some((low, high)) => {
                    let tick = Decimal::new(1, 2);
                    RandomWalk::new(walk.step_pct, low + tick, high - tick)
                }
                None => walk.clone(),
            };
            exchange = exchange.with_random_walk(walk);
        }
        Ok(Arc::new(exchange))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_prediction_bounds() {
        assert_eq!(MarketKind::Prediction.price_bounds(), Some((dec!(0), dec!(1))));
        assert_eq!(MarketKind::Spot.price_bounds(), None);
    }

    #[test]
    fn test_factory_rejects_unknown_exchange() {
        let factory = PaperExchangeFactory::new(dec!(100));
        let mut config = StrategyConfig::new(1, "BTC/USDT", dec!(1), 3, dec!(1), dec!(1));
        assert_eq!(factory.create(&config).unwrap().market_kind(), MarketKind::Spot);

        config.account.exchange = "paper_prediction".into();
        assert_eq!(factory.create(&config).unwrap().market_kind(), MarketKind::Prediction);

        config.account.exchange = "binance".into();
        let err = factory.create(&config).err().unwrap();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_prediction_walk_stays_in_range() {
        let factory = PaperExchangeFactory::new(dec!(100))
            .with_random_walk(RandomWalk::new(dec!(5), dec!(10), dec!(1000)));
        let mut config = StrategyConfig::new(1, "UP", dec!(1), 3, dec!(1), dec!(1));
        config.account.exchange = "paper_prediction".into();
        let exchange = factory.create(&config).unwrap();
        for _ in 0..50 {
            let price = exchange.get_price("UP").await.unwrap();
            assert!(price > dec!(0) && price < dec!(1));
        }
    }
}
