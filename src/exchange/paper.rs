//! Paper exchange
//!
//! Simulates order execution locally: resting limit orders fill at their
//! limit price once the simulated price crosses them. Price moves either by
//! explicit `set_price` calls (tests) or by a bounded random walk (paper runs).

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::debug;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::{ExchangeAdapter, ExchangeResult, MarketKind};
use crate::errors::ExchangeError;
use crate::grid::{Fill, OrderId, OrderIntent, OrderSide};

/// Adapter calls that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperCall {
    Price,
    Place,
    Cancel,
    Fills,
    OpenOrders,
    Close,
}

/// Random price walk applied on every price read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomWalk {
    /// Maximum move per read, in percent
    pub step_pct: Decimal,
    pub floor: Decimal,
    pub ceiling: Decimal,
}

impl RandomWalk {
    pub fn new(step_pct: Decimal, floor: Decimal, ceiling: Decimal) -> Self {
        Self {
            step_pct,
            floor,
            ceiling,
        }
    }

    fn next(&self, price: Decimal) -> Decimal {
        // Uniform in [-1, 1] with three decimals
        let unit = Decimal::new(rand::thread_rng().gen_range(-1000i64..=1000), 3);
        let moved = price * (Decimal::ONE + unit * self.step_pct / Decimal::ONE_HUNDRED);
        moved.round_dp(8).max(self.floor).min(self.ceiling)
    }
}

/// Entries kept per journal (placed, cancelled, closed)
const JOURNAL_LIMIT: usize = 1_000;

fn record<T>(journal: &mut VecDeque<T>, entry: T) {
    if journal.len() >= JOURNAL_LIMIT {
        journal.pop_front();
    }
    journal.push_back(entry);
}

#[derive(Debug)]
struct RestingOrder {
    symbol: String,
    intent: OrderIntent,
}

#[derive(Debug, Default)]
struct PaperBook {
    price: Decimal,
    resting: BTreeMap<OrderId, RestingOrder>,
    pending_fills: Vec<Fill>,
    next_id: u64,
    failing: HashSet<PaperCall>,
    placed: VecDeque<OrderIntent>,
    cancelled: VecDeque<OrderId>,
    closed: VecDeque<Decimal>,
}

impl PaperBook {
    fn next_order_id(&mut self) -> OrderId {
        self.next_id += 1;
        format!("paper-{:06}", self.next_id)
    }

    fn fail_if(&self, call: PaperCall) -> ExchangeResult<()> {
        if self.failing.contains(&call) {
            return Err(ExchangeError::Transient(format!("simulated {:?} failure", call)));
        }
        Ok(())
    }

    /// Fill every resting order the current price has crossed
    fn match_orders(&mut self, fee_rate: Decimal, fee_in_base: bool) {
        let price = self.price;
        let crossed: Vec<OrderId> = self
            .resting
            .iter()
            .filter(|(_, o)| match o.intent.side {
                OrderSide::Buy => price <= o.intent.price,
                OrderSide::Sell => price >= o.intent.price,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for order_id in crossed {
            let Some(order) = self.resting.remove(&order_id) else {
                continue;
            };
            let intent = order.intent;
            debug!(
                "paper fill {} {} {} @ {}",
                order.symbol,
                intent.side.as_str(),
                intent.quantity,
                intent.price
            );
            self.pending_fills.push(simulated_fill(
                order_id,
                intent.side,
                intent.price,
                intent.quantity,
                fee_rate,
                fee_in_base,
            ));
        }
    }
}

fn simulated_fill(
    order_id: OrderId,
    side: OrderSide,
    price: Decimal,
    quantity: Decimal,
    fee_rate: Decimal,
    fee_in_base: bool,
) -> Fill {
    // Base-asset fees are only charged on what a buy receives
    let base_fee = fee_in_base && side == OrderSide::Buy;
    let fee = if base_fee {
        quantity * fee_rate
    } else {
        price * quantity * fee_rate
    };
    Fill {
        order_id,
        side,
        price,
        quantity,
        fee,
        fee_in_base: base_fee,
        filled_at: Utc::now(),
    }
}

/// In-process simulated exchange
#[derive(Debug)]
pub struct PaperExchange {
    kind: MarketKind,
    walk: Option<RandomWalk>,
    fee_rate: Decimal,
    fee_in_base: bool,
    latency: Duration,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(price: Decimal) -> Self {
        Self {
            kind: MarketKind::Spot,
            walk: None,
            fee_rate: Decimal::ZERO,
            fee_in_base: false,
            latency: Duration::ZERO,
            book: Mutex::new(PaperBook {
                price,
                ..PaperBook::default()
            }),
        }
    }

    pub fn with_market_kind(mut self, kind: MarketKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_random_walk(mut self, walk: RandomWalk) -> Self {
        self.walk = Some(walk);
        self
    }

    /// Charge `rate` on every fill, in the base asset for buys when `in_base`
    pub fn with_fees(mut self, rate: Decimal, in_base: bool) -> Self {
        self.fee_rate = rate;
        self.fee_in_base = in_base;
        self
    }

    /// Delay every call, for timeout tests
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Move the price and fill whatever it crosses
    pub async fn set_price(&self, price: Decimal) {
        let mut book = self.book.lock().await;
        book.price = price;
        book.match_orders(self.fee_rate, self.fee_in_base);
    }

    pub async fn set_failing(&self, call: PaperCall, failing: bool) {
        let mut book = self.book.lock().await;
        if failing {
            book.failing.insert(call);
        } else {
            book.failing.remove(&call);
        }
    }

    /// Put an order on the book as if a previous run had left it there
    pub async fn seed_order(&self, symbol: &str, intent: OrderIntent) -> OrderId {
        let mut book = self.book.lock().await;
        let id = book.next_order_id();
        book.resting.insert(
            id.clone(),
            RestingOrder {
                symbol: symbol.to_string(),
                intent,
            },
        );
        id
    }

    /// Most recent placed intents, oldest first
    pub async fn placed_orders(&self) -> Vec<OrderIntent> {
        self.book.lock().await.placed.iter().cloned().collect()
    }

    pub async fn cancelled_orders(&self) -> Vec<OrderId> {
        self.book.lock().await.cancelled.iter().cloned().collect()
    }

    /// Quantities of the most recent market closes
    pub async fn closed_quantities(&self) -> Vec<Decimal> {
        self.book.lock().await.closed.iter().copied().collect()
    }

    pub async fn resting_orders(&self) -> Vec<(OrderId, OrderIntent)> {
        self.book
            .lock()
            .await
            .resting
            .iter()
            .map(|(id, o)| (id.clone(), o.intent.clone()))
            .collect()
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn market_kind(&self) -> MarketKind {
        self.kind
    }

    async fn get_price(&self, _symbol: &str) -> ExchangeResult<Decimal> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.fail_if(PaperCall::Price)?;
        if let Some(walk) = &self.walk {
            book.price = walk.next(book.price);
            book.match_orders(self.fee_rate, self.fee_in_base);
        }
        Ok(book.price)
    }

    async fn place_orders(&self, symbol: &str, orders: &[OrderIntent]) -> ExchangeResult<Vec<OrderId>> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.fail_if(PaperCall::Place)?;

        if let Some((low, high)) = self.kind.price_bounds() {
            if let Some(bad) = orders.iter().find(|o| o.price <= low || o.price >= high) {
                return Err(ExchangeError::Rejected(format!(
                    "price {} outside ({}, {})",
                    bad.price, low, high
                )));
            }
        }

        let mut ids = Vec::with_capacity(orders.len());
        for intent in orders {
            let id = book.next_order_id();
            record(&mut book.placed, intent.clone());
            book.resting.insert(
                id.clone(),
                RestingOrder {
                    symbol: symbol.to_string(),
                    intent: intent.clone(),
                },
            );
            ids.push(id);
        }
        book.match_orders(self.fee_rate, self.fee_in_base);
        Ok(ids)
    }

    async fn cancel_orders(&self, _symbol: &str, order_ids: &[OrderId]) -> ExchangeResult<()> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.fail_if(PaperCall::Cancel)?;
        for id in order_ids {
            if book.resting.remove(id).is_some() {
                record(&mut book.cancelled, id.clone());
            }
        }
        Ok(())
    }

    async fn poll_fills(&self, _symbol: &str) -> ExchangeResult<Vec<Fill>> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.fail_if(PaperCall::Fills)?;
        Ok(std::mem::take(&mut book.pending_fills))
    }

    async fn open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OrderId>> {
        self.simulate_latency().await;
        let book = self.book.lock().await;
        book.fail_if(PaperCall::OpenOrders)?;
        Ok(book
            .resting
            .iter()
            .filter(|(_, o)| o.symbol == symbol)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn close_position(&self, _symbol: &str, quantity: Decimal) -> ExchangeResult<Fill> {
        self.simulate_latency().await;
        let mut book = self.book.lock().await;
        book.fail_if(PaperCall::Close)?;
        let id = book.next_order_id();
        record(&mut book.closed, quantity);
        Ok(simulated_fill(
            id,
            OrderSide::Sell,
            book.price,
            quantity,
            self.fee_rate,
            self.fee_in_base,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_orders_fill_when_price_crosses() {
        let exchange = PaperExchange::new(dec!(100));
        let ids = exchange
            .place_orders(
                "BTC/USDT",
                &[
                    OrderIntent::buy(1, dec!(99), dec!(1)),
                    OrderIntent::buy(2, dec!(98), dec!(1)),
                ],
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert!(exchange.poll_fills("BTC/USDT").await.unwrap().is_empty());

        exchange.set_price(dec!(98.5)).await;
        let fills = exchange.poll_fills("BTC/USDT").await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order_id, ids[0]);
        assert_eq!(fills[0].price, dec!(99));

        // Drained
        assert!(exchange.poll_fills("BTC/USDT").await.unwrap().is_empty());
        assert_eq!(exchange.open_orders("BTC/USDT").await.unwrap(), vec![ids[1].clone()]);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let exchange = PaperExchange::new(dec!(100));
        exchange.set_failing(PaperCall::Price, true).await;
        assert!(matches!(
            exchange.get_price("X").await,
            Err(ExchangeError::Transient(_))
        ));
        exchange.set_failing(PaperCall::Price, false).await;
        assert_eq!(exchange.get_price("X").await.unwrap(), dec!(100));
    }

    #[tokio::test]
    async fn test_base_fee_on_buy() {
        let exchange = PaperExchange::new(dec!(100)).with_fees(dec!(0.001), true);
        exchange
            .place_orders("X", &[OrderIntent::buy(1, dec!(100), dec!(2))])
            .await
            .unwrap();
        let fills = exchange.poll_fills("X").await.unwrap();
        assert_eq!(fills[0].fee, dec!(0.002));
        assert!(fills[0].fee_in_base);
    }

    #[tokio::test]
    async fn test_prediction_rejects_out_of_range() {
        let exchange = PaperExchange::new(dec!(0.5)).with_market_kind(MarketKind::Prediction);
        let result = exchange
            .place_orders("UP", &[OrderIntent::buy(1, dec!(1.2), dec!(1))])
            .await;
        assert!(matches!(result, Err(ExchangeError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_journals_are_capped() {
        let exchange = PaperExchange::new(dec!(100));
        let orders: Vec<OrderIntent> = (0..JOURNAL_LIMIT + 5)
            .map(|i| OrderIntent::buy(1, dec!(50) - Decimal::from(i % 10), dec!(1)))
            .collect();
        exchange.place_orders("X", &orders).await.unwrap();

        let placed = exchange.placed_orders().await;
        assert_eq!(placed.len(), JOURNAL_LIMIT);
        assert_eq!(placed.last(), orders.last());
        // Resting orders are not affected by the cap
        assert_eq!(exchange.resting_orders().await.len(), JOURNAL_LIMIT + 5);
    }

    #[test]
    fn test_random_walk_stays_in_bounds() {
        let walk = RandomWalk::new(dec!(50), dec!(90), dec!(110));
        let mut price = dec!(100);
        for _ in 0..200 {
            price = walk.next(price);
            assert!(price >= dec!(90) && price <= dec!(110));
        }
    }
}
