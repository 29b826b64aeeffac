//! Core data types for grid trading

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Persistence-layer identity of a strategy
pub type StrategyId = u64;

/// Exchange-assigned order id
pub type OrderId = String;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

/// A standing order the strategy wants on the book.
///
/// Produced fresh every tick and consumed immediately by the reconcile step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Grid rung (1 = closest to the reference price)
    pub grid_index: u32,
    /// For paired sells: the buy order that opened the position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_order_id: Option<OrderId>,
}

impl OrderIntent {
    pub fn buy(grid_index: u32, price: Decimal, quantity: Decimal) -> Self {
        Self {
            side: OrderSide::Buy,
            price,
            quantity,
            grid_index,
            related_order_id: None,
        }
    }

    pub fn sell(grid_index: u32, price: Decimal, quantity: Decimal, related: OrderId) -> Self {
        Self {
            side: OrderSide::Sell,
            price,
            quantity,
            grid_index,
            related_order_id: Some(related),
        }
    }

    /// Reconcile key: buys are keyed by rung, sells by the position they close
    pub fn slot(&self) -> OrderSlot {
        match (&self.side, &self.related_order_id) {
            (OrderSide::Sell, Some(related)) => OrderSlot::Exit(related.clone()),
            _ => OrderSlot::Rung(self.side, self.grid_index),
        }
    }
}

/// Identity of an order within the grid, independent of its price
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OrderSlot {
    Rung(OrderSide, u32),
    Exit(OrderId),
}

/// An order resting on the exchange that this engine placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveOrder {
    pub order_id: OrderId,
    pub intent: OrderIntent,
    pub filled_quantity: Decimal,
    /// Notional of the fills so far, for the average fill price
    pub filled_notional: Decimal,
    pub fees: Decimal,
    pub fee_in_base: bool,
    pub placed_at: DateTime<Utc>,
    /// Exchange time of the latest fill
    pub last_fill_at: Option<DateTime<Utc>>,
}

impl LiveOrder {
    pub fn new(order_id: OrderId, intent: OrderIntent, placed_at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            intent,
            filled_quantity: Decimal::ZERO,
            filled_notional: Decimal::ZERO,
            fees: Decimal::ZERO,
            fee_in_base: false,
            placed_at,
            last_fill_at: None,
        }
    }

    pub fn side(&self) -> OrderSide {
        self.intent.side
    }

    pub fn price(&self) -> Decimal {
        self.intent.price
    }

    pub fn remaining(&self) -> Decimal {
        (self.intent.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    pub fn is_filled(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Accumulate a (possibly partial) fill
    pub fn apply_fill(&mut self, fill: &Fill) {
        let qty = fill.quantity.min(self.remaining());
        self.filled_quantity += qty;
        self.filled_notional += qty * fill.price;
        self.fees += fill.fee;
        self.fee_in_base |= fill.fee_in_base;
        self.last_fill_at = self.last_fill_at.max(Some(fill.filled_at));
    }

    /// Volume-weighted fill price, falling back to the limit price
    pub fn avg_fill_price(&self) -> Decimal {
        if self.filled_quantity.is_zero() {
            self.intent.price
        } else {
            self.filled_notional / self.filled_quantity
        }
    }

    pub fn summary(&self) -> OrderSummary {
        OrderSummary {
            price: self.intent.price,
            quantity: self.remaining(),
            grid_index: self.intent.grid_index,
        }
    }
}

/// Execution report from the exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(default)]
    pub fee: Decimal,
    /// Fee deducted from the received base asset rather than paid in quote
    #[serde(default)]
    pub fee_in_base: bool,
    pub filled_at: DateTime<Utc>,
}

/// Compact order view published in the status record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub price: Decimal,
    pub quantity: Decimal,
    pub grid_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(qty: Decimal, price: Decimal) -> Fill {
        Fill {
            order_id: "o-1".into(),
            side: OrderSide::Buy,
            price,
            quantity: qty,
            fee: dec!(0.01),
            fee_in_base: false,
            filled_at: Utc::now(),
        }
    }

    #[test]
    fn test_partial_then_full_fill() {
        let mut order = LiveOrder::new(
            "o-1".into(),
            OrderIntent::buy(1, dec!(99), dec!(2)),
            Utc::now(),
        );

        let first = fill(dec!(1), dec!(98));
        order.apply_fill(&first);
        assert!(!order.is_filled());
        assert_eq!(order.last_fill_at, Some(first.filled_at));
        assert_eq!(order.remaining(), dec!(1));

        order.apply_fill(&fill(dec!(1), dec!(100)));
        assert!(order.is_filled());
        assert_eq!(order.avg_fill_price(), dec!(99));
        assert_eq!(order.fees, dec!(0.02));
    }

    #[test]
    fn test_overfill_is_clamped() {
        let mut order = LiveOrder::new(
            "o-1".into(),
            OrderIntent::buy(1, dec!(99), dec!(1)),
            Utc::now(),
        );
        order.apply_fill(&fill(dec!(3), dec!(99)));
        assert_eq!(order.filled_quantity, dec!(1));
        assert_eq!(order.remaining(), Decimal::ZERO);
    }

    #[test]
    fn test_slots() {
        let buy = OrderIntent::buy(2, dec!(98), dec!(1));
        let sell = OrderIntent::sell(2, dec!(99), dec!(1), "b-7".into());
        assert_eq!(buy.slot(), OrderSlot::Rung(OrderSide::Buy, 2));
        assert_eq!(sell.slot(), OrderSlot::Exit("b-7".into()));
    }
}
