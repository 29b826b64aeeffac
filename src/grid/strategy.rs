//! Grid strategy - desired standing orders and the diff against live orders

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use rust_decimal::Decimal;

use super::config::StrategyConfig;
use super::position::Position;
use super::types::{LiveOrder, OrderId, OrderIntent, OrderSlot};

/// What the engine must do to turn the live book into the desired one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub place: Vec<OrderIntent>,
    pub cancel: Vec<OrderId>,
    pub keep: Vec<OrderId>,
}

/// Pure decision function: (price, positions, live orders) -> order actions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridStrategy {
    grid_levels: u32,
    order_size: Decimal,
    buy_deviation: Decimal,
    sell_deviation: Decimal,
    price_tolerance: Decimal,
    /// Exclusive price range accepted by the market, if any
    price_bounds: Option<(Decimal, Decimal)>,
}

impl GridStrategy {
    pub fn from_config(config: &StrategyConfig) -> Self {
        Self {
            grid_levels: config.grid_levels,
            order_size: config.base_order_size,
            buy_deviation: config.buy_price_deviation,
            sell_deviation: config.sell_price_deviation,
            price_tolerance: config.price_tolerance,
            price_bounds: None,
        }
    }

    pub fn with_price_bounds(mut self, bounds: Option<(Decimal, Decimal)>) -> Self {
        self.price_bounds = bounds;
        self
    }

    /// `price * (1 - buy_deviation% * index)`
    pub fn buy_price(&self, price: Decimal, grid_index: u32) -> Decimal {
        let offset = self.buy_deviation * Decimal::from(grid_index) / Decimal::ONE_HUNDRED;
        price * (Decimal::ONE - offset)
    }

    /// `entry * (1 + sell_deviation%)`
    pub fn sell_price(&self, entry_price: Decimal) -> Decimal {
        entry_price * (Decimal::ONE + self.sell_deviation / Decimal::ONE_HUNDRED)
    }

    /// Buy ladder for rungs `1..=grid_levels`
    pub fn buy_levels(&self, price: Decimal) -> Vec<(u32, Decimal)> {
        (1..=self.grid_levels)
            .map(|i| (i, self.buy_price(price, i)))
            .filter(|(_, p)| self.in_bounds(*p))
            .collect()
    }

    fn in_bounds(&self, price: Decimal) -> bool {
        match self.price_bounds {
            Some((low, high)) => price > low && price < high,
            None => price > Decimal::ZERO,
        }
    }

    /// Full set of standing orders wanted right now.
    ///
    /// Every open position gets its paired sell. Buy rungs not held by a
    /// position get a buy, nearest rung first, up to `buy_budget` orders.
    pub fn desired_orders(&self, price: Decimal, positions: &[&Position], buy_budget: usize) -> Vec<OrderIntent> {
        let held: BTreeSet<u32> = positions.iter().map(|p| p.grid_index).collect();

        let buys = self
            .buy_levels(price)
            .into_iter()
            .filter(|(i, _)| !held.contains(i))
            .take(buy_budget)
            .map(|(i, p)| OrderIntent::buy(i, p, self.order_size));

        let sells = positions.iter().filter_map(|p| {
            let sell = self.sell_price(p.entry_price);
            self.in_bounds(sell).then(|| {
                OrderIntent::sell(p.grid_index, sell, p.quantity, p.source_order_id.clone())
            })
        });

        buys.chain(sells).collect()
    }

    /// Whether a live order at `live_price` is close enough to `desired_price` to keep
    pub fn within_tolerance(&self, live_price: Decimal, desired_price: Decimal) -> bool {
        if desired_price.is_zero() {
            return live_price.is_zero();
        }
        let drift = ((live_price - desired_price) / desired_price).abs() * Decimal::ONE_HUNDRED;
        drift <= self.price_tolerance
    }

    /// Diff desired orders against the live book.
    ///
    /// Orders are matched by slot (buy rung, or the position a sell closes).
    /// A matched order within tolerance is kept untouched; a drifted one is
    /// cancelled and replaced; unmatched live orders are cancelled.
    pub fn reconcile(&self, desired: &[OrderIntent], live: &[LiveOrder]) -> ReconcilePlan {
        let mut by_slot: BTreeMap<OrderSlot, Vec<&LiveOrder>> = BTreeMap::new();
        for order in live {
            by_slot.entry(order.intent.slot()).or_default().push(order);
        }

        let mut plan = ReconcilePlan::default();
        for intent in desired {
            let Some(mut existing) = by_slot.remove(&intent.slot()) else {
                plan.place.push(intent.clone());
                continue;
            };
            existing.sort_by(|a, b| a.order_id.cmp(&b.order_id));

            let keeper = existing
                .iter()
                .position(|o| self.within_tolerance(o.price(), intent.price));
            match keeper {
                Some(idx) => {
                    let kept = existing.remove(idx);
                    plan.keep.push(kept.order_id.clone());
                }
                None => {
                    debug!(
                        "reprice {:?} rung {} -> {}",
                        intent.side, intent.grid_index, intent.price
                    );
                    plan.place.push(intent.clone());
                }
            }
            plan.cancel.extend(existing.into_iter().map(|o| o.order_id.clone()));
        }

        plan.cancel
            .extend(by_slot.into_values().flatten().map(|o| o.order_id.clone()));
        plan.cancel.sort();
        plan.keep.sort();
        plan
    }
}
