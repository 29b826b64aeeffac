//! In-memory ledger of the open positions of one running strategy

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::types::OrderId;

/// One filled grid buy that has not been sold yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub grid_index: u32,
    pub opened_at: DateTime<Utc>,
    /// Buy order that opened the position
    pub source_order_id: OrderId,
    /// Quote-currency fee of the entry not yet attributed to a close
    #[serde(default)]
    pub entry_fee: Decimal,
}

impl Position {
    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity
    }

    /// Signed percent move from entry: -5 means 5% under water
    pub fn change_pct(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED
    }
}

/// Why a position (or part of it) was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Paired grid sell filled
    TakeProfit,
    StopLoss,
    /// Risk stop or close-on-stop market exit
    Flatten,
}

/// A realized round trip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub source_order_id: OrderId,
    pub grid_index: u32,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    /// Net of entry and exit fees
    pub pnl: Decimal,
    pub closed_at: DateTime<Utc>,
    pub reason: CloseReason,
}

/// Position ledger; mutated only by the engine that holds the strategy lock
#[derive(Debug, Default)]
pub struct PositionTracker {
    positions: BTreeMap<OrderId, Position>,
    closed: Vec<ClosedTrade>,
    realized_pnl: Decimal,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a filled buy
    pub fn open(
        &mut self,
        source_order_id: OrderId,
        entry_price: Decimal,
        quantity: Decimal,
        grid_index: u32,
        entry_fee: Decimal,
        opened_at: DateTime<Utc>,
    ) -> &Position {
        self.positions
            .entry(source_order_id.clone())
            .or_insert(Position {
                entry_price,
                quantity,
                grid_index,
                opened_at,
                source_order_id,
                entry_fee,
            })
    }

    /// Close up to `quantity` of a position at `exit_price`.
    ///
    /// The position is removed once fully closed. Returns `None` for an
    /// unknown position.
    pub fn close(
        &mut self,
        source_order_id: &str,
        exit_price: Decimal,
        quantity: Decimal,
        exit_fee: Decimal,
        closed_at: DateTime<Utc>,
        reason: CloseReason,
    ) -> Option<ClosedTrade> {
        let position = self.positions.get_mut(source_order_id)?;
        let qty = quantity.min(position.quantity);
        if qty <= Decimal::ZERO {
            return None;
        }

        let entry_fee_share = if position.quantity.is_zero() {
            Decimal::ZERO
        } else {
            position.entry_fee * qty / position.quantity
        };
        let pnl = (exit_price - position.entry_price) * qty - entry_fee_share - exit_fee;

        let trade = ClosedTrade {
            source_order_id: position.source_order_id.clone(),
            grid_index: position.grid_index,
            entry_price: position.entry_price,
            exit_price,
            quantity: qty,
            pnl,
            closed_at,
            reason,
        };

        position.quantity -= qty;
        position.entry_fee -= entry_fee_share;
        if position.quantity.is_zero() {
            self.positions.remove(source_order_id);
        }

        self.realized_pnl += pnl;
        self.closed.push(trade.clone());
        Some(trade)
    }

    pub fn get(&self, source_order_id: &str) -> Option<&Position> {
        self.positions.get(source_order_id)
    }

    /// Open positions ordered by grid rung, then by source order
    pub fn positions(&self) -> Vec<&Position> {
        let mut positions: Vec<&Position> = self.positions.values().collect();
        positions.sort_by(|a, b| {
            a.grid_index
                .cmp(&b.grid_index)
                .then_with(|| a.source_order_id.cmp(&b.source_order_id))
        });
        positions
    }

    pub fn count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn total_quantity(&self) -> Decimal {
        self.positions.values().map(|p| p.quantity).sum()
    }

    pub fn unrealized_pnl(&self, price: Decimal) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl(price)).sum()
    }

    /// Realized P&L over the whole run
    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    /// Forget trade history older than `cutoff`; the running total is kept
    pub fn prune_history(&mut self, cutoff: DateTime<Utc>) {
        self.closed.retain(|t| t.closed_at >= cutoff);
    }
}
