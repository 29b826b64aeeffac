//! Risk limits evaluated against price, positions and elapsed time
//!
//! Nothing here is persisted: every verdict is recomputed from the
//! position ledger and its closed-trade history.

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Local, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;

use super::config::{RiskConfig, StopLossAction};
use super::position::{ClosedTrade, Position, PositionTracker};
use super::types::OrderId;

/// Time zone that defines the "day" of the drawdown ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DayBoundary {
    /// Worker's local time zone
    #[default]
    Local,
    Fixed(FixedOffset),
}

impl DayBoundary {
    pub fn date_of(&self, t: DateTime<Utc>) -> NaiveDate {
        match self {
            DayBoundary::Local => t.with_timezone(&Local).date_naive(),
            DayBoundary::Fixed(offset) => t.with_timezone(offset).date_naive(),
        }
    }

    /// Start of the day containing `now`, in UTC
    pub fn day_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            DayBoundary::Local => midnight_of(&now.with_timezone(&Local), 0),
            DayBoundary::Fixed(offset) => midnight_of(&now.with_timezone(offset), 0),
        }
    }

    /// Start of the day after `now`, in UTC
    pub fn next_day_start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            DayBoundary::Local => midnight_of(&now.with_timezone(&Local), 1),
            DayBoundary::Fixed(offset) => midnight_of(&now.with_timezone(offset), 1),
        }
    }
}

/// Midnight `days_ahead` days after the date of `now`
fn midnight_of<Tz: TimeZone>(now: &DateTime<Tz>, days_ahead: u64) -> Option<DateTime<Utc>> {
    let date = now.date_naive().checked_add_days(chrono::Days::new(days_ahead))?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    now.timezone()
        .from_local_datetime(&midnight)
        .earliest()
        .map(|d| d.with_timezone(&Utc))
}

/// Why new buys are currently not allowed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuyBlock {
    MaxOpenPositions { open: usize, max: u32 },
    DailyDrawdown { loss: Decimal, limit: Decimal, until: Option<DateTime<Utc>> },
    LossStreak { losses: u32, until: DateTime<Utc> },
}

impl std::fmt::Display for BuyBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuyBlock::MaxOpenPositions { open, max } => {
                write!(f, "open positions {} reached limit {}", open, max)
            }
            BuyBlock::DailyDrawdown { loss, limit, .. } => {
                write!(f, "daily loss {} reached limit {}", loss, limit)
            }
            BuyBlock::LossStreak { losses, until } => {
                write!(f, "{} losses in window, cooling down until {}", losses, until)
            }
        }
    }
}

/// Outcome of one risk evaluation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RiskVerdict {
    /// How many buy rungs may carry an order this tick
    pub buy_budget: usize,
    pub buy_block: Option<BuyBlock>,
    /// Positions whose stop-loss fired, by source order id
    pub stop_loss: Vec<OrderId>,
    /// Flatten everything and stop the run
    pub halt: bool,
    /// Realized P&L since the start of the current day
    pub daily_pnl: Decimal,
}

impl RiskVerdict {
    pub fn buys_allowed(&self) -> bool {
        self.buy_block.is_none()
    }
}

/// Strategy-level risk checks
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    day: DayBoundary,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            day: DayBoundary::Local,
        }
    }

    pub fn with_day_boundary(mut self, day: DayBoundary) -> Self {
        self.day = day;
        self
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Evaluate all limits in order: open positions, stop-loss, daily drawdown, loss streak
    pub fn evaluate(&self, price: Decimal, tracker: &PositionTracker, now: DateTime<Utc>) -> RiskVerdict {
        let open = tracker.count();
        let max = self.config.max_open_positions;
        let mut buy_block = None;

        if open >= max as usize {
            buy_block = Some(BuyBlock::MaxOpenPositions { open, max });
        }

        let stop_loss: Vec<OrderId> = tracker
            .positions()
            .into_iter()
            .filter(|p| self.stop_loss_due(p, price, now))
            .map(|p| p.source_order_id.clone())
            .collect();

        let daily_pnl = self.daily_realized_pnl(tracker.closed_trades(), now);
        if buy_block.is_none() {
            if let Some(limit) = self.config.max_daily_drawdown {
                let loss = -daily_pnl;
                if loss >= limit {
                    buy_block = Some(BuyBlock::DailyDrawdown {
                        loss,
                        limit,
                        until: self.day.next_day_start(now),
                    });
                }
            }
        }

        if buy_block.is_none() {
            if let Some((losses, until)) = self.loss_streak_cooldown(tracker.closed_trades(), now) {
                buy_block = Some(BuyBlock::LossStreak { losses, until });
            }
        }

        let buy_budget = match buy_block {
            Some(_) => 0,
            None => (max as usize).saturating_sub(open),
        };

        let halt = !stop_loss.is_empty() && self.config.stop_loss_action == StopLossAction::Flatten;

        RiskVerdict {
            buy_budget,
            buy_block,
            stop_loss,
            halt,
            daily_pnl,
        }
    }

    /// Oldest close time any limit still looks at: the start of the current
    /// day, or the start of a loss streak that could still be cooling down
    pub fn history_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let day_start = self.day.day_start(now)?;
        let streak_secs = self.config.loss_window_secs.saturating_add(self.config.cooldown_secs);
        let streak_start = now - ChronoDuration::seconds(streak_secs as i64);
        Some(day_start.min(streak_start))
    }

    /// Whether a position has breached the stop-loss and is old enough to close
    pub fn stop_loss_due(&self, position: &Position, price: Decimal, now: DateTime<Utc>) -> bool {
        let Some(stop_loss) = self.config.stop_loss else {
            return false;
        };
        if position.change_pct(price) > -stop_loss {
            return false;
        }
        let delay = ChronoDuration::seconds(self.config.stop_loss_delay_secs as i64);
        now - position.opened_at >= delay
    }

    /// Sum of realized P&L of trades closed on the same day as `now`
    pub fn daily_realized_pnl(&self, trades: &[ClosedTrade], now: DateTime<Utc>) -> Decimal {
        let today = self.day.date_of(now);
        trades
            .iter()
            .filter(|t| self.day.date_of(t.closed_at) == today)
            .map(|t| t.pnl)
            .sum()
    }

    fn loss_streak_cooldown(&self, trades: &[ClosedTrade], now: DateTime<Utc>) -> Option<(u32, DateTime<Utc>)> {
        let max_losses = self.config.max_loss_count.filter(|n| *n > 0)?;
        let losses: Vec<&ClosedTrade> = trades.iter().filter(|t| t.pnl < Decimal::ZERO).collect();
        if losses.len() < max_losses as usize {
            return None;
        }

        let recent = &losses[losses.len() - max_losses as usize..];
        let first = recent.first()?.closed_at;
        let last = recent.last()?.closed_at;
        let window = ChronoDuration::seconds(self.config.loss_window_secs as i64);
        if last - first > window {
            return None;
        }

        let until = last + ChronoDuration::seconds(self.config.cooldown_secs as i64);
        (now < until).then_some((max_losses, until))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::position::CloseReason;
    use rust_decimal_macros::dec;

    fn utc() -> DayBoundary {
        DayBoundary::Fixed(FixedOffset::east_opt(0).unwrap())
    }

    fn risk(config: RiskConfig) -> RiskManager {
        RiskManager::new(config).with_day_boundary(utc())
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap()
    }

    fn stop_loss_config(delay: u64) -> RiskConfig {
        RiskConfig {
            stop_loss: Some(dec!(5)),
            stop_loss_delay_secs: delay,
            ..RiskConfig::default()
        }
    }

    #[test]
    fn test_stop_loss_delay_boundary() {
        let manager = risk(stop_loss_config(60));
        let t0 = at(12, 0, 0);
        let mut tracker = PositionTracker::new();
        tracker.open("b-1".into(), dec!(100), dec!(1), 1, Decimal::ZERO, t0);
        let position = tracker.get("b-1").unwrap().clone();

        // 10% under water, threshold 5%
        let price = dec!(90);
        assert!(!manager.stop_loss_due(&position, price, t0 + ChronoDuration::seconds(59)));
        assert!(manager.stop_loss_due(&position, price, t0 + ChronoDuration::seconds(61)));

        let verdict = manager.evaluate(price, &tracker, t0 + ChronoDuration::seconds(61));
        assert_eq!(verdict.stop_loss, vec!["b-1".to_string()]);
        assert!(!verdict.halt);
    }

    #[test]
    fn test_stop_loss_requires_breach() {
        let manager = risk(stop_loss_config(0));
        let mut tracker = PositionTracker::new();
        tracker.open("b-1".into(), dec!(100), dec!(1), 1, Decimal::ZERO, at(0, 0, 0));
        let position = tracker.get("b-1").unwrap();

        assert!(!manager.stop_loss_due(position, dec!(95.01), at(1, 0, 0)));
        assert!(manager.stop_loss_due(position, dec!(95), at(1, 0, 0)));
    }

    #[test]
    fn test_flatten_action_halts() {
        let mut config = stop_loss_config(0);
        config.stop_loss_action = StopLossAction::Flatten;
        let manager = risk(config);
        let mut tracker = PositionTracker::new();
        tracker.open("b-1".into(), dec!(100), dec!(1), 1, Decimal::ZERO, at(0, 0, 0));

        let verdict = manager.evaluate(dec!(80), &tracker, at(1, 0, 0));
        assert!(verdict.halt);
    }

    #[test]
    fn test_max_open_positions_blocks_buys_without_closing() {
        let manager = risk(RiskConfig {
            max_open_positions: 2,
            ..RiskConfig::default()
        });
        let mut tracker = PositionTracker::new();
        tracker.open("b-1".into(), dec!(99), dec!(1), 1, Decimal::ZERO, at(0, 0, 0));
        assert_eq!(manager.evaluate(dec!(99), &tracker, at(0, 1, 0)).buy_budget, 1);

        tracker.open("b-2".into(), dec!(98), dec!(1), 2, Decimal::ZERO, at(0, 0, 0));
        let verdict = manager.evaluate(dec!(97), &tracker, at(0, 1, 0));
        assert_eq!(verdict.buy_budget, 0);
        assert!(matches!(verdict.buy_block, Some(BuyBlock::MaxOpenPositions { open: 2, max: 2 })));
        assert!(verdict.stop_loss.is_empty());
    }

    #[test]
    fn test_daily_drawdown_cooldown_until_next_day() {
        let manager = risk(RiskConfig {
            max_daily_drawdown: Some(dec!(10)),
            ..RiskConfig::default()
        });
        let mut tracker = PositionTracker::new();
        tracker.open("b-1".into(), dec!(100), dec!(1), 1, Decimal::ZERO, at(9, 0, 0));
        tracker.close("b-1", dec!(88), dec!(1), Decimal::ZERO, at(10, 0, 0), CloseReason::StopLoss);

        let verdict = manager.evaluate(dec!(90), &tracker, at(11, 0, 0));
        assert_eq!(verdict.daily_pnl, dec!(-12));
        match verdict.buy_block {
            Some(BuyBlock::DailyDrawdown { until, .. }) => {
                assert_eq!(until, Some(Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap()));
            }
            other => panic!("expected drawdown block, got {:?}", other),
        }

        // Next day the realized loss no longer counts
        let tomorrow = Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 1).unwrap();
        let verdict = manager.evaluate(dec!(90), &tracker, tomorrow);
        assert!(verdict.buys_allowed());
        assert_eq!(verdict.daily_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_day_boundary_respects_offset() {
        let plus_two = DayBoundary::Fixed(FixedOffset::east_opt(2 * 3600).unwrap());
        // 23:00 UTC is already the next day at UTC+2
        assert_eq!(
            plus_two.date_of(at(23, 0, 0)),
            NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
        );
    }

    #[test]
    fn test_pruned_history_keeps_verdicts() {
        let manager = risk(RiskConfig {
            max_daily_drawdown: Some(dec!(10)),
            max_loss_count: Some(2),
            loss_window_secs: 300,
            cooldown_secs: 600,
            ..RiskConfig::default()
        });
        let mut tracker = PositionTracker::new();
        // Yesterday's loss, then two losses this morning
        for (id, closed_at) in [
            ("old", Utc.with_ymd_and_hms(2024, 3, 9, 22, 0, 0).unwrap()),
            ("a", at(9, 0, 0)),
            ("b", at(9, 2, 0)),
        ] {
            tracker.open(id.into(), dec!(100), dec!(1), 1, Decimal::ZERO, at(0, 0, 0));
            tracker.close(id, dec!(94), dec!(1), Decimal::ZERO, closed_at, CloseReason::StopLoss);
        }

        let now = at(9, 5, 0);
        assert_eq!(manager.history_cutoff(now), Some(at(0, 0, 0)));
        let before = manager.evaluate(dec!(100), &tracker, now);

        tracker.prune_history(manager.history_cutoff(now).unwrap());
        assert_eq!(tracker.closed_trades().len(), 2);
        assert_eq!(manager.evaluate(dec!(100), &tracker, now), before);
        assert_eq!(before.daily_pnl, dec!(-12));

        // Just after midnight the streak window reaches back past the day start
        let early = Utc.with_ymd_and_hms(2024, 3, 10, 0, 5, 0).unwrap();
        assert_eq!(
            manager.history_cutoff(early),
            Some(Utc.with_ymd_and_hms(2024, 3, 9, 23, 50, 0).unwrap())
        );
    }

    #[test]
    fn test_loss_streak_cooldown() {
        let manager = risk(RiskConfig {
            max_loss_count: Some(2),
            loss_window_secs: 300,
            cooldown_secs: 600,
            ..RiskConfig::default()
        });
        let mut tracker = PositionTracker::new();
        for (id, minute) in [("a", 0), ("b", 2)] {
            tracker.open(id.into(), dec!(100), dec!(1), 1, Decimal::ZERO, at(8, 0, 0));
            tracker.close(id, dec!(99), dec!(1), Decimal::ZERO, at(9, minute, 0), CloseReason::StopLoss);
        }

        let verdict = manager.evaluate(dec!(100), &tracker, at(9, 5, 0));
        assert!(matches!(verdict.buy_block, Some(BuyBlock::LossStreak { losses: 2, .. })));

        let verdict = manager.evaluate(dec!(100), &tracker, at(9, 12, 1));
        assert!(verdict.buys_allowed());
    }
}
