//! Per-strategy trading loop
//!
//! One [`TradingEngine`] runs one strategy on the worker that holds its
//! lock. Each iteration is sequential: price, fills, risk, orders, status,
//! lock renewal. Exchange and store calls are the only suspension points
//! and each one is bounded by a timeout.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use super::state::EngineState;
use super::EngineConfig;
use crate::coordinator::{Coordinator, LockHandle};
use crate::errors::{Error, ExchangeError};
use crate::exchange::{ExchangeAdapter, ExchangeResult};
use crate::grid::{
    CloseReason, Fill, GridStrategy, LiveOrder, OrderId, OrderSide, OrderSummary, PositionTracker,
    RiskManager, RiskVerdict, StrategyConfig,
};
use crate::store::status::store_time;
use crate::store::{status_key, stop_key, StatusRecord};

/// Why a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    StopRequested,
    LockLost,
    /// Risk flatten completed
    RiskHalt(String),
    Failed(String),
}

/// Summary handed back to the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOutcome {
    pub strategy_id: u64,
    pub task_id: String,
    /// Last state published in the status record
    pub final_state: EngineState,
    pub reason: ExitReason,
    pub last_error: Option<String>,
    pub realized_pnl: Decimal,
}

/// What the loop does after an iteration
enum Tick {
    Continue,
    Halt(String),
}

/// Iteration-level failure classes
enum TickError {
    /// Counted; the loop continues below the threshold
    Transient(ExchangeError),
    LockLost,
    Fatal(Error),
}

async fn bounded<T>(
    timeout: Duration,
    op: &'static str,
    fut: impl Future<Output = ExchangeResult<T>>,
) -> ExchangeResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExchangeError::Timeout { op, timeout }),
    }
}

pub struct TradingEngine {
    config: StrategyConfig,
    settings: EngineConfig,
    exchange: Arc<dyn ExchangeAdapter>,
    coordinator: Coordinator,
    lock: LockHandle,
    stop_rx: watch::Receiver<bool>,
    prefix: String,
    task_id: String,

    strategy: GridStrategy,
    risk: RiskManager,
    tracker: PositionTracker,
    live: BTreeMap<OrderId, LiveOrder>,
    /// Cancelled orders kept until the next fill poll drains their late fills
    retired: BTreeMap<OrderId, LiveOrder>,

    state: EngineState,
    price: Option<Decimal>,
    price_failures: u32,
    iteration_failures: u32,
    last_error: Option<String>,
    last_error_at: Option<Instant>,
    daily_pnl: Decimal,
    started_at: DateTime<Utc>,
    stop_requested_at: Option<DateTime<Utc>>,
}

impl TradingEngine {
    pub fn new(
        config: StrategyConfig,
        exchange: Arc<dyn ExchangeAdapter>,
        coordinator: Coordinator,
        lock: LockHandle,
        stop_rx: watch::Receiver<bool>,
        settings: EngineConfig,
    ) -> Self {
        let strategy = GridStrategy::from_config(&config)
            .with_price_bounds(exchange.market_kind().price_bounds());
        let risk = RiskManager::new(config.risk.clone()).with_day_boundary(settings.day_boundary);
        Self {
            prefix: config.log_prefix(),
            task_id: Uuid::new_v4().to_string(),
            strategy,
            risk,
            tracker: PositionTracker::new(),
            live: BTreeMap::new(),
            retired: BTreeMap::new(),
            state: EngineState::Starting,
            price: None,
            price_failures: 0,
            iteration_failures: 0,
            last_error: None,
            last_error_at: None,
            daily_pnl: Decimal::ZERO,
            started_at: store_time(Utc::now()),
            stop_requested_at: None,
            config,
            settings,
            exchange,
            coordinator,
            lock,
            stop_rx,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Run until stopped, lock lost or failed. Never panics on adapter or
    /// store errors; every exit path ends in STOPPED.
    pub async fn run(mut self) -> EngineOutcome {
        info!("{} starting (task {})", self.prefix, self.task_id);
        self.publish_status().await;

        if let Err(e) = self.startup().await {
            error!("{} failed to start: {}", self.prefix, e);
            return self.finish_errored(e.to_string()).await;
        }

        if self.stop_signalled().await {
            return self.finish_stop(true).await;
        }

        if let Err(e) = self.transition(EngineState::Running) {
            return self.finish_errored(e.to_string()).await;
        }
        self.publish_status().await;

        let interval = self.config.polling_interval();
        loop {
            let tick_started = Instant::now();

            if self.stop_signalled().await {
                return self.finish_stop(false).await;
            }

            match self.iterate().await {
                Ok(Tick::Continue) => {}
                Ok(Tick::Halt(reason)) => return self.finish_risk_halt(reason).await,
                Err(TickError::LockLost) => return self.finish_lock_lost().await,
                Err(TickError::Fatal(e)) => {
                    error!("{} {}", self.prefix, e);
                    return self.finish_errored(e.to_string()).await;
                }
                Err(TickError::Transient(e)) => {
                    self.iteration_failures += 1;
                    warn!(
                        "{} iteration failed ({}/{}): {}",
                        self.prefix, self.iteration_failures, self.settings.max_iteration_failures, e
                    );
                    self.record_error(e.to_string());
                    if self.iteration_failures >= self.settings.max_iteration_failures {
                        let msg = format!(
                            "{} consecutive iteration failures, last: {}",
                            self.iteration_failures, e
                        );
                        return self.finish_errored(msg).await;
                    }
                    // Failed iterations still heartbeat
                    self.publish_status().await;
                    if let Err(TickError::LockLost) = self.renew_lock().await {
                        return self.finish_lock_lost().await;
                    }
                }
            }

            if self.wait_for_next_tick(tick_started + interval).await {
                return self.finish_stop(false).await;
            }
        }
    }

    fn transition(&mut self, to: EngineState) -> Result<(), Error> {
        let next = self.state.transition(to)?;
        info!("{} {} -> {}", self.prefix, self.state, next);
        self.state = next;
        Ok(())
    }

    /// STARTING: validate and clear orders a previous run left behind
    async fn startup(&mut self) -> Result<(), Error> {
        self.config.validate(self.settings.lock_ttl)?;
        let interval = self.config.polling_interval();
        if self.settings.exchange_timeout >= interval {
            return Err(Error::InvalidConfig(format!(
                "exchange timeout {:?} must be shorter than the polling interval {:?}",
                self.settings.exchange_timeout, interval
            )));
        }

        let timeout = self.settings.exchange_timeout;
        let symbol = self.config.symbol.clone();
        let exchange = self.exchange.clone();
        let orphans = self
            .with_retries("open_orders", || bounded(timeout, "open_orders", exchange.open_orders(&symbol)))
            .await?;

        if !orphans.is_empty() {
            info!("{} cancelling {} orphaned orders", self.prefix, orphans.len());
            self.with_retries("cancel_orders", || {
                bounded(timeout, "cancel_orders", exchange.cancel_orders(&symbol, &orphans))
            })
            .await?;
        }
        Ok(())
    }

    /// Retry an exchange call with exponential backoff
    async fn with_retries<T, F, Fut>(&self, op: &str, call: F) -> ExchangeResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ExchangeResult<T>>,
    {
        let attempts = self.settings.flatten_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.settings.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "{} {} failed (attempt {}/{}), retrying in {:?}: {}",
                        self.prefix, op, attempt, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn iterate(&mut self) -> Result<Tick, TickError> {
        let timeout = self.settings.exchange_timeout;
        let symbol = self.config.symbol.clone();

        // 1. price
        match bounded(timeout, "get_price", self.exchange.get_price(&symbol)).await {
            Ok(price) => {
                self.price = Some(price);
                self.price_failures = 0;
            }
            Err(e) => {
                self.price_failures += 1;
                warn!(
                    "{} price fetch failed ({}/{}): {}",
                    self.prefix, self.price_failures, self.settings.max_price_failures, e
                );
                self.record_error(format!("price fetch failed: {}", e));
                if self.price_failures >= self.settings.max_price_failures {
                    return Err(TickError::Fatal(Error::Exchange(e)));
                }
            }
        }
        let Some(price) = self.price else {
            // Nothing to trade against yet
            self.publish_status().await;
            self.renew_lock().await?;
            return Ok(Tick::Continue);
        };

        // 2. fills
        self.drain_fills().await.map_err(TickError::Transient)?;

        // 3. risk, evaluated before the order diff so blocked buys are never placed
        let now = Utc::now();
        if let Some(cutoff) = self.risk.history_cutoff(now) {
            self.tracker.prune_history(cutoff);
        }
        let verdict = self.risk.evaluate(price, &self.tracker, now);
        self.daily_pnl = verdict.daily_pnl;
        if let Some(block) = &verdict.buy_block {
            debug!("{} buys blocked: {}", self.prefix, block);
        }
        if verdict.halt {
            let reason = format!(
                "stop-loss hit on {} position(s) at {}, flattening",
                verdict.stop_loss.len(),
                price
            );
            return Ok(Tick::Halt(reason));
        }
        if !verdict.stop_loss.is_empty() {
            self.close_stopped_positions(&verdict).await.map_err(TickError::Transient)?;
        }

        // 4. desired vs live
        let desired = self
            .strategy
            .desired_orders(price, &self.tracker.positions(), verdict.buy_budget);
        let live: Vec<LiveOrder> = self.live.values().cloned().collect();
        let plan = self.strategy.reconcile(&desired, &live);

        if !plan.cancel.is_empty() {
            bounded(timeout, "cancel_orders", self.exchange.cancel_orders(&symbol, &plan.cancel))
                .await
                .map_err(TickError::Transient)?;
            for id in &plan.cancel {
                self.retire_order(id);
            }
        }
        if !plan.place.is_empty() {
            let ids = bounded(timeout, "place_orders", self.exchange.place_orders(&symbol, &plan.place))
                .await
                .map_err(TickError::Transient)?;
            for (id, intent) in ids.into_iter().zip(plan.place.into_iter()) {
                self.live.insert(id.clone(), LiveOrder::new(id, intent, now));
            }
        }

        // 5. status
        self.iteration_failures = 0;
        self.expire_last_error();
        self.log_summary(price);
        self.publish_status().await;

        // 6. heartbeat
        self.renew_lock().await?;
        Ok(Tick::Continue)
    }

    /// Apply every reported fill, then settle the orders cancelled before this poll
    async fn drain_fills(&mut self) -> ExchangeResult<()> {
        let timeout = self.settings.exchange_timeout;
        let symbol = self.config.symbol.clone();
        let fills = bounded(timeout, "poll_fills", self.exchange.poll_fills(&symbol)).await?;
        for fill in fills {
            self.apply_fill(fill);
        }
        self.settle_retired();
        Ok(())
    }

    /// Account a fill against the order that produced it
    fn apply_fill(&mut self, fill: Fill) {
        let order = match self.live.get_mut(&fill.order_id) {
            Some(order) => order,
            None => match self.retired.get_mut(&fill.order_id) {
                Some(order) => {
                    debug!("{} late fill for cancelled order {}", self.prefix, fill.order_id);
                    order
                }
                None => {
                    warn!("{} fill for untracked order {}", self.prefix, fill.order_id);
                    return;
                }
            },
        };
        let before = order.filled_quantity;
        order.apply_fill(&fill);
        let filled = order.filled_quantity - before;
        if filled.is_zero() {
            return;
        }

        match order.side() {
            OrderSide::Buy => {
                if order.is_filled() {
                    let done = self
                        .live
                        .remove(&fill.order_id)
                        .or_else(|| self.retired.remove(&fill.order_id));
                    if let Some(order) = done {
                        self.open_position(order);
                    }
                }
            }
            OrderSide::Sell => {
                let Some(source) = order.intent.related_order_id.clone() else {
                    return;
                };
                let done = order.is_filled();
                // Quote fee of this fill; base fees are not charged on sells
                let fee = if fill.fee_in_base { Decimal::ZERO } else { fill.fee };
                if let Some(trade) =
                    self.tracker
                        .close(&source, fill.price, filled, fee, fill.filled_at, CloseReason::TakeProfit)
                {
                    info!(
                        "{} take-profit rung {} {} @ {} pnl {}",
                        self.prefix, trade.grid_index, trade.quantity, trade.exit_price, trade.pnl
                    );
                }
                if done {
                    self.live.remove(&fill.order_id);
                    self.retired.remove(&fill.order_id);
                }
            }
        }
    }

    /// Move a cancelled order out of the live book; its fills may still arrive
    fn retire_order(&mut self, order_id: &str) {
        if let Some(order) = self.live.remove(order_id) {
            self.retired.insert(order.order_id.clone(), order);
        }
    }

    /// Filled quantity of cancelled buys becomes positions
    fn settle_retired(&mut self) {
        for order in std::mem::take(&mut self.retired).into_values() {
            if order.side() == OrderSide::Buy {
                self.open_position(order);
            }
        }
    }

    /// Open a position from the filled part of a buy
    fn open_position(&mut self, order: LiveOrder) {
        if order.filled_quantity.is_zero() {
            return;
        }
        let (quantity, entry_fee) = if order.fee_in_base {
            (order.filled_quantity - order.fees, Decimal::ZERO)
        } else {
            (order.filled_quantity, order.fees)
        };
        if quantity <= Decimal::ZERO {
            return;
        }
        let opened_at = order.last_fill_at.unwrap_or_else(Utc::now);
        let position = self.tracker.open(
            order.order_id.clone(),
            order.avg_fill_price(),
            quantity,
            order.intent.grid_index,
            entry_fee,
            opened_at,
        );
        info!(
            "{} bought rung {} {} @ {}",
            self.prefix, position.grid_index, position.quantity, position.entry_price
        );
    }

    /// Market-close the positions whose stop-loss fired and keep running
    async fn close_stopped_positions(&mut self, verdict: &RiskVerdict) -> ExchangeResult<()> {
        for source in &verdict.stop_loss {
            self.close_position(source, CloseReason::StopLoss).await?;
        }
        Ok(())
    }

    /// Cancel the paired sell and market-close one position
    async fn close_position(&mut self, source: &str, reason: CloseReason) -> ExchangeResult<()> {
        let timeout = self.settings.exchange_timeout;
        let symbol = self.config.symbol.clone();

        let exits: Vec<OrderId> = self
            .live
            .values()
            .filter(|o| o.intent.related_order_id.as_deref() == Some(source))
            .map(|o| o.order_id.clone())
            .collect();
        if !exits.is_empty() {
            bounded(timeout, "cancel_orders", self.exchange.cancel_orders(&symbol, &exits)).await?;
            for id in &exits {
                self.retire_order(id);
            }
            // The exit may have filled before the cancel landed
            self.drain_fills().await?;
        }

        let Some(quantity) = self.tracker.get(source).map(|p| p.quantity) else {
            return Ok(());
        };
        let fill = bounded(timeout, "close_position", self.exchange.close_position(&symbol, quantity)).await?;
        let fee = if fill.fee_in_base { Decimal::ZERO } else { fill.fee };
        if let Some(trade) = self
            .tracker
            .close(source, fill.price, quantity, fee, fill.filled_at, reason)
        {
            warn!(
                "{} closed rung {} {} @ {} ({:?}) pnl {}",
                self.prefix, trade.grid_index, trade.quantity, trade.exit_price, reason, trade.pnl
            );
        }
        Ok(())
    }

    /// Cancel every standing order and, if `close_positions`, close every position
    async fn flatten_once(&mut self, close_positions: bool) -> ExchangeResult<()> {
        let timeout = self.settings.exchange_timeout;
        let symbol = self.config.symbol.clone();

        let ids: Vec<OrderId> = self.live.keys().cloned().collect();
        if !ids.is_empty() {
            bounded(timeout, "cancel_orders", self.exchange.cancel_orders(&symbol, &ids)).await?;
            for id in &ids {
                self.retire_order(id);
            }
        }
        self.drain_fills().await?;

        if close_positions {
            let sources: Vec<OrderId> = self
                .tracker
                .positions()
                .iter()
                .map(|p| p.source_order_id.clone())
                .collect();
            for source in sources {
                self.close_position(&source, CloseReason::Flatten).await?;
            }
        }
        Ok(())
    }

    /// Flatten with bounded retries and exponential backoff
    async fn flatten(&mut self, close_positions: bool) -> ExchangeResult<()> {
        let attempts = self.settings.flatten_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.flatten_once(close_positions).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    let delay = self.settings.retry_base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        "{} flatten failed (attempt {}/{}), retrying in {:?}: {}",
                        self.prefix, attempt, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn renew_lock(&self) -> Result<(), TickError> {
        match self.coordinator.locks().renew(&self.lock).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TickError::LockLost),
            Err(e) => {
                error!("{} lock renewal failed: {}", self.prefix, e);
                Err(TickError::LockLost)
            }
        }
    }

    /// Stop requested in-process or through the store
    async fn stop_signalled(&mut self) -> bool {
        if *self.stop_rx.borrow() {
            self.note_stop_request(None);
            return true;
        }
        self.remote_stop_requested().await
    }

    async fn remote_stop_requested(&mut self) -> bool {
        match self.coordinator.stop_requested(self.config.strategy_id).await {
            Ok(Some(at)) => {
                self.note_stop_request(Some(at));
                true
            }
            Ok(None) => false,
            Err(e) => {
                debug!("{} stop check failed: {}", self.prefix, e);
                false
            }
        }
    }

    fn note_stop_request(&mut self, at: Option<DateTime<Utc>>) {
        if self.stop_requested_at.is_none() {
            info!("{} stop requested", self.prefix);
            self.stop_requested_at = Some(at.unwrap_or_else(|| store_time(Utc::now())));
        }
    }

    /// Sleep until `deadline`, waking early for a stop. Returns true on stop.
    async fn wait_for_next_tick(&mut self, deadline: Instant) -> bool {
        let poll_every = self.settings.stop_poll;
        let mut poll = tokio::time::interval_at(Instant::now() + poll_every, poll_every);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return false,
                changed = self.stop_rx.changed() => {
                    // A dropped sender means the supervisor is gone
                    if changed.is_err() || *self.stop_rx.borrow() {
                        self.note_stop_request(None);
                        return true;
                    }
                }
                _ = poll.tick() => {
                    if self.remote_stop_requested().await {
                        return true;
                    }
                }
            }
        }
    }

    fn record_error(&mut self, message: String) {
        self.last_error = Some(message);
        self.last_error_at = Some(Instant::now());
    }

    fn expire_last_error(&mut self) {
        if let Some(at) = self.last_error_at {
            if at.elapsed() >= self.settings.error_retention {
                debug!("{} clearing last error", self.prefix);
                self.last_error = None;
                self.last_error_at = None;
            }
        }
    }

    fn log_summary(&self, price: Decimal) {
        let (buys, sells) = self.order_counts();
        info!(
            "{} price {} | buys {} sells {} | positions {} | realized {}",
            self.prefix,
            price,
            buys,
            sells,
            self.tracker.count(),
            self.tracker.realized_pnl()
        );
    }

    fn order_counts(&self) -> (usize, usize) {
        let buys = self.live.values().filter(|o| o.side() == OrderSide::Buy).count();
        (buys, self.live.len() - buys)
    }

    fn orders_of(&self, side: OrderSide) -> Vec<OrderSummary> {
        let mut orders: Vec<OrderSummary> = self
            .live
            .values()
            .filter(|o| o.side() == side)
            .map(LiveOrder::summary)
            .collect();
        orders.sort_by(|a, b| a.grid_index.cmp(&b.grid_index).then(b.price.cmp(&a.price)));
        orders
    }

    fn snapshot(&self) -> StatusRecord {
        let (pending_buys, pending_sells) = self.order_counts();
        StatusRecord {
            strategy_id: self.config.strategy_id,
            task_id: self.task_id.clone(),
            worker: self.coordinator.identity().clone(),
            running_state: self.state,
            strategy_name: self.config.name.clone(),
            symbol: self.config.symbol.clone(),
            current_price: self.price,
            pending_buys,
            pending_sells,
            open_position_count: self.tracker.count(),
            realized_pnl: self.tracker.realized_pnl(),
            daily_pnl: self.daily_pnl,
            buy_orders: self.orders_of(OrderSide::Buy),
            sell_orders: self.orders_of(OrderSide::Sell),
            last_error: self.last_error.clone(),
            started_at: self.started_at,
            updated_at: store_time(Utc::now()),
            stop_requested_at: self.stop_requested_at,
        }
    }

    /// Upsert the status record. Failures are logged, never fatal.
    async fn publish_status(&self) {
        self.write_status(self.settings.lock_ttl).await;
    }

    async fn write_status(&self, ttl: Duration) {
        let record = self.snapshot();
        let key = status_key(self.config.strategy_id);
        if let Err(e) = self
            .coordinator
            .store()
            .put_hash(&key, &record.to_fields(), Some(ttl))
            .await
        {
            warn!("{} status write failed: {}", self.prefix, e);
        }
    }

    async fn release_lock(&self) {
        if let Err(e) = self.coordinator.locks().release(&self.lock).await {
            warn!("{} lock release failed: {}", self.prefix, e);
        }
    }

    async fn clear_stop_key(&self) {
        if let Err(e) = self.coordinator.store().delete(&stop_key(self.config.strategy_id)).await {
            debug!("{} stop key cleanup failed: {}", self.prefix, e);
        }
    }

    fn outcome(&self, final_state: EngineState, reason: ExitReason) -> EngineOutcome {
        EngineOutcome {
            strategy_id: self.config.strategy_id,
            task_id: self.task_id.clone(),
            final_state,
            reason,
            last_error: self.last_error.clone(),
            realized_pnl: self.tracker.realized_pnl(),
        }
    }

    /// Move to `to`, falling back to a direct STOPPED
    fn force(&mut self, to: EngineState) {
        if self.transition(to).is_err() {
            self.state = to;
        }
    }

    /// Normal stop: cancel standing orders, optionally flatten, then STOPPED
    async fn finish_stop(mut self, before_running: bool) -> EngineOutcome {
        if !before_running {
            self.force(EngineState::Stopping);
            self.publish_status().await;
        }

        let close_positions = self.config.close_positions_on_stop;
        if let Err(e) = self.flatten(close_positions).await {
            if close_positions {
                let msg = format!("failed to close positions on stop: {}", e);
                error!("{} {}", self.prefix, msg);
                return self.finish_errored(msg).await;
            }
            // Orders left behind are cancelled by the next run's startup
            warn!("{} could not cancel standing orders: {}", self.prefix, e);
        }

        self.force(EngineState::Stopped);
        if let Err(e) = self
            .coordinator
            .store()
            .delete(&status_key(self.config.strategy_id))
            .await
        {
            warn!("{} status cleanup failed: {}", self.prefix, e);
        }
        self.clear_stop_key().await;
        self.release_lock().await;
        info!("{} stopped, realized {}", self.prefix, self.tracker.realized_pnl());
        self.outcome(EngineState::Stopped, ExitReason::StopRequested)
    }

    /// Risk flatten: STOPPING, close everything, STOPPED with the reason kept visible
    async fn finish_risk_halt(mut self, reason: String) -> EngineOutcome {
        warn!("{} risk stop: {}", self.prefix, reason);
        self.force(EngineState::Stopping);
        self.record_error(reason.clone());
        self.publish_status().await;

        if let Err(e) = self.flatten(true).await {
            let msg = format!("{}; flatten failed after {} attempts: {}", reason, self.settings.flatten_attempts, e);
            error!("{} {}", self.prefix, msg);
            return self.finish_errored(msg).await;
        }

        self.force(EngineState::Stopped);
        self.write_status(self.settings.status_retention).await;
        self.clear_stop_key().await;
        self.release_lock().await;
        self.outcome(EngineState::Stopped, ExitReason::RiskHalt(reason))
    }

    /// ERRORED: keep the status with its error for the retention window, then STOPPED
    async fn finish_errored(mut self, message: String) -> EngineOutcome {
        self.force(EngineState::Errored);
        self.record_error(message.clone());
        self.write_status(self.settings.status_retention).await;
        error!("{} errored: {}", self.prefix, message);

        // Standing orders are left to the next run's orphan cleanup
        self.force(EngineState::Stopped);
        self.clear_stop_key().await;
        self.release_lock().await;
        self.outcome(EngineState::Errored, ExitReason::Failed(message))
    }

    /// Lock lost: stop locally without touching the exchange or the store
    async fn finish_lock_lost(mut self) -> EngineOutcome {
        error!("{} lock lost, stopping without cleanup", self.prefix);
        self.force(EngineState::Stopped);
        self.outcome(EngineState::Stopped, ExitReason::LockLost)
    }
}
