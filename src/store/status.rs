//! Status record schema and the read-side freshness query

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{status_key, StateStore, StoreResult};
use crate::coordinator::WorkerIdentity;
use crate::engine::EngineState;
use crate::errors::StoreError;
use crate::grid::{OrderSummary, StrategyId};

/// Snapshot of one running strategy, stored as a flat field map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub strategy_id: StrategyId,
    pub task_id: String,
    pub worker: WorkerIdentity,
    pub running_state: EngineState,
    pub strategy_name: String,
    pub symbol: String,
    pub current_price: Option<Decimal>,
    pub pending_buys: usize,
    pub pending_sells: usize,
    pub open_position_count: usize,
    pub realized_pnl: Decimal,
    pub daily_pnl: Decimal,
    pub buy_orders: Vec<OrderSummary>,
    pub sell_orders: Vec<OrderSummary>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stop_requested_at: Option<DateTime<Utc>>,
}

/// Truncate to the millisecond resolution the store keeps
pub fn store_time(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(t.timestamp_millis()).single().unwrap_or(t)
}

pub fn parse_millis(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>().ok().and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn orders(o: &[OrderSummary]) -> String {
    serde_json::to_string(o).unwrap_or_else(|_| "[]".into())
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(ToString::to_string).unwrap_or_default()
}

struct Fields<'a>(&'a HashMap<String, String>);

impl<'a> Fields<'a> {
    fn raw(&self, name: &str) -> Result<&'a str, StoreError> {
        self.0
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| StoreError::Decode(format!("status field {} missing", name)))
    }

    fn parse<T: FromStr>(&self, name: &str) -> Result<T, StoreError> {
        let raw = self.raw(name)?;
        raw.parse()
            .map_err(|_| StoreError::Decode(format!("status field {}: bad value {:?}", name, raw)))
    }

    fn optional<T: FromStr>(&self, name: &str) -> Result<Option<T>, StoreError> {
        match self.0.get(name).map(String::as_str) {
            None | Some("") => Ok(None),
            Some(_) => self.parse(name).map(Some),
        }
    }

    fn time(&self, name: &str) -> Result<DateTime<Utc>, StoreError> {
        parse_millis(self.raw(name)?)
            .ok_or_else(|| StoreError::Decode(format!("status field {}: bad timestamp", name)))
    }

    fn optional_time(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        match self.0.get(name).map(String::as_str) {
            None | Some("") => Ok(None),
            Some(_) => self.time(name).map(Some),
        }
    }

    fn orders(&self, name: &str) -> Result<Vec<OrderSummary>, StoreError> {
        match self.0.get(name).map(String::as_str) {
            None | Some("") => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| StoreError::Decode(format!("status field {}: {}", name, e))),
        }
    }
}

impl StatusRecord {
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let fields = [
            ("strategy_id", self.strategy_id.to_string()),
            ("task_id", self.task_id.clone()),
            ("worker_name", self.worker.name.clone()),
            ("worker_hostname", self.worker.hostname.clone()),
            ("worker_ip", self.worker.ip.clone()),
            ("running_state", self.running_state.as_str().to_string()),
            ("strategy_name", self.strategy_name.clone()),
            ("symbol", self.symbol.clone()),
            ("current_price", opt(&self.current_price)),
            ("pending_buys", self.pending_buys.to_string()),
            ("pending_sells", self.pending_sells.to_string()),
            ("open_position_count", self.open_position_count.to_string()),
            ("realized_pnl", self.realized_pnl.to_string()),
            ("daily_pnl", self.daily_pnl.to_string()),
            ("buy_orders", orders(&self.buy_orders)),
            ("sell_orders", orders(&self.sell_orders)),
            ("last_error", opt(&self.last_error)),
            ("started_at", self.started_at.timestamp_millis().to_string()),
            ("updated_at", self.updated_at.timestamp_millis().to_string()),
            (
                "stop_requested_at",
                opt(&self.stop_requested_at.map(|t| t.timestamp_millis())),
            ),
        ];
        fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    pub fn from_fields(map: &HashMap<String, String>) -> Result<Self, StoreError> {
        let f = Fields(map);
        Ok(Self {
            strategy_id: f.parse("strategy_id")?,
            task_id: f.raw("task_id")?.to_string(),
            worker: WorkerIdentity {
                name: f.raw("worker_name")?.to_string(),
                hostname: f.raw("worker_hostname")?.to_string(),
                ip: f.raw("worker_ip")?.to_string(),
            },
            running_state: f.parse("running_state")?,
            strategy_name: f.raw("strategy_name").unwrap_or_default().to_string(),
            symbol: f.raw("symbol")?.to_string(),
            current_price: f.optional("current_price")?,
            pending_buys: f.parse("pending_buys")?,
            pending_sells: f.parse("pending_sells")?,
            open_position_count: f.parse("open_position_count")?,
            realized_pnl: f.optional("realized_pnl")?.unwrap_or_default(),
            daily_pnl: f.optional("daily_pnl")?.unwrap_or_default(),
            buy_orders: f.orders("buy_orders")?,
            sell_orders: f.orders("sell_orders")?,
            last_error: f.optional("last_error")?,
            started_at: f.time("started_at")?,
            updated_at: f.time("updated_at")?,
            stop_requested_at: f.optional_time("stop_requested_at")?,
        })
    }

    /// Running and written within the freshness window
    pub fn is_running(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        self.running_state == EngineState::Running && !self.is_stale(now, freshness)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        let window = ChronoDuration::milliseconds(freshness.as_millis() as i64);
        now - self.updated_at > window
    }
}

/// Answer to "where and how is strategy S running"
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusView {
    pub strategy_id: StrategyId,
    pub running: bool,
    pub stale: bool,
    pub status: Option<StatusRecord>,
}

/// Read-side access to status records
#[derive(Clone)]
pub struct StatusReader {
    store: Arc<dyn StateStore>,
    freshness: Duration,
}

impl StatusReader {
    pub fn new(store: Arc<dyn StateStore>, freshness: Duration) -> Self {
        Self { store, freshness }
    }

    /// Raw record, `None` when absent
    pub async fn read(&self, strategy_id: StrategyId) -> StoreResult<Option<StatusRecord>> {
        let fields = self.store.get_hash(&status_key(strategy_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        StatusRecord::from_fields(&fields).map(Some)
    }

    pub async fn query(&self, strategy_id: StrategyId, now: DateTime<Utc>) -> StoreResult<StatusView> {
        let status = self.read(strategy_id).await?;
        let stale = status.as_ref().is_some_and(|s| s.is_stale(now, self.freshness));
        let running = status.as_ref().is_some_and(|s| s.is_running(now, self.freshness));
        Ok(StatusView {
            strategy_id,
            running,
            stale,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).single().unwrap()
    }

    fn record() -> StatusRecord {
        StatusRecord {
            strategy_id: 9,
            task_id: "task-1".into(),
            worker: WorkerIdentity {
                name: "w1".into(),
                hostname: "host-a".into(),
                ip: "10.0.0.5".into(),
            },
            running_state: EngineState::Running,
            strategy_name: "btc grid".into(),
            symbol: "BTC/USDT".into(),
            current_price: Some(dec!(100.25)),
            pending_buys: 2,
            pending_sells: 1,
            open_position_count: 1,
            realized_pnl: dec!(1.47),
            daily_pnl: dec!(-0.5),
            buy_orders: vec![OrderSummary {
                price: dec!(99),
                quantity: dec!(0.1),
                grid_index: 1,
            }],
            sell_orders: vec![],
            last_error: None,
            started_at: at(1_700_000_000_000),
            updated_at: at(1_700_000_060_123),
            stop_requested_at: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_store() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let original = record();
        store
            .put_hash(&status_key(9), &original.to_fields(), None)
            .await
            .unwrap();

        let reader = StatusReader::new(store, Duration::from_secs(30));
        assert_eq!(reader.read(9).await.unwrap(), Some(original));
    }

    #[test]
    fn test_round_trip_optional_fields() {
        let mut original = record();
        original.current_price = None;
        original.last_error = Some("price fetch failed: timeout".into());
        original.stop_requested_at = Some(at(1_700_000_061_000));
        original.running_state = EngineState::Errored;

        let map: HashMap<String, String> = original.to_fields().into_iter().collect();
        assert_eq!(StatusRecord::from_fields(&map).unwrap(), original);
    }

    #[tokio::test]
    async fn test_stale_record_is_not_running() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let record = record();
        store.put_hash(&status_key(9), &record.to_fields(), None).await.unwrap();
        let reader = StatusReader::new(store, Duration::from_secs(30));

        let fresh = reader.query(9, record.updated_at + ChronoDuration::seconds(30)).await.unwrap();
        assert!(fresh.running);

        let stale = reader.query(9, record.updated_at + ChronoDuration::seconds(31)).await.unwrap();
        assert!(!stale.running);
        assert!(stale.stale);
        assert_eq!(stale.status.unwrap().running_state, EngineState::Running);
    }

    #[tokio::test]
    async fn test_absent_and_non_running_states() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let reader = StatusReader::new(store.clone(), Duration::from_secs(30));
        let absent = reader.query(1, Utc::now()).await.unwrap();
        assert!(!absent.running && absent.status.is_none());

        let mut stopping = record();
        stopping.running_state = EngineState::Stopping;
        store.put_hash(&status_key(9), &stopping.to_fields(), None).await.unwrap();
        assert!(!reader.query(9, stopping.updated_at).await.unwrap().running);
    }

    #[test]
    fn test_missing_field_is_decode_error() {
        let mut map: HashMap<String, String> = record().to_fields().into_iter().collect();
        map.remove("updated_at");
        assert!(matches!(StatusRecord::from_fields(&map), Err(StoreError::Decode(_))));
    }
}
