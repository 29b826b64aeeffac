//! Worker identity and the live-worker registry

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::store::status::{parse_millis, store_time};
use crate::store::{worker_key, StateStore, StoreResult, WORKER_KEY_PREFIX};

/// Who is running a strategy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub name: String,
    pub hostname: String,
    pub ip: String,
}

impl WorkerIdentity {
    pub fn new(name: impl Into<String>, hostname: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hostname: hostname.into(),
            ip: ip.into(),
        }
    }

    /// Identity of this process; the name defaults to `worker@{hostname}`
    pub fn detect(name: Option<String>) -> Self {
        let hostname = detect_hostname();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("worker@{}", hostname));
        Self {
            name,
            ip: detect_ip().unwrap_or_else(|| "127.0.0.1".to_string()),
            hostname,
        }
    }
}

fn detect_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Outbound interface address; connecting a UDP socket sends nothing
fn detect_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// One registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub identity: WorkerIdentity,
    /// `host:port` of the worker's control server
    pub control_addr: Option<String>,
    pub capacity: usize,
    pub running: usize,
    pub updated_at: DateTime<Utc>,
}

impl WorkerSnapshot {
    pub fn free_slots(&self) -> usize {
        self.capacity.saturating_sub(self.running)
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        [
            ("name", self.identity.name.clone()),
            ("hostname", self.identity.hostname.clone()),
            ("ip", self.identity.ip.clone()),
            ("control_addr", self.control_addr.clone().unwrap_or_default()),
            ("capacity", self.capacity.to_string()),
            ("running", self.running.to_string()),
            ("updated_at", self.updated_at.timestamp_millis().to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    fn from_fields(fields: &std::collections::HashMap<String, String>) -> Option<Self> {
        let get = |k: &str| fields.get(k).cloned();
        Some(Self {
            identity: WorkerIdentity::new(get("name")?, get("hostname")?, get("ip")?),
            control_addr: get("control_addr").filter(|a| !a.is_empty()),
            capacity: get("capacity")?.parse().ok()?,
            running: get("running")?.parse().ok()?,
            updated_at: parse_millis(&get("updated_at")?)?,
        })
    }
}

/// Registry of live workers, each entry kept alive by its heartbeat TTL
#[derive(Clone)]
pub struct WorkerRegistry {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn heartbeat(&self, snapshot: &WorkerSnapshot) -> StoreResult<()> {
        let mut snapshot = snapshot.clone();
        snapshot.updated_at = store_time(snapshot.updated_at);
        self.store
            .put_hash(&worker_key(&snapshot.identity.name), &snapshot.to_fields(), Some(self.ttl))
            .await
    }

    pub async fn deregister(&self, name: &str) -> StoreResult<()> {
        self.store.delete(&worker_key(name)).await
    }

    /// Every worker whose heartbeat has not expired, ordered by name
    pub async fn list_workers(&self) -> StoreResult<Vec<WorkerSnapshot>> {
        let mut workers = Vec::new();
        for key in self.store.keys_with_prefix(WORKER_KEY_PREFIX).await? {
            let fields = self.store.get_hash(&key).await?;
            if fields.is_empty() {
                continue;
            }
            match WorkerSnapshot::from_fields(&fields) {
                Some(worker) => workers.push(worker),
                None => warn!("Skipping malformed worker entry {}", key),
            }
        }
        workers.sort_by(|a, b| a.identity.name.cmp(&b.identity.name));
        Ok(workers)
    }

    pub async fn get(&self, name: &str) -> StoreResult<Option<WorkerSnapshot>> {
        let fields = self.store.get_hash(&worker_key(name)).await?;
        Ok(WorkerSnapshot::from_fields(&fields))
    }
}
