//! In-process [`StateStore`] for tests and single-worker setups.
//!
//! Expiry uses `tokio::time::Instant`, so TTL behaviour follows a paused
//! test clock.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{StateStore, StoreResult};
use crate::errors::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn live<'a>(entries: &'a mut BTreeMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| !e.is_live(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Decode(format!("key {} holds the wrong type", key))
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn renew_if_owner(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(entry) if matches!(&entry.value, Value::Str(v) if v == value) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_owner(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut entries = self.entries.lock().await;
        let owned = matches!(
            live(&mut entries, key),
            Some(Entry { value: Value::Str(v), .. }) if v == value
        );
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(v), .. }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut entries = self.entries.lock().await;
        Ok(live(&mut entries, key)
            .and_then(|e| e.expires_at)
            .map(|t| t.saturating_duration_since(Instant::now())))
    }

    async fn put_hash(&self, key: &str, fields: &[(String, String)], ttl: Option<Duration>) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        if fields.is_empty() {
            entries.remove(key);
            return Ok(());
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Hash(fields.iter().cloned().collect()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get_hash(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            None => Ok(HashMap::new()),
            Some(Entry { value: Value::Hash(h), .. }) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, e| e.is_live(now));
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_racing_set_if_absent_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set_if_absent("lock:strategy:1", &format!("w{}", i), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "a", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!store.set_if_absent("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "b", Duration::from_secs(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_owner_checks() {
        let store = MemoryStore::new();
        store.set_if_absent("k", "me", Duration::from_secs(10)).await.unwrap();

        assert!(!store.renew_if_owner("k", "you", Duration::from_secs(10)).await.unwrap());
        assert!(!store.delete_if_owner("k", "you").await.unwrap());
        assert!(store.renew_if_owner("k", "me", Duration::from_secs(10)).await.unwrap());
        assert!(store.delete_if_owner("k", "me").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_hash_replace_and_prefix_scan() {
        let store = MemoryStore::new();
        let fields = vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())];
        store.put_hash("worker:info:w1", &fields, None).await.unwrap();
        store
            .put_hash("worker:info:w1", &[("a".to_string(), "3".to_string())], None)
            .await
            .unwrap();
        store.set("other", "x", None).await.unwrap();

        let hash = store.get_hash("worker:info:w1").await.unwrap();
        assert_eq!(hash.len(), 1);
        assert_eq!(hash["a"], "3");
        assert_eq!(
            store.keys_with_prefix("worker:info:").await.unwrap(),
            vec!["worker:info:w1".to_string()]
        );
        assert!(store.get("worker:info:w1").await.is_err());
    }
}
