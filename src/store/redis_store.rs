//! Redis implementation of [`StateStore`]

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult, Script};

use super::{StateStore, StoreResult};
use crate::errors::StoreError;

const RENEW_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const DELETE_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Store backed by one multiplexed Redis connection
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    op_timeout: Duration,
    renew_script: Script,
    delete_script: Script,
}

impl RedisStore {
    /// Open a connection and verify it with a round-trip
    pub async fn connect(url: &str, op_timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let conn = match tokio::time::timeout(op_timeout, client.get_multiplexed_async_connection()).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(StoreError::Timeout {
                    op: "connect",
                    timeout: op_timeout,
                })
            }
        };
        info!("Connected to state store at {}", url);

        Ok(Self {
            conn,
            op_timeout,
            renew_script: Script::new(RENEW_IF_OWNER),
            delete_script: Script::new(DELETE_IF_OWNER),
        })
    }

    /// Bound a store call by the operation timeout
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => {
                debug!("store op {} timed out", op);
                Err(StoreError::Timeout {
                    op,
                    timeout: self.op_timeout,
                })
            }
        }
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl StateStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = self
            .bounded("set_if_absent", async {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(millis(ttl))
                    .query_async::<_, Option<String>>(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn renew_if_owner(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .bounded("renew_if_owner", async {
                self.renew_script
                    .key(key)
                    .arg(value)
                    .arg(millis(ttl))
                    .invoke_async::<_, i64>(&mut conn)
                    .await
            })
            .await?;
        Ok(renewed == 1)
    }

    async fn delete_if_owner(&self, key: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .bounded("delete_if_owner", async {
                self.delete_script
                    .key(key)
                    .arg(value)
                    .invoke_async::<_, i64>(&mut conn)
                    .await
            })
            .await?;
        Ok(deleted == 1)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded("get", async {
            redis::cmd("GET").arg(key).query_async::<_, Option<String>>(&mut conn).await
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.bounded("set", async {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(millis(ttl));
            }
            cmd.query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let pttl: i64 = self
            .bounded("ttl", async {
                redis::cmd("PTTL").arg(key).query_async::<_, i64>(&mut conn).await
            })
            .await?;
        // -2: missing, -1: no expiry
        Ok((pttl >= 0).then(|| Duration::from_millis(pttl as u64)))
    }

    async fn put_hash(&self, key: &str, fields: &[(String, String)], ttl: Option<Duration>) -> StoreResult<()> {
        if fields.is_empty() {
            return self.delete(key).await;
        }
        let mut conn = self.conn.clone();
        self.bounded("put_hash", async {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("DEL")
                .arg(key)
                .ignore()
                .cmd("HSET")
                .arg(key)
                .arg(fields)
                .ignore();
            if let Some(ttl) = ttl {
                pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl)).ignore();
            }
            pipe.query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn get_hash(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        self.bounded("get_hash", async {
            redis::cmd("HGETALL")
                .arg(key)
                .query_async::<_, HashMap<String, String>>(&mut conn)
                .await
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        self.bounded("delete", async {
            redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await
        })
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        self.bounded("keys_with_prefix", async {
            let mut cursor: u64 = 0;
            let mut keys = Vec::new();
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn)
                    .await?;
                keys.extend(batch);
                cursor = next;
                if cursor == 0 {
                    break;
                }
            }
            keys.sort();
            keys.dedup();
            Ok::<_, redis::RedisError>(keys)
        })
        .await
    }
}
