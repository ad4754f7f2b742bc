//! Redis-backed counter store.
//!
//! Uses a multiplexed `ConnectionManager` (reconnects transparently) and
//! namespaces every key with a configurable prefix. Batches run inside
//! `MULTI`/`EXEC`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::{CounterStore, StoreError, StoreOp, StoreResult};

/// [`CounterStore`] over a Redis server.
#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
    prefix: Arc<String>,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn unavailable(op: &str, err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(format!("redis {op}: {err}"))
}

fn ttl_secs(ttl: Duration) -> u64 {
    // EXPIRE takes whole seconds; never round a positive TTL down to zero.
    ttl.as_secs().max(u64::from(!ttl.is_zero()))
}

impl RedisCounterStore {
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|err| unavailable("client", err))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| unavailable("connect", err))?;
        Ok(Self {
            manager,
            prefix: Arc::new(key_prefix.into()),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.prefix, key)
        }
    }

    fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> StoreResult<Option<T>> {
        raw.map(|s| {
            s.parse::<T>()
                .map_err(|_| StoreError::Corrupt(format!("{key} holds non-numeric value {s:?}")))
        })
        .transpose()
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.manager.clone();
        redis::cmd("INCRBY")
            .arg(self.namespaced(key))
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("incrby", err))
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64> {
        let mut conn = self.manager.clone();
        redis::cmd("INCRBYFLOAT")
            .arg(self.namespaced(key))
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("incrbyfloat", err))
    }

    async fn get_int(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("get", err))?;
        Self::parse(key, raw)
    }

    async fn get_float(&self, key: &str) -> StoreResult<Option<f64>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("get", err))?;
        Self::parse(key, raw)
    }

    async fn set_int(&self, key: &str, value: i64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .arg("KEEPTTL")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| unavailable("set", err))
    }

    async fn set_float(&self, key: &str, value: f64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.namespaced(key))
            .arg(value)
            .arg("KEEPTTL")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| unavailable("set", err))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("ZADD")
            .arg(self.namespaced(key))
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| unavailable("zadd", err))
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        redis::cmd("ZREMRANGEBYSCORE")
            .arg(self.namespaced(key))
            .arg(score_bound(min))
            .arg(score_bound(max))
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("zremrangebyscore", err))
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        redis::cmd("ZCARD")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("zcard", err))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        redis::cmd("ZCOUNT")
            .arg(self.namespaced(key))
            .arg(score_bound(min))
            .arg(score_bound(max))
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("zcount", err))
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.manager.clone();
        redis::cmd("ZRANGE")
            .arg(self.namespaced(key))
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("zrange", err))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let updated: i64 = redis::cmd("EXPIRE")
            .arg(self.namespaced(key))
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("expire", err))?;
        Ok(updated == 1)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.manager.clone();
        let millis: i64 = redis::cmd("PTTL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("pttl", err))?;
        // -2: missing key, -1: no expiry.
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("del", err))?;
        Ok(removed > 0)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        redis::cmd("HSET")
            .arg(self.namespaced(key))
            .arg(fields)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| unavailable("hset", err))
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        redis::cmd("HSETNX")
            .arg(self.namespaced(key))
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("hsetnx", err))
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        redis::cmd("HGETALL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await
            .map_err(|err| unavailable("hgetall", err))
    }

    async fn apply_batch(&self, ops: &[StoreOp]) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in ops {
            match op {
                StoreOp::IncrBy { key, delta } => {
                    pipe.cmd("INCRBY").arg(self.namespaced(key)).arg(*delta).ignore();
                }
                StoreOp::IncrByFloat { key, delta } => {
                    pipe.cmd("INCRBYFLOAT")
                        .arg(self.namespaced(key))
                        .arg(*delta)
                        .ignore();
                }
                StoreOp::HashSet { key, fields } if !fields.is_empty() => {
                    pipe.cmd("HSET")
                        .arg(self.namespaced(key))
                        .arg(fields.as_slice())
                        .ignore();
                }
                StoreOp::HashSet { .. } => {}
                StoreOp::Expire { key, ttl } => {
                    pipe.cmd("EXPIRE")
                        .arg(self.namespaced(key))
                        .arg(ttl_secs(*ttl))
                        .ignore();
                }
                StoreOp::Delete { key } => {
                    pipe.cmd("DEL").arg(self.namespaced(key)).ignore();
                }
            }
        }
        let mut conn = self.manager.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| unavailable("multi", err))
    }
}

fn score_bound(value: f64) -> String {
    if value == f64::INFINITY {
        "+inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        value.to_string()
    }
}
