//! In-process counter store.
//!
//! Implements the full [`CounterStore`] contract over a single mutex-guarded
//! keyspace, with key expiry evaluated against an injected [`Clock`]. Useful
//! for single-instance deployments and for tests, where `set_available(false)`
//! simulates a store outage.
//!
//! Expired keys are dropped when touched, and every [`PURGE_EVERY`] operations
//! a full pass removes the ones nobody touches again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};

use super::{CounterStore, StoreError, StoreOp, StoreResult};
use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Float(f64),
    /// Kept sorted by (score, member).
    SortedSet(Vec<(String, f64)>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// Operations between full expiry passes.
const PURGE_EVERY: usize = 1024;

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    ops_since_purge: usize,
}

impl Keyspace {
    fn tick(&mut self, now: DateTime<Utc>) {
        self.ops_since_purge += 1;
        if self.ops_since_purge >= PURGE_EVERY {
            self.purge_expired(now);
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        self.ops_since_purge = 0;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.expires_at.map_or(true, |at| at > now));
        let purged = before - self.entries.len();
        if purged > 0 {
            tracing::debug!("store_expired_keys_purged: count={}", purged);
        }
        purged
    }

    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn check_int(&mut self, key: &str, now: DateTime<Utc>) -> StoreResult<()> {
        match self.live(key, now).map(|e| &e.value) {
            None | Some(Value::Int(_)) => Ok(()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn check_float(&mut self, key: &str, now: DateTime<Utc>) -> StoreResult<()> {
        match self.live(key, now).map(|e| &e.value) {
            None | Some(Value::Int(_)) | Some(Value::Float(_)) => Ok(()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn check_hash(&mut self, key: &str, now: DateTime<Utc>) -> StoreResult<()> {
        match self.live(key, now).map(|e| &e.value) {
            None | Some(Value::Hash(_)) => Ok(()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn incr_by(&mut self, key: &str, delta: i64, now: DateTime<Utc>) -> StoreResult<i64> {
        match self.live(key, now) {
            Some(Entry {
                value: Value::Int(v),
                ..
            }) => {
                *v = v.saturating_add(delta);
                Ok(*v)
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Int(delta),
                        expires_at: None,
                    },
                );
                Ok(delta)
            }
        }
    }

    fn incr_by_float(&mut self, key: &str, delta: f64, now: DateTime<Utc>) -> StoreResult<f64> {
        match self.live(key, now) {
            Some(entry) => {
                let next = match entry.value {
                    Value::Int(v) => v as f64 + delta,
                    Value::Float(v) => v + delta,
                    _ => return Err(wrong_type(key)),
                };
                entry.value = Value::Float(next);
                Ok(next)
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Float(delta),
                        expires_at: None,
                    },
                );
                Ok(delta)
            }
        }
    }

    fn set_value(&mut self, key: &str, value: Value, now: DateTime<Utc>) {
        match self.live(key, now) {
            Some(entry) => entry.value = value,
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value,
                        expires_at: None,
                    },
                );
            }
        }
    }

    fn hset(&mut self, key: &str, fields: &[(String, String)], now: DateTime<Utc>) -> StoreResult<()> {
        match self.live(key, now) {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => {
                map.extend(fields.iter().cloned());
                Ok(())
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(fields.iter().cloned().collect()),
                        expires_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    fn hset_nx(&mut self, key: &str, field: &str, value: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        match self.live(key, now) {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => {
                if map.contains_key(field) {
                    return Ok(false);
                }
                map.insert(field.to_string(), value.to_string());
                Ok(true)
            }
            Some(_) => Err(wrong_type(key)),
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Hash(HashMap::from([(field.to_string(), value.to_string())])),
                        expires_at: None,
                    },
                );
                Ok(true)
            }
        }
    }

    fn expire(&mut self, key: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.live(key, now) else {
            return false;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) if ttl > chrono::Duration::zero() => {
                entry.expires_at = Some(now + ttl);
            }
            Ok(_) => {
                self.entries.remove(key);
            }
            // Out of chrono's range: treat as no expiry.
            Err(_) => entry.expires_at = None,
        }
        true
    }

    fn delete(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        self.live(key, now).is_some() && self.entries.remove(key).is_some()
    }

    fn zset(&mut self, key: &str, now: DateTime<Utc>) -> StoreResult<Option<&mut Vec<(String, f64)>>> {
        match self.live(key, now) {
            Some(Entry {
                value: Value::SortedSet(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn drop_if_empty_zset(&mut self, key: &str) {
        if let Some(Entry {
            value: Value::SortedSet(set),
            ..
        }) = self.entries.get(key)
        {
            if set.is_empty() {
                self.entries.remove(key);
            }
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

fn in_range(score: f64, min: f64, max: f64) -> bool {
    score >= min && score <= max
}

/// In-process [`CounterStore`].
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    keyspace: Arc<Mutex<Keyspace>>,
    clock: Arc<dyn Clock>,
    available: Arc<AtomicBool>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Arc::new(Mutex::new(Keyspace::default())),
            clock,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle simulated availability. While unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub async fn key_count(&self) -> usize {
        let now = self.clock.now();
        let mut keyspace = self.keyspace.lock().await;
        keyspace.purge_expired(now);
        keyspace.entries.len()
    }

    /// Drop every expired key now. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.keyspace.lock().await.purge_expired(now)
    }

    async fn locked(&self, now: DateTime<Utc>) -> MutexGuard<'_, Keyspace> {
        let mut keyspace = self.keyspace.lock().await;
        keyspace.tick(now);
        keyspace
    }

    fn guard(&self) -> StoreResult<DateTime<Utc>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(self.clock.now())
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let now = self.guard()?;
        self.locked(now).await.incr_by(key, delta, now)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64> {
        let now = self.guard()?;
        self.locked(now).await.incr_by_float(key, delta, now)
    }

    async fn get_int(&self, key: &str) -> StoreResult<Option<i64>> {
        let now = self.guard()?;
        let mut keyspace = self.locked(now).await;
        match keyspace.live(key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Int(v)) => Ok(Some(*v)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn get_float(&self, key: &str) -> StoreResult<Option<f64>> {
        let now = self.guard()?;
        let mut keyspace = self.locked(now).await;
        match keyspace.live(key, now).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Int(v)) => Ok(Some(*v as f64)),
            Some(Value::Float(v)) => Ok(Some(*v)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_int(&self, key: &str, value: i64) -> StoreResult<()> {
        let now = self.guard()?;
        self.locked(now).await.set_value(key, Value::Int(value), now);
        Ok(())
    }

    async fn set_float(&self, key: &str, value: f64) -> StoreResult<()> {
        let now = self.guard()?;
        self.locked(now)
            .await
            .set_value(key, Value::Float(value), now);
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let now = self.guard()?;
        let mut keyspace = self.locked(now).await;
        if keyspace.zset(key, now)?.is_none() {
            keyspace.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::SortedSet(Vec::new()),
                    expires_at: None,
                },
            );
        }
        if let Some(set) = keyspace.zset(key, now)? {
            set.retain(|(m, _)| m != member);
            let at = set.partition_point(|(m, s)| (*s, m.as_str()) < (score, member));
            set.insert(at, (member.to_string(), score));
        }
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let now = self.guard()?;
        let mut keyspace = self.locked(now).await;
        let removed = match keyspace.zset(key, now)? {
            Some(set) => {
                let before = set.len();
                set.retain(|(_, score)| !in_range(*score, min, max));
                (before - set.len()) as u64
            }
            None => 0,
        };
        keyspace.drop_if_empty_zset(key);
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let now = self.guard()?;
        let mut keyspace = self.locked(now).await;
        Ok(keyspace.zset(key, now)?.map_or(0, |set| set.len() as u64))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let now = self.guard()?;
        let mut keyspace = self.locked(now).await;
        Ok(keyspace.zset(key, now)?.map_or(0, |set| {
            set.iter().filter(|(_, s)| in_range(*s, min, max)).count() as u64
        }))
    }

    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>> {
        let now = self.guard()?;
        let mut keyspace = self.locked(now).await;
        let Some(set) = keyspace.zset(key, now)? else {
            return Ok(Vec::new());
        };
        let len = set.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(set[start as usize..=stop as usize].to_vec())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = self.guard()?;
        Ok(self.locked(now).await.expire(key, ttl, now))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let now = self.guard()?;
        let mut keyspace = self.locked(now).await;
        Ok(keyspace
            .live(key, now)
            .and_then(|e| e.expires_at)
            .and_then(|at| (at - now).to_std().ok()))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = self.guard()?;
        Ok(self.locked(now).await.delete(key, now))
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        let now = self.guard()?;
        self.locked(now).await.hset(key, fields, now)
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let now = self.guard()?;
        self.locked(now).await.hset_nx(key, field, value, now)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let now = self.guard()?;
        let mut keyspace = self.locked(now).await;
        match keyspace.live(key, now).map(|e| &e.value) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(map)) => Ok(map.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn apply_batch(&self, ops: &[StoreOp]) -> StoreResult<()> {
        let now = self.guard()?;
        let mut keyspace = self.locked(now).await;

        // Validate every op before mutating so the batch is all-or-nothing.
        for op in ops {
            match op {
                StoreOp::IncrBy { key, .. } => keyspace.check_int(key, now)?,
                StoreOp::IncrByFloat { key, .. } => keyspace.check_float(key, now)?,
                StoreOp::HashSet { key, .. } => keyspace.check_hash(key, now)?,
                StoreOp::Expire { .. } | StoreOp::Delete { .. } => {}
            }
        }

        for op in ops {
            match op {
                StoreOp::IncrBy { key, delta } => {
                    keyspace.incr_by(key, *delta, now)?;
                }
                StoreOp::IncrByFloat { key, delta } => {
                    keyspace.incr_by_float(key, *delta, now)?;
                }
                StoreOp::HashSet { key, fields } => keyspace.hset(key, fields, now)?,
                StoreOp::Expire { key, ttl } => {
                    keyspace.expire(key, *ttl, now);
                }
                StoreOp::Delete { key } => {
                    keyspace.delete(key, now);
                }
            }
        }
        Ok(())
    }
}
