//! Shared counter store.
//!
//! The rate limiter and quota manager keep all cross-instance state in a
//! key-value store offering atomic integer/float increments, sorted sets, key
//! expiry and hashes. [`CounterStore`] is the seam; [`InMemoryCounterStore`]
//! serves single-process deployments and tests, `RedisCounterStore` (feature
//! `redis`) serves multi-instance deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::InMemoryCounterStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCounterStore;

/// Store-level failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Store cannot be reached or refused the command.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Operation applied to a key holding another kind of value.
    #[error("wrong type for key {key}")]
    WrongType { key: String },

    /// Stored value could not be parsed.
    #[error("corrupt value: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One mutation inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    IncrBy { key: String, delta: i64 },
    IncrByFloat { key: String, delta: f64 },
    HashSet { key: String, fields: Vec<(String, String)> },
    Expire { key: String, ttl: Duration },
    Delete { key: String },
}

/// Atomic counter/set store.
///
/// Implementations must be safe to share between tasks and between processes
/// pointed at the same backend.
#[async_trait]
pub trait CounterStore: Send + Sync + Debug {
    /// Integer increment (negative delta decrements). Missing keys start at 0.
    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Float increment (negative delta decrements). Missing keys start at 0.
    async fn incr_by_float(&self, key: &str, delta: f64) -> StoreResult<f64>;

    async fn get_int(&self, key: &str) -> StoreResult<Option<i64>>;

    async fn get_float(&self, key: &str) -> StoreResult<Option<f64>>;

    /// Overwrite a counter, keeping any expiry already on the key.
    async fn set_int(&self, key: &str, value: i64) -> StoreResult<()>;

    /// Overwrite a float counter, keeping any expiry already on the key.
    async fn set_float(&self, key: &str, value: f64) -> StoreResult<()>;

    /// Add (or re-score) a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Remove members with `min <= score <= max`; returns how many were removed.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Count members with `min <= score <= max`.
    async fn zcount(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    /// Members by ascending score, inclusive rank range. Negative ranks count
    /// from the end (-1 is the last member).
    async fn zrange_with_scores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Set a key's time to live. Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Remaining time to live; `None` when the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Delete a key. Returns true when something was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    /// Set one hash field only if it is absent. Returns true when this call
    /// wrote it.
    async fn hset_nx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool>;

    /// All fields of a hash; empty when the key is missing.
    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Apply every op or none of them.
    async fn apply_batch(&self, ops: &[StoreOp]) -> StoreResult<()>;
}
