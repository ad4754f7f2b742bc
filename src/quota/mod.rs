//! Resource tracking and quota enforcement.
//!
//! Tracks per-user CPU, memory, concurrency and daily execution usage in the
//! shared counter store and enforces per-user ceilings. Each charged execution
//! leaves an [`AllocationRecord`] so release can roll back exactly what was
//! charged.
//!
//! Counter layout (under `key_prefix`):
//! ```text
//! {prefix}:usage:{user}:cpu_cores              float
//! {prefix}:usage:{user}:memory_mb              int
//! {prefix}:usage:{user}:concurrent_executions  int
//! {prefix}:usage:{user}:daily_executions       int, expires at local midnight
//! {prefix}:alloc:{execution_id}                hash (AllocationRecord)
//! ```

use chrono::{DateTime, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::store::{CounterStore, StoreOp, StoreResult};
use crate::types::{Error, ExecutionId, Result, UserId};

mod overrides;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use overrides::{InMemoryQuotaOverrides, QuotaOverrideStore};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteQuotaOverrides;

/// Float counters below this are treated as zero after a decrement.
const CPU_EPSILON: f64 = 1e-9;

// =============================================================================
// Limits and requirements
// =============================================================================

/// Per-user ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserQuota {
    pub max_cpu_cores: f64,
    pub max_memory_mb: u64,
    pub max_concurrent_executions: u64,
    pub max_daily_executions: u64,
}

impl Default for UserQuota {
    fn default() -> Self {
        Self {
            max_cpu_cores: 4.0,
            max_memory_mb: 4096,
            max_concurrent_executions: 5,
            max_daily_executions: 1000,
        }
    }
}

impl UserQuota {
    pub fn validate(&self) -> Result<()> {
        if !self.max_cpu_cores.is_finite() || self.max_cpu_cores < 0.0 {
            return Err(Error::validation(format!(
                "max_cpu_cores must be a non-negative number, got {}",
                self.max_cpu_cores
            )));
        }
        Ok(())
    }
}

/// Partial update applied by [`ResourceQuotaManager::update_user_quota`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaUpdate {
    pub max_cpu_cores: Option<f64>,
    pub max_memory_mb: Option<u64>,
    pub max_concurrent_executions: Option<u64>,
    pub max_daily_executions: Option<u64>,
}

impl QuotaUpdate {
    fn apply(&self, mut quota: UserQuota) -> UserQuota {
        if let Some(v) = self.max_cpu_cores {
            quota.max_cpu_cores = v;
        }
        if let Some(v) = self.max_memory_mb {
            quota.max_memory_mb = v;
        }
        if let Some(v) = self.max_concurrent_executions {
            quota.max_concurrent_executions = v;
        }
        if let Some(v) = self.max_daily_executions {
            quota.max_daily_executions = v;
        }
        quota
    }
}

/// What one execution asks for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub concurrent_executions: u64,
    #[serde(with = "humantime_serde")]
    pub estimated_duration: Duration,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 512,
            concurrent_executions: 1,
            estimated_duration: Duration::from_secs(60),
        }
    }
}

impl ResourceRequirements {
    pub fn validate(&self) -> Result<()> {
        if !self.cpu_cores.is_finite() || self.cpu_cores < 0.0 {
            return Err(Error::validation(format!(
                "cpu_cores must be a non-negative number, got {}",
                self.cpu_cores
            )));
        }
        Ok(())
    }
}

/// Behavior when limits or usage cannot be read during a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit the execution and flag the result as degraded.
    #[default]
    Open,
    /// Deny the execution.
    Closed,
}

/// Quota manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Limits for users without a persisted override.
    pub defaults: UserQuota,
    pub fail_mode: FailMode,
    pub key_prefix: String,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            defaults: UserQuota::default(),
            fail_mode: FailMode::Open,
            key_prefix: "quota".to_string(),
        }
    }
}

// =============================================================================
// Usage and results
// =============================================================================

/// One independently limited resource axis, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaDimension {
    CpuCores,
    MemoryMb,
    ConcurrentExecutions,
    DailyExecutions,
}

impl QuotaDimension {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaDimension::CpuCores => "cpu_cores",
            QuotaDimension::MemoryMb => "memory_mb",
            QuotaDimension::ConcurrentExecutions => "concurrent_executions",
            QuotaDimension::DailyExecutions => "daily_executions",
        }
    }
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running totals for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub concurrent_executions: u64,
    pub daily_executions: u64,
}

/// Outcome of a quota check. Denial is a value, not an error; at most one
/// exceeded dimension is reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaCheckResult {
    pub allowed: bool,
    pub exceeded_resource: Option<QuotaDimension>,
    pub current_usage: QuotaUsage,
    pub limits: UserQuota,
    pub reason: Option<String>,
    /// True when limits or usage could not be read.
    pub degraded: bool,
}

/// used / limit / available for one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DimensionUsage<T> {
    pub used: T,
    pub limit: T,
    pub available: T,
}

impl DimensionUsage<u64> {
    fn of(used: u64, limit: u64) -> Self {
        Self {
            used,
            limit,
            available: limit.saturating_sub(used),
        }
    }
}

impl DimensionUsage<f64> {
    fn of(used: f64, limit: f64) -> Self {
        Self {
            used,
            limit,
            available: (limit - used).max(0.0),
        }
    }
}

/// Per-dimension usage report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsageReport {
    pub user_id: UserId,
    pub cpu_cores: DimensionUsage<f64>,
    pub memory_mb: DimensionUsage<u64>,
    pub concurrent_executions: DimensionUsage<u64>,
    pub daily_executions: DimensionUsage<u64>,
}

// =============================================================================
// Allocation record
// =============================================================================

/// What was charged for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub execution_id: ExecutionId,
    pub user_id: UserId,
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub concurrent_executions: u64,
    pub allocated_at: DateTime<Utc>,
}

impl AllocationRecord {
    const USER_ID: &'static str = "user_id";
    const CPU_CORES: &'static str = "cpu_cores";
    const MEMORY_MB: &'static str = "memory_mb";
    const CONCURRENT: &'static str = "concurrent_executions";
    const ALLOCATED_AT: &'static str = "allocated_at";

    fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (Self::USER_ID.to_string(), self.user_id.to_string()),
            (Self::CPU_CORES.to_string(), self.cpu_cores.to_string()),
            (Self::MEMORY_MB.to_string(), self.memory_mb.to_string()),
            (
                Self::CONCURRENT.to_string(),
                self.concurrent_executions.to_string(),
            ),
            (Self::ALLOCATED_AT.to_string(), self.allocated_at.to_rfc3339()),
        ]
    }

    fn from_fields(execution_id: &ExecutionId, fields: &HashMap<String, String>) -> Result<Self> {
        fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
            fields
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| Error::validation(format!("allocation record missing {name}")))
        }
        fn number<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T> {
            let raw = field(fields, name)?;
            raw.parse()
                .map_err(|_| Error::validation(format!("allocation field {name} is not a number: {raw}")))
        }

        // Parsed in write order so the first missing field is the one reported.
        let user_id = UserId::from_string(field(fields, Self::USER_ID)?.to_string())
            .map_err(Error::validation)?;
        let cpu_cores = number(fields, Self::CPU_CORES)?;
        let memory_mb = number(fields, Self::MEMORY_MB)?;
        let concurrent_executions = number(fields, Self::CONCURRENT)?;
        let allocated_at = DateTime::parse_from_rfc3339(field(fields, Self::ALLOCATED_AT)?)
            .map_err(|e| Error::validation(format!("allocation field allocated_at: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            execution_id: execution_id.clone(),
            user_id,
            cpu_cores,
            memory_mb,
            concurrent_executions,
            allocated_at,
        })
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Per-user quota tracking and enforcement over a shared [`CounterStore`].
#[derive(Debug, Clone)]
pub struct ResourceQuotaManager {
    store: Arc<dyn CounterStore>,
    overrides: Arc<dyn QuotaOverrideStore>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
}

impl ResourceQuotaManager {
    pub fn new(
        store: Arc<dyn CounterStore>,
        overrides: Arc<dyn QuotaOverrideStore>,
        config: QuotaConfig,
    ) -> Self {
        Self::with_clock(store, overrides, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        overrides: Arc<dyn QuotaOverrideStore>,
        config: QuotaConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            overrides,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn usage_key(&self, user: &UserId, dimension: QuotaDimension) -> String {
        format!("{}:usage:{}:{}", self.config.key_prefix, user, dimension)
    }

    fn allocation_key(&self, execution_id: &ExecutionId) -> String {
        format!("{}:alloc:{}", self.config.key_prefix, execution_id)
    }

    /// Effective limits: the persisted override, else the platform defaults.
    pub async fn get_user_quota(&self, user: &UserId) -> Result<UserQuota> {
        Ok(self
            .overrides
            .get(user)
            .await?
            .unwrap_or(self.config.defaults))
    }

    async fn read_usage(&self, user: &UserId) -> StoreResult<QuotaUsage> {
        let cpu = self
            .store
            .get_float(&self.usage_key(user, QuotaDimension::CpuCores))
            .await?
            .unwrap_or(0.0);
        let int = |v: Option<i64>| v.map_or(0, |v| u64::try_from(v).unwrap_or(0));
        Ok(QuotaUsage {
            cpu_cores: cpu.max(0.0),
            memory_mb: int(
                self.store
                    .get_int(&self.usage_key(user, QuotaDimension::MemoryMb))
                    .await?,
            ),
            concurrent_executions: int(
                self.store
                    .get_int(&self.usage_key(user, QuotaDimension::ConcurrentExecutions))
                    .await?,
            ),
            daily_executions: int(
                self.store
                    .get_int(&self.usage_key(user, QuotaDimension::DailyExecutions))
                    .await?,
            ),
        })
    }

    fn degraded(&self, user: &UserId, limits: UserQuota, cause: String) -> QuotaCheckResult {
        let allowed = self.config.fail_mode == FailMode::Open;
        tracing::warn!(
            "quota_check_degraded: user={}, fail_mode={:?}, error={}",
            user,
            self.config.fail_mode,
            cause
        );
        QuotaCheckResult {
            allowed,
            exceeded_resource: None,
            current_usage: QuotaUsage::default(),
            limits,
            reason: Some(if allowed {
                format!("quota check skipped, store unavailable: {cause}")
            } else {
                format!("quota check failed closed, store unavailable: {cause}")
            }),
            degraded: true,
        }
    }

    /// Check `requirements` against the user's remaining headroom.
    ///
    /// Dimensions are checked CPU → memory → concurrency → daily; the first
    /// violation is reported.
    pub async fn check_quota(
        &self,
        user: &UserId,
        requirements: &ResourceRequirements,
    ) -> QuotaCheckResult {
        let limits = match self.overrides.get(user).await {
            Ok(found) => found.unwrap_or(self.config.defaults),
            Err(e) => return self.degraded(user, self.config.defaults, e.to_string()),
        };

        if let Err(e) = requirements.validate() {
            return QuotaCheckResult {
                allowed: false,
                exceeded_resource: None,
                current_usage: QuotaUsage::default(),
                limits,
                reason: Some(e.to_string()),
                degraded: false,
            };
        }

        let usage = match self.read_usage(user).await {
            Ok(usage) => usage,
            Err(e) => return self.degraded(user, limits, e.to_string()),
        };

        let exceeded = if usage.cpu_cores + requirements.cpu_cores > limits.max_cpu_cores + CPU_EPSILON {
            Some((
                QuotaDimension::CpuCores,
                format!(
                    "cpu_cores: requested {}, in use {}, limit {}",
                    requirements.cpu_cores, usage.cpu_cores, limits.max_cpu_cores
                ),
            ))
        } else if usage.memory_mb.saturating_add(requirements.memory_mb) > limits.max_memory_mb {
            Some((
                QuotaDimension::MemoryMb,
                format!(
                    "memory_mb: requested {}, in use {}, limit {}",
                    requirements.memory_mb, usage.memory_mb, limits.max_memory_mb
                ),
            ))
        } else if usage
            .concurrent_executions
            .saturating_add(requirements.concurrent_executions)
            > limits.max_concurrent_executions
        {
            Some((
                QuotaDimension::ConcurrentExecutions,
                format!(
                    "concurrent_executions: requested {}, running {}, limit {}",
                    requirements.concurrent_executions,
                    usage.concurrent_executions,
                    limits.max_concurrent_executions
                ),
            ))
        } else if usage.daily_executions >= limits.max_daily_executions {
            Some((
                QuotaDimension::DailyExecutions,
                format!(
                    "daily_executions: {} of {} used today",
                    usage.daily_executions, limits.max_daily_executions
                ),
            ))
        } else {
            None
        };

        match exceeded {
            Some((dimension, detail)) => {
                tracing::debug!("quota_denied: user={}, resource={}", user, dimension);
                QuotaCheckResult {
                    allowed: false,
                    exceeded_resource: Some(dimension),
                    current_usage: usage,
                    limits,
                    reason: Some(format!("quota exceeded: {detail}")),
                    degraded: false,
                }
            }
            None => QuotaCheckResult {
                allowed: true,
                exceeded_resource: None,
                current_usage: usage,
                limits,
                reason: None,
                degraded: false,
            },
        }
    }

    /// Charge an execution against the user's counters and persist its
    /// allocation record. Returns false (and logs) on any failure, including
    /// an execution id that is already charged.
    pub async fn allocate_resources(
        &self,
        execution_id: &ExecutionId,
        user: &UserId,
        requirements: &ResourceRequirements,
    ) -> bool {
        if let Err(e) = requirements.validate() {
            tracing::warn!(
                "allocation_rejected: execution_id={}, user={}, error={}",
                execution_id,
                user,
                e
            );
            return false;
        }

        // Claiming the record's owner field first makes the duplicate check
        // atomic: only one caller per execution id gets past this point.
        let alloc_key = self.allocation_key(execution_id);
        match self
            .store
            .hset_nx(&alloc_key, AllocationRecord::USER_ID, user.as_str())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    "allocation_duplicate: execution_id={}, user={}",
                    execution_id,
                    user
                );
                return false;
            }
            Err(e) => {
                tracing::warn!(
                    "allocation_failed: execution_id={}, user={}, error={}",
                    execution_id,
                    user,
                    e
                );
                return false;
            }
        }

        let record = AllocationRecord {
            execution_id: execution_id.clone(),
            user_id: user.clone(),
            cpu_cores: requirements.cpu_cores,
            memory_mb: requirements.memory_mb,
            concurrent_executions: requirements.concurrent_executions,
            allocated_at: self.clock.now(),
        };
        let daily_key = self.usage_key(user, QuotaDimension::DailyExecutions);
        let ops = [
            StoreOp::IncrByFloat {
                key: self.usage_key(user, QuotaDimension::CpuCores),
                delta: record.cpu_cores,
            },
            StoreOp::IncrBy {
                key: self.usage_key(user, QuotaDimension::MemoryMb),
                delta: to_delta(record.memory_mb),
            },
            StoreOp::IncrBy {
                key: self.usage_key(user, QuotaDimension::ConcurrentExecutions),
                delta: to_delta(record.concurrent_executions),
            },
            StoreOp::IncrBy {
                key: daily_key.clone(),
                delta: 1,
            },
            StoreOp::HashSet {
                key: alloc_key.clone(),
                fields: record.to_fields(),
            },
        ];

        if let Err(e) = self.store.apply_batch(&ops).await {
            tracing::warn!(
                "allocation_failed: execution_id={}, user={}, error={}",
                execution_id,
                user,
                e
            );
            if let Err(e) = self.store.delete(&alloc_key).await {
                tracing::warn!(
                    "allocation_claim_not_cleared: execution_id={}, error={}",
                    execution_id,
                    e
                );
            }
            return false;
        }

        // The day's first allocation fixes the reset boundary.
        match self.store.ttl(&daily_key).await {
            Ok(None) => {
                let ttl = Duration::from_secs(seconds_until_local_midnight(self.clock.now()));
                if let Err(e) = self.store.expire(&daily_key, ttl).await {
                    tracing::warn!("daily_expiry_not_set: user={}, error={}", user, e);
                }
            }
            Ok(Some(_)) => {}
            Err(e) => tracing::warn!("daily_expiry_not_set: user={}, error={}", user, e),
        }

        tracing::debug!(
            "resources_allocated: execution_id={}, user={}, cpu={}, memory_mb={}, concurrent={}",
            execution_id,
            user,
            record.cpu_cores,
            record.memory_mb,
            record.concurrent_executions
        );
        true
    }

    /// Roll back exactly what `execution_id` was charged. Missing records are
    /// a logged no-op; counters are clamped at zero. Returns true when this
    /// call performed the release.
    pub async fn release_resources(&self, execution_id: &ExecutionId) -> bool {
        let alloc_key = self.allocation_key(execution_id);
        let fields = match self.store.hgetall(&alloc_key).await {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!("release_failed: execution_id={}, error={}", execution_id, e);
                return false;
            }
        };
        if fields.is_empty() {
            tracing::warn!("release_missing_allocation: execution_id={}", execution_id);
            return false;
        }

        let record = match AllocationRecord::from_fields(execution_id, &fields) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(
                    "release_corrupt_allocation: execution_id={}, error={}",
                    execution_id,
                    e
                );
                if let Err(e) = self.store.delete(&alloc_key).await {
                    tracing::warn!("release_failed: execution_id={}, error={}", execution_id, e);
                }
                return false;
            }
        };

        // Whoever deletes the record owns the decrement.
        match self.store.delete(&alloc_key).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("release_already_claimed: execution_id={}", execution_id);
                return false;
            }
            Err(e) => {
                tracing::warn!("release_failed: execution_id={}, error={}", execution_id, e);
                return false;
            }
        }

        let user = &record.user_id;
        if let Err(e) = self
            .decrement_float(&self.usage_key(user, QuotaDimension::CpuCores), record.cpu_cores)
            .await
        {
            tracing::warn!("release_counter_failed: user={}, resource=cpu_cores, error={}", user, e);
        }
        for (dimension, amount) in [
            (QuotaDimension::MemoryMb, record.memory_mb),
            (QuotaDimension::ConcurrentExecutions, record.concurrent_executions),
        ] {
            if let Err(e) = self
                .decrement_int(&self.usage_key(user, dimension), amount)
                .await
            {
                tracing::warn!(
                    "release_counter_failed: user={}, resource={}, error={}",
                    user,
                    dimension,
                    e
                );
            }
        }

        tracing::debug!("resources_released: execution_id={}, user={}", execution_id, user);
        true
    }

    async fn decrement_int(&self, key: &str, amount: u64) -> StoreResult<()> {
        let value = self.store.incr_by(key, -to_delta(amount)).await?;
        if value < 0 {
            tracing::debug!("counter_underflow_clamped: key={}, value={}", key, value);
            self.store.set_int(key, 0).await?;
        }
        Ok(())
    }

    async fn decrement_float(&self, key: &str, amount: f64) -> StoreResult<()> {
        let value = self.store.incr_by_float(key, -amount).await?;
        if value < CPU_EPSILON {
            if value < -CPU_EPSILON {
                tracing::debug!("counter_underflow_clamped: key={}, value={}", key, value);
            }
            self.store.set_float(key, 0.0).await?;
        }
        Ok(())
    }

    /// Usage, limit and headroom per dimension.
    pub async fn get_quota_usage(&self, user: &UserId) -> Result<QuotaUsageReport> {
        let limits = self.get_user_quota(user).await?;
        let usage = self.read_usage(user).await?;
        Ok(QuotaUsageReport {
            user_id: user.clone(),
            cpu_cores: DimensionUsage::<f64>::of(usage.cpu_cores, limits.max_cpu_cores),
            memory_mb: DimensionUsage::<u64>::of(usage.memory_mb, limits.max_memory_mb),
            concurrent_executions: DimensionUsage::<u64>::of(
                usage.concurrent_executions,
                limits.max_concurrent_executions,
            ),
            daily_executions: DimensionUsage::<u64>::of(
                usage.daily_executions,
                limits.max_daily_executions,
            ),
        })
    }

    /// Administrative: persist new limits for `user`. Affects future checks
    /// only; in-flight allocations keep what they were charged.
    pub async fn update_user_quota(&self, user: &UserId, update: QuotaUpdate) -> Result<UserQuota> {
        let current = self.get_user_quota(user).await?;
        let updated = update.apply(current);
        updated.validate()?;
        self.overrides.put(user, &updated).await?;
        tracing::info!(
            "user_quota_updated: user={}, cpu={}, memory_mb={}, concurrent={}, daily={}",
            user,
            updated.max_cpu_cores,
            updated.max_memory_mb,
            updated.max_concurrent_executions,
            updated.max_daily_executions
        );
        Ok(updated)
    }
}

fn to_delta(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

/// Seconds from `now` until the next local midnight (at least 1).
pub(crate) fn seconds_until_local_midnight(now: DateTime<Utc>) -> u64 {
    let local = now.with_timezone(&Local);
    let midnight = local
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|naive| Local.from_local_datetime(&naive).earliest());
    match midnight {
        Some(at) => (at.with_timezone(&Utc) - now).num_seconds().max(1) as u64,
        None => 86_400,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryCounterStore;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    struct Fixture {
        manager: ResourceQuotaManager,
        store: Arc<InMemoryCounterStore>,
        overrides: Arc<InMemoryQuotaOverrides>,
        clock: Arc<ManualClock>,
        user: UserId,
    }

    fn fixture(config: QuotaConfig) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryCounterStore::with_clock(clock.clone()));
        let overrides = Arc::new(InMemoryQuotaOverrides::new());
        let manager =
            ResourceQuotaManager::with_clock(store.clone(), overrides.clone(), config, clock.clone());
        Fixture {
            manager,
            store,
            overrides,
            clock,
            user: UserId::must("alice"),
        }
    }

    fn light() -> ResourceRequirements {
        ResourceRequirements {
            cpu_cores: 0.5,
            memory_mb: 256,
            concurrent_executions: 1,
            estimated_duration: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn test_defaults_apply_without_override() {
        let f = fixture(QuotaConfig::default());
        let quota = f.manager.get_user_quota(&f.user).await.unwrap();
        assert_eq!(quota, UserQuota::default());
        assert_eq!(quota.max_cpu_cores, 4.0);
        assert_eq!(quota.max_memory_mb, 4096);
        assert_eq!(quota.max_concurrent_executions, 5);
        assert_eq!(quota.max_daily_executions, 1000);
    }

    #[tokio::test]
    async fn test_sixth_concurrent_execution_denied() {
        let f = fixture(QuotaConfig::default());
        for _ in 0..5 {
            let id = ExecutionId::new();
            assert!(f.manager.check_quota(&f.user, &light()).await.allowed);
            assert!(f.manager.allocate_resources(&id, &f.user, &light()).await);
        }

        let check = f.manager.check_quota(&f.user, &light()).await;
        assert!(!check.allowed);
        assert_eq!(
            check.exceeded_resource,
            Some(QuotaDimension::ConcurrentExecutions)
        );
        assert_eq!(check.current_usage.concurrent_executions, 5);
        assert_eq!(check.limits.max_concurrent_executions, 5);
    }

    #[tokio::test]
    async fn test_cpu_reported_before_other_dimensions() {
        let f = fixture(QuotaConfig::default());
        // Two cores, all memory and all concurrency slots already in use.
        let heavy = ResourceRequirements {
            cpu_cores: 2.0,
            memory_mb: 4096,
            concurrent_executions: 5,
            ..Default::default()
        };
        assert!(f.manager.allocate_resources(&ExecutionId::new(), &f.user, &heavy).await);

        let huge = ResourceRequirements {
            cpu_cores: 10.0,
            memory_mb: 8192,
            concurrent_executions: 3,
            ..Default::default()
        };
        let check = f.manager.check_quota(&f.user, &huge).await;
        assert!(!check.allowed);
        assert_eq!(check.exceeded_resource, Some(QuotaDimension::CpuCores));
        assert!(check.reason.unwrap().contains("cpu_cores"));
    }

    #[tokio::test]
    async fn test_memory_then_daily_dimensions() {
        let f = fixture(QuotaConfig::default());
        let big_memory = ResourceRequirements {
            cpu_cores: 0.1,
            memory_mb: 5000,
            concurrent_executions: 1,
            ..Default::default()
        };
        let check = f.manager.check_quota(&f.user, &big_memory).await;
        assert_eq!(check.exceeded_resource, Some(QuotaDimension::MemoryMb));

        f.manager
            .update_user_quota(
                &f.user,
                QuotaUpdate {
                    max_daily_executions: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        for _ in 0..2 {
            let id = ExecutionId::new();
            assert!(f.manager.allocate_resources(&id, &f.user, &light()).await);
            assert!(f.manager.release_resources(&id).await);
        }
        let check = f.manager.check_quota(&f.user, &light()).await;
        assert_eq!(check.exceeded_resource, Some(QuotaDimension::DailyExecutions));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_release_is_idempotent() {
        let f = fixture(QuotaConfig::default());
        let id = ExecutionId::new();
        assert!(f.manager.allocate_resources(&id, &f.user, &light()).await);
        assert!(f.manager.allocate_resources(&ExecutionId::new(), &f.user, &light()).await);

        assert!(f.manager.release_resources(&id).await);
        assert!(!f.manager.release_resources(&id).await);
        assert!(logs_contain("release_missing_allocation"));

        let usage = f.manager.get_quota_usage(&f.user).await.unwrap();
        assert_eq!(usage.concurrent_executions.used, 1);
        assert_eq!(usage.memory_mb.used, 256);
        assert!((usage.cpu_cores.used - 0.5).abs() < 1e-9);
        // Daily volume counts executions, not running work.
        assert_eq!(usage.daily_executions.used, 2);
    }

    #[tokio::test]
    async fn test_release_clamps_at_zero() {
        let f = fixture(QuotaConfig::default());
        let id = ExecutionId::new();
        assert!(f.manager.allocate_resources(&id, &f.user, &light()).await);
        // Someone zeroed the counters out from under us.
        f.store.set_int("quota:usage:alice:memory_mb", 0).await.unwrap();
        f.store.set_float("quota:usage:alice:cpu_cores", 0.0).await.unwrap();

        assert!(f.manager.release_resources(&id).await);
        assert_eq!(f.store.get_int("quota:usage:alice:memory_mb").await.unwrap(), Some(0));
        assert_eq!(f.store.get_float("quota:usage:alice:cpu_cores").await.unwrap(), Some(0.0));
    }

    #[tokio::test]
    async fn test_duplicate_execution_id_is_not_charged_twice() {
        let f = fixture(QuotaConfig::default());
        let id = ExecutionId::new();
        assert!(f.manager.allocate_resources(&id, &f.user, &light()).await);
        assert!(!f.manager.allocate_resources(&id, &f.user, &light()).await);
        let usage = f.manager.get_quota_usage(&f.user).await.unwrap();
        assert_eq!(usage.concurrent_executions.used, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_of_one_id_charge_once() {
        let f = fixture(QuotaConfig::default());
        let manager = Arc::new(f.manager.clone());
        let id = ExecutionId::new();

        let attempts: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                let id = id.clone();
                let user = f.user.clone();
                tokio::spawn(async move { manager.allocate_resources(&id, &user, &light()).await })
            })
            .collect();
        let mut charged = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                charged += 1;
            }
        }
        assert_eq!(charged, 1);

        let usage = manager.get_quota_usage(&f.user).await.unwrap();
        assert_eq!(usage.concurrent_executions.used, 1);
        assert_eq!(usage.memory_mb.used, 256);
        assert_eq!(usage.daily_executions.used, 1);

        assert!(manager.release_resources(&id).await);
        let usage = manager.get_quota_usage(&f.user).await.unwrap();
        assert_eq!(usage.concurrent_executions.used, 0);
    }

    #[tokio::test]
    async fn test_failed_batch_clears_allocation_claim() {
        let f = fixture(QuotaConfig::default());
        let id = ExecutionId::new();
        // A non-numeric value under the memory counter makes the batch fail.
        f.store
            .zadd(&f.manager.usage_key(&f.user, QuotaDimension::MemoryMb), "x", 1.0)
            .await
            .unwrap();
        assert!(!f.manager.allocate_resources(&id, &f.user, &light()).await);
        assert!(f
            .store
            .hgetall(&f.manager.allocation_key(&id))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_daily_counter_expires_at_local_midnight_once() {
        let f = fixture(QuotaConfig::default());
        assert!(f.manager.allocate_resources(&ExecutionId::new(), &f.user, &light()).await);
        let first = f.store.ttl("quota:usage:alice:daily_executions").await.unwrap().unwrap();
        let expected = seconds_until_local_midnight(f.clock.now());
        assert!(first.as_secs() <= expected);

        if expected > 5 {
            f.clock.advance(chrono::Duration::seconds(2));
            assert!(f.manager.allocate_resources(&ExecutionId::new(), &f.user, &light()).await);
            let second = f.store.ttl("quota:usage:alice:daily_executions").await.unwrap().unwrap();
            // Not pushed back by the second allocation.
            assert!(second < first);
        }
    }

    #[tokio::test]
    async fn test_usage_report_available_never_negative() {
        let f = fixture(QuotaConfig::default());
        f.store.set_int("quota:usage:alice:memory_mb", 9000).await.unwrap();
        let report = f.manager.get_quota_usage(&f.user).await.unwrap();
        assert_eq!(report.memory_mb.used, 9000);
        assert_eq!(report.memory_mb.available, 0);
        assert_eq!(report.cpu_cores.available, 4.0);
    }

    #[tokio::test]
    async fn test_update_takes_effect_for_future_checks() {
        let f = fixture(QuotaConfig::default());
        let id = ExecutionId::new();
        assert!(f.manager.allocate_resources(&id, &f.user, &light()).await);

        let updated = f
            .manager
            .update_user_quota(
                &f.user,
                QuotaUpdate {
                    max_concurrent_executions: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.max_concurrent_executions, 1);
        assert_eq!(updated.max_memory_mb, 4096);

        let check = f.manager.check_quota(&f.user, &light()).await;
        assert_eq!(
            check.exceeded_resource,
            Some(QuotaDimension::ConcurrentExecutions)
        );
        // The in-flight allocation still releases what it was charged.
        assert!(f.manager.release_resources(&id).await);
        assert!(f.manager.check_quota(&f.user, &light()).await.allowed);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_and_propagates_store_errors() {
        let f = fixture(QuotaConfig::default());
        let bad = QuotaUpdate {
            max_cpu_cores: Some(f64::NAN),
            ..Default::default()
        };
        assert!(matches!(
            f.manager.update_user_quota(&f.user, bad).await,
            Err(Error::Validation(_))
        ));

        f.overrides.set_available(false);
        let ok = QuotaUpdate {
            max_cpu_cores: Some(8.0),
            ..Default::default()
        };
        assert!(f.manager.update_user_quota(&f.user, ok).await.is_err());
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_by_default() {
        let f = fixture(QuotaConfig::default());
        f.store.set_available(false);
        let check = f.manager.check_quota(&f.user, &light()).await;
        assert!(check.allowed);
        assert!(check.degraded);
        assert!(check.reason.is_some());
        assert!(!f.manager.allocate_resources(&ExecutionId::new(), &f.user, &light()).await);
        assert!(!f.manager.release_resources(&ExecutionId::new()).await);
    }

    #[tokio::test]
    async fn test_fail_closed_mode_denies_on_outage() {
        let f = fixture(QuotaConfig {
            fail_mode: FailMode::Closed,
            ..Default::default()
        });
        f.overrides.set_available(false);
        let check = f.manager.check_quota(&f.user, &light()).await;
        assert!(!check.allowed);
        assert!(check.degraded);
        assert_eq!(check.exceeded_resource, None);
    }

    #[tokio::test]
    async fn test_invalid_requirements_denied() {
        let f = fixture(QuotaConfig::default());
        let bad = ResourceRequirements {
            cpu_cores: -1.0,
            ..Default::default()
        };
        let check = f.manager.check_quota(&f.user, &bad).await;
        assert!(!check.allowed);
        assert!(!f.manager.allocate_resources(&ExecutionId::new(), &f.user, &bad).await);
    }

    #[test]
    fn test_allocation_record_rejects_missing_fields() {
        let mut fields = HashMap::new();
        fields.insert("user_id".to_string(), "alice".to_string());
        fields.insert("cpu_cores".to_string(), "0.5".to_string());
        let err = AllocationRecord::from_fields(&ExecutionId::new(), &fields).unwrap_err();
        assert!(err.to_string().contains("memory_mb"));
    }

    #[test]
    fn test_seconds_until_midnight_within_a_day() {
        let secs = seconds_until_local_midnight(Utc::now());
        assert!(secs >= 1);
        assert!(secs <= 25 * 3600);
    }

    proptest! {
        #[test]
        fn counters_never_negative(ops in proptest::collection::vec((any::<bool>(), 0usize..4), 1..40)) {
            tokio_test::block_on(async {
                let f = fixture(QuotaConfig::default());
                let ids: Vec<ExecutionId> = (0..4).map(|_| ExecutionId::new()).collect();
                for (allocate, idx) in ops {
                    if allocate {
                        f.manager.allocate_resources(&ids[idx], &f.user, &light()).await;
                    } else {
                        f.manager.release_resources(&ids[idx]).await;
                    }
                    let usage = f.manager.get_quota_usage(&f.user).await.unwrap();
                    assert!(usage.cpu_cores.used >= 0.0);
                    let raw_mem = f.store.get_int("quota:usage:alice:memory_mb").await.unwrap();
                    assert!(raw_mem.unwrap_or(0) >= 0);
                    let raw_conc = f.store.get_int("quota:usage:alice:concurrent_executions").await.unwrap();
                    assert!(raw_conc.unwrap_or(0) >= 0);
                    assert!(usage.concurrent_executions.used <= 4);
                }
            });
        }
    }
}
