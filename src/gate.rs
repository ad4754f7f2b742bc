//! Execution gate.
//!
//! Sequences the rate limiter, quota manager and connection pool around one
//! tool invocation:
//!
//! ```text
//! admit:  rate check -> quota check -> record request -> allocate -> get_connection
//! finish: release_connection -> release_resources
//! ```
//!
//! Denials come back as [`GateDecision`] values. Only pool failures (capacity,
//! spawn, shutdown) are errors, and those roll the allocation back first.
//! A cancelled `admit` or an unfinished permit releases its charge (and its
//! connection) from a spawned task when dropped.

use serde::Serialize;
use std::sync::Arc;

use crate::pool::{Connection, ConnectionPoolManager, SpawnSpec};
use crate::quota::{QuotaCheckResult, ResourceQuotaManager, ResourceRequirements};
use crate::rate_limit::{RateLimitResult, RateLimiter, UserRole};
use crate::types::{ExecutionId, Result, ToolId, UserId};

/// One tool invocation asking to run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRequest {
    pub user_id: UserId,
    pub role: UserRole,
    /// Rate-limited resource name, e.g. `"tool_execution"`.
    pub resource: String,
    pub tool_id: ToolId,
    pub spawn_spec: SpawnSpec,
    pub requirements: ResourceRequirements,
}

/// Outcome of [`ExecutionGate::admit`].
#[derive(Debug)]
pub enum GateDecision {
    Admitted(ExecutionPermit),
    RateLimited(RateLimitResult),
    QuotaDenied(QuotaCheckResult),
}

impl GateDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, GateDecision::Admitted(_))
    }
}

/// An admitted execution: holds the checked-out connection and, when the
/// allocation succeeded, the quota charge. Hand it back to
/// [`ExecutionGate::finish`]. A permit dropped without `finish` returns both
/// from a background task on the current runtime.
#[derive(Debug)]
pub struct ExecutionPermit {
    execution_id: ExecutionId,
    user_id: UserId,
    /// `None` only once the permit has been finished or dropped.
    connection: Option<Connection>,
    allocation: Option<AllocationGuard>,
    pool: Arc<ConnectionPoolManager>,
    degraded: bool,
}

impl ExecutionPermit {
    pub fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The checked-out connection.
    pub fn connection(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    /// False when the allocation could not be recorded and the execution runs
    /// without a quota charge.
    pub fn is_tracked(&self) -> bool {
        self.allocation.is_some()
    }

    /// True when a rate or quota check was skipped because its store was down.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "permit_dropped_outside_runtime: execution_id={}",
                self.execution_id
            );
            return;
        };
        tracing::warn!("permit_dropped_unfinished: execution_id={}", self.execution_id);
        let pool = Arc::clone(&self.pool);
        // The allocation guard releases its own charge when dropped.
        handle.spawn(async move {
            pool.release_connection(connection).await;
        });
    }
}

/// Quota charge for one execution. Released explicitly through
/// [`AllocationGuard::release`], or from a spawned task if dropped armed
/// (a cancelled `admit`, a dropped permit).
#[derive(Debug)]
struct AllocationGuard {
    quotas: Arc<ResourceQuotaManager>,
    execution_id: ExecutionId,
    armed: bool,
}

impl AllocationGuard {
    fn new(quotas: Arc<ResourceQuotaManager>, execution_id: ExecutionId) -> Self {
        Self {
            quotas,
            execution_id,
            armed: true,
        }
    }

    async fn release(mut self) {
        self.armed = false;
        self.quotas.release_resources(&self.execution_id).await;
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "allocation_leaked_outside_runtime: execution_id={}",
                self.execution_id
            );
            return;
        };
        tracing::debug!("allocation_released_on_drop: execution_id={}", self.execution_id);
        let quotas = Arc::clone(&self.quotas);
        let execution_id = self.execution_id.clone();
        handle.spawn(async move {
            quotas.release_resources(&execution_id).await;
        });
    }
}

/// Admission control for tool executions.
#[derive(Debug, Clone)]
pub struct ExecutionGate {
    rate_limiter: Arc<RateLimiter>,
    quotas: Arc<ResourceQuotaManager>,
    pool: Arc<ConnectionPoolManager>,
}

impl ExecutionGate {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        quotas: Arc<ResourceQuotaManager>,
        pool: Arc<ConnectionPoolManager>,
    ) -> Self {
        Self {
            rate_limiter,
            quotas,
            pool,
        }
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn quotas(&self) -> &ResourceQuotaManager {
        &self.quotas
    }

    pub fn pool(&self) -> &ConnectionPoolManager {
        &self.pool
    }

    pub async fn admit(&self, request: &ExecutionRequest) -> Result<GateDecision> {
        let rate = self
            .rate_limiter
            .check_rate_limit(&request.user_id, request.role, &request.resource)
            .await;
        if !rate.allowed {
            return Ok(GateDecision::RateLimited(rate));
        }

        let quota = self
            .quotas
            .check_quota(&request.user_id, &request.requirements)
            .await;
        if !quota.allowed {
            return Ok(GateDecision::QuotaDenied(quota));
        }

        self.rate_limiter
            .consume_quota(&request.user_id, request.role, &request.resource, 1)
            .await;

        let execution_id = ExecutionId::new();
        let allocation = if self
            .quotas
            .allocate_resources(&execution_id, &request.user_id, &request.requirements)
            .await
        {
            Some(AllocationGuard::new(Arc::clone(&self.quotas), execution_id.clone()))
        } else {
            tracing::warn!(
                "execution_untracked: execution_id={}, user={}",
                execution_id,
                request.user_id
            );
            None
        };

        // Dropping `allocation` here (error or cancellation) releases the charge.
        let connection = match self
            .pool
            .get_connection(&request.tool_id, &request.spawn_spec)
            .await
        {
            Ok(connection) => connection,
            Err(e) => {
                if let Some(allocation) = allocation {
                    allocation.release().await;
                }
                return Err(e);
            }
        };

        tracing::debug!(
            "execution_admitted: execution_id={}, user={}, tool={}, connection_id={}",
            execution_id,
            request.user_id,
            request.tool_id,
            connection.id()
        );
        Ok(GateDecision::Admitted(ExecutionPermit {
            execution_id,
            user_id: request.user_id.clone(),
            connection: Some(connection),
            allocation,
            pool: Arc::clone(&self.pool),
            degraded: rate.degraded || quota.degraded,
        }))
    }

    /// Return the connection to the pool and release the quota charge.
    pub async fn finish(&self, mut permit: ExecutionPermit) {
        if let Some(connection) = permit.connection.take() {
            self.pool.release_connection(connection).await;
        }
        if let Some(allocation) = permit.allocation.take() {
            allocation.release().await;
        }
        tracing::debug!("execution_finished: execution_id={}", permit.execution_id);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pool::PoolConfig;
    use crate::quota::{InMemoryQuotaOverrides, QuotaConfig, QuotaDimension};
    use crate::rate_limit::RateLimitConfig;
    use crate::store::InMemoryCounterStore;
    use crate::types::Error;
    use std::time::Duration;

    fn gate(max_size: usize) -> ExecutionGate {
        gate_with(PoolConfig {
            max_size,
            spawn_grace: Duration::from_millis(20),
            graceful_shutdown_timeout: Duration::from_millis(500),
            kill_timeout: Duration::from_millis(500),
            ..Default::default()
        })
    }

    fn gate_with(pool_config: PoolConfig) -> ExecutionGate {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryCounterStore::with_clock(clock.clone()));
        let rate_limiter = Arc::new(RateLimiter::with_clock(
            store.clone(),
            RateLimitConfig::default(),
            clock.clone(),
        ));
        let quotas = Arc::new(ResourceQuotaManager::with_clock(
            store,
            Arc::new(InMemoryQuotaOverrides::new()),
            QuotaConfig::default(),
            clock,
        ));
        let pool = Arc::new(ConnectionPoolManager::new(pool_config));
        ExecutionGate::new(rate_limiter, quotas, pool)
    }

    fn request(command: &str) -> ExecutionRequest {
        ExecutionRequest {
            user_id: UserId::must("erin"),
            role: UserRole::Viewer,
            resource: "tool_execution".to_string(),
            tool_id: ToolId::must("echo"),
            spawn_spec: SpawnSpec::new(command).arg("30"),
            requirements: ResourceRequirements {
                cpu_cores: 0.5,
                memory_mb: 256,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_admit_and_finish_round_trip() {
        let gate = gate(2);
        let req = request("sleep");
        let GateDecision::Admitted(mut permit) = gate.admit(&req).await.unwrap() else {
            panic!("expected admission");
        };
        assert!(permit.is_tracked());
        assert!(!permit.is_degraded());
        assert!(permit.connection().unwrap().stdin().is_some());

        let usage = gate.quotas().get_quota_usage(&req.user_id).await.unwrap();
        assert_eq!(usage.concurrent_executions.used, 1);

        gate.finish(permit).await;
        let usage = gate.quotas().get_quota_usage(&req.user_id).await.unwrap();
        assert_eq!(usage.concurrent_executions.used, 0);
        assert_eq!(gate.pool().get_pool_stats().await.idle, 1);

        let status = gate
            .rate_limiter()
            .get_rate_limit_status(&req.user_id, req.role, &req.resource)
            .await
            .unwrap();
        assert_eq!(status.used, 1);
        gate.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_rate_limited_before_quota() {
        let gate = gate(2);
        let req = request("sleep");
        gate.rate_limiter()
            .consume_quota(&req.user_id, req.role, &req.resource, 10)
            .await;
        let decision = gate.admit(&req).await.unwrap();
        match decision {
            GateDecision::RateLimited(result) => assert!(result.retry_after.is_some()),
            other => panic!("expected rate limit, got {other:?}"),
        }
        assert_eq!(gate.pool().get_pool_stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_quota_denied_names_dimension() {
        let gate = gate(2);
        let mut req = request("sleep");
        req.requirements.cpu_cores = 10.0;
        match gate.admit(&req).await.unwrap() {
            GateDecision::QuotaDenied(result) => {
                assert_eq!(result.exceeded_resource, Some(QuotaDimension::CpuCores));
            }
            other => panic!("expected quota denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pool_failure_rolls_back_allocation() {
        let gate = gate(2);
        let req = request("/nonexistent/toolgate-tool");
        let err = gate.admit(&req).await.unwrap_err();
        assert!(matches!(err, Error::SpawnFailure { .. }));

        let usage = gate.quotas().get_quota_usage(&req.user_id).await.unwrap();
        assert_eq!(usage.concurrent_executions.used, 0);
        assert_eq!(usage.memory_mb.used, 0);
    }

    #[tokio::test]
    async fn test_dropped_permit_returns_connection_and_charge() {
        let gate = gate(2);
        let req = request("sleep");
        let GateDecision::Admitted(permit) = gate.admit(&req).await.unwrap() else {
            panic!("expected admission");
        };
        drop(permit);

        for _ in 0..50 {
            let usage = gate.quotas().get_quota_usage(&req.user_id).await.unwrap();
            if usage.concurrent_executions.used == 0 && gate.pool().get_pool_stats().await.idle == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let usage = gate.quotas().get_quota_usage(&req.user_id).await.unwrap();
        assert_eq!(usage.concurrent_executions.used, 0);
        let stats = gate.pool().get_pool_stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
        gate.pool().shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_admit_releases_allocation() {
        let gate = gate_with(PoolConfig {
            spawn_grace: Duration::from_secs(2),
            spawn_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        let req = request("sleep");
        let cancelled = tokio::time::timeout(Duration::from_millis(300), gate.admit(&req)).await;
        assert!(cancelled.is_err());

        for _ in 0..50 {
            let usage = gate.quotas().get_quota_usage(&req.user_id).await.unwrap();
            if usage.concurrent_executions.used == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let usage = gate.quotas().get_quota_usage(&req.user_id).await.unwrap();
        assert_eq!(usage.concurrent_executions.used, 0);
        assert_eq!(usage.daily_executions.used, 1);
        assert_eq!(gate.pool().get_pool_stats().await.total, 0);
    }
}
