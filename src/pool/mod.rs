//! Connection pool manager.
//!
//! Owns tool subprocesses per tool id. Idle connections are pooled and reused
//! before new ones are spawned; idle+active (+in-flight spawns) never exceeds
//! `max_size` for a tool. Checkout and checkin for one tool are serialized by
//! that tool's lock; different tools never contend.
//!
//! Active connections are owned by the caller. The pool only tracks their ids,
//! so a connection cannot be handed to two holders at once.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::types::{ConnectionId, Error, Result, ToolId};

mod connection;
mod sweeper;

pub use connection::{Connection, SpawnSpec, TerminationOutcome};

// =============================================================================
// Configuration
// =============================================================================

/// Pool limits and timeouts. Fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept per tool by warm-up and spared by the sweeper.
    pub min_size: usize,
    /// Idle + active ceiling per tool.
    pub max_size: usize,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub spawn_timeout: Duration,
    /// A process that exits within this window counts as a spawn failure.
    #[serde(with = "humantime_serde")]
    pub spawn_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub graceful_shutdown_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            health_check_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            spawn_timeout: Duration::from_secs(10),
            spawn_grace: Duration::from_millis(100),
            graceful_shutdown_timeout: Duration::from_secs(5),
            kill_timeout: Duration::from_secs(2),
        }
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Counts for one tool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolPoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub spawning: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub total_uses: u64,
}

/// Read-only aggregate across all tools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub total_uses: u64,
    pub tools: BTreeMap<String, ToolPoolStats>,
}

// =============================================================================
// Per-tool state
// =============================================================================

/// Bookkeeping for a checked-out connection.
#[derive(Debug, Clone, Copy)]
struct ActiveInfo {
    is_healthy: bool,
    use_count: u64,
}

impl ActiveInfo {
    fn of(connection: &Connection) -> Self {
        Self {
            is_healthy: connection.is_healthy(),
            use_count: connection.use_count(),
        }
    }
}

#[derive(Debug, Default)]
struct ToolPool {
    idle: VecDeque<Connection>,
    active: HashMap<ConnectionId, ActiveInfo>,
}

#[derive(Debug, Default)]
struct ToolSlot {
    state: Mutex<ToolPool>,
    /// Spawns in flight. Counted toward `max_size`.
    spawning: AtomicUsize,
}

impl ToolSlot {
    fn occupied(&self, pool: &ToolPool) -> usize {
        pool.idle.len() + pool.active.len() + self.spawning.load(Ordering::SeqCst)
    }

    /// Must be called with `state` locked.
    fn reserve(&self) -> SpawnReservation<'_> {
        self.spawning.fetch_add(1, Ordering::SeqCst);
        SpawnReservation(&self.spawning)
    }
}

/// Holds one spawn slot; released on drop, including when the caller's
/// future is cancelled mid-spawn.
struct SpawnReservation<'a>(&'a AtomicUsize);

impl Drop for SpawnReservation<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Checkout {
    Reused(Connection),
    Spawn,
    Full,
}

// =============================================================================
// Manager
// =============================================================================

/// Per-tool pools of reusable subprocess connections.
///
/// Construct one per process and share it behind an `Arc`. Call
/// [`start`](Self::start) to run the idle sweeper and
/// [`shutdown`](Self::shutdown) to stop it and close pooled connections.
#[derive(Debug)]
pub struct ConnectionPoolManager {
    config: PoolConfig,
    pools: DashMap<ToolId, Arc<ToolSlot>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
    terminations: TaskTracker,
}

impl ConnectionPoolManager {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: DashMap::new(),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            sweeper: std::sync::Mutex::new(None),
            terminations: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::pool_closed("connection pool manager has been shut down"))
        } else {
            Ok(())
        }
    }

    fn slot(&self, tool_id: &ToolId) -> Arc<ToolSlot> {
        Arc::clone(self.pools.entry(tool_id.clone()).or_default().value())
    }

    fn slots(&self) -> Vec<(ToolId, Arc<ToolSlot>)> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Check out a connection for `tool_id`, reusing an idle one when
    /// possible and spawning from `spec` otherwise.
    ///
    /// Fails with [`Error::CapacityExceeded`] when the tool is at `max_size`
    /// with nothing idle; there is no internal waiting.
    pub async fn get_connection(&self, tool_id: &ToolId, spec: &SpawnSpec) -> Result<Connection> {
        self.ensure_open()?;
        let slot = self.slot(tool_id);

        let mut discarded = Vec::new();
        let mut reservation = None;
        let checkout = {
            let mut pool = slot.state.lock().await;
            loop {
                let Some(mut connection) = pool.idle.pop_back() else {
                    if slot.occupied(&pool) >= self.config.max_size {
                        break Checkout::Full;
                    }
                    reservation = Some(slot.reserve());
                    break Checkout::Spawn;
                };
                if connection.check_health() && !connection.is_expired(self.config.max_lifetime) {
                    connection.mark_used();
                    pool.active
                        .insert(connection.id().clone(), ActiveInfo::of(&connection));
                    break Checkout::Reused(connection);
                }
                discarded.push(connection);
            }
        };

        for connection in discarded {
            tracing::debug!(
                "connection_replaced: tool={}, connection_id={}, healthy={}",
                tool_id,
                connection.id(),
                connection.is_healthy()
            );
            self.retire(connection);
        }

        match checkout {
            Checkout::Reused(connection) => {
                tracing::debug!(
                    "connection_reused: tool={}, connection_id={}, use_count={}",
                    tool_id,
                    connection.id(),
                    connection.use_count()
                );
                Ok(connection)
            }
            Checkout::Full => {
                tracing::warn!(
                    "pool_capacity_exceeded: tool={}, max_size={}",
                    tool_id,
                    self.config.max_size
                );
                Err(Error::capacity_exceeded(tool_id.as_str(), self.config.max_size))
            }
            Checkout::Spawn => {
                let mut connection = Connection::spawn(tool_id, spec, &self.config).await?;
                let mut pool = slot.state.lock().await;
                drop(reservation);
                if self.is_closed() {
                    drop(pool);
                    self.retire(connection);
                    return Err(Error::pool_closed("connection pool manager shut down during spawn"));
                }
                connection.mark_used();
                pool.active
                    .insert(connection.id().clone(), ActiveInfo::of(&connection));
                Ok(connection)
            }
        }
    }

    /// Check a connection back in. Healthy, unexpired connections return to
    /// the idle pool (returns true); anything else is terminated in the
    /// background.
    pub async fn release_connection(&self, mut connection: Connection) -> bool {
        let slot = self
            .pools
            .get(connection.tool_id())
            .map(|entry| Arc::clone(entry.value()));

        let reason = match slot {
            None => "untracked",
            Some(slot) => {
                let mut pool = slot.state.lock().await;
                let reason = if pool.active.remove(connection.id()).is_none() {
                    Some("untracked")
                } else if self.is_closed() {
                    Some("pool_closed")
                } else if !connection.check_health() {
                    Some("unhealthy")
                } else if connection.is_expired(self.config.max_lifetime) {
                    Some("expired")
                } else {
                    None
                };
                match reason {
                    Some(reason) => reason,
                    None => {
                        connection.touch();
                        pool.idle.push_back(connection);
                        return true;
                    }
                }
            }
        };

        if reason == "untracked" {
            tracing::warn!(
                "release_untracked_connection: tool={}, connection_id={}",
                connection.tool_id(),
                connection.id()
            );
        } else {
            tracing::debug!(
                "connection_discarded: tool={}, connection_id={}, reason={}",
                connection.tool_id(),
                connection.id(),
                reason
            );
        }
        self.retire(connection);
        false
    }

    /// Liveness of `connection`'s process; updates its health metadata.
    pub fn health_check(&self, connection: &mut Connection) -> bool {
        connection.check_health()
    }

    /// Spawn idle connections for `tool_id` until it holds `min_size`.
    /// Returns how many were spawned.
    pub async fn warm_up(&self, tool_id: &ToolId, spec: &SpawnSpec) -> Result<usize> {
        self.ensure_open()?;
        let slot = self.slot(tool_id);
        let target = self.config.min_size.min(self.config.max_size);
        let mut spawned = 0;

        loop {
            let reservation = {
                let pool = slot.state.lock().await;
                if slot.occupied(&pool) >= target {
                    break;
                }
                slot.reserve()
            };
            let connection = Connection::spawn(tool_id, spec, &self.config).await?;
            let mut pool = slot.state.lock().await;
            drop(reservation);
            if self.is_closed() {
                drop(pool);
                self.retire(connection);
                return Err(Error::pool_closed("connection pool manager shut down during warm-up"));
            }
            pool.idle.push_back(connection);
            spawned += 1;
        }

        if spawned > 0 {
            tracing::info!("pool_warmed: tool={}, spawned={}", tool_id, spawned);
        }
        Ok(spawned)
    }

    /// Evict idle connections that are dead, past `max_lifetime`, or idle
    /// longer than `idle_timeout`. Idle-timeout eviction stops at `min_size`.
    /// Returns how many connections were closed.
    pub async fn close_idle_connections(&self) -> usize {
        let mut evicted = Vec::new();

        for (tool_id, slot) in self.slots() {
            let mut pool = slot.state.lock().await;
            let mut remaining = pool.idle.len() + pool.active.len();
            let mut keep = VecDeque::with_capacity(pool.idle.len());

            // Oldest first, so the most recently used survive.
            for mut connection in std::mem::take(&mut pool.idle) {
                if connection.health_check_due(self.config.health_check_interval) {
                    connection.check_health();
                }
                let reason = if !connection.is_healthy() {
                    Some("unhealthy")
                } else if connection.is_expired(self.config.max_lifetime) {
                    Some("expired")
                } else if connection.idle_for() > self.config.idle_timeout
                    && remaining > self.config.min_size
                {
                    Some("idle_timeout")
                } else {
                    None
                };
                match reason {
                    Some(reason) => {
                        tracing::debug!(
                            "connection_evicted: tool={}, connection_id={}, reason={}",
                            tool_id,
                            connection.id(),
                            reason
                        );
                        remaining -= 1;
                        evicted.push(connection);
                    }
                    None => keep.push_back(connection),
                }
            }
            pool.idle = keep;
        }

        let count = evicted.len();
        self.terminate_all(evicted).await;
        if count > 0 {
            tracing::info!("idle_connections_closed: count={}", count);
        }
        count
    }

    /// Aggregate counts, overall and per tool.
    pub async fn get_pool_stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for (tool_id, slot) in self.slots() {
            let pool = slot.state.lock().await;
            let mut tool = ToolPoolStats {
                idle: pool.idle.len(),
                active: pool.active.len(),
                spawning: slot.spawning.load(Ordering::SeqCst),
                ..Default::default()
            };
            tool.total = tool.idle + tool.active;
            for connection in &pool.idle {
                if connection.is_healthy() {
                    tool.healthy += 1;
                } else {
                    tool.unhealthy += 1;
                }
                tool.total_uses += connection.use_count();
            }
            for info in pool.active.values() {
                if info.is_healthy {
                    tool.healthy += 1;
                } else {
                    tool.unhealthy += 1;
                }
                tool.total_uses += info.use_count;
            }

            stats.total += tool.total;
            stats.idle += tool.idle;
            stats.active += tool.active;
            stats.healthy += tool.healthy;
            stats.unhealthy += tool.unhealthy;
            stats.total_uses += tool.total_uses;
            stats.tools.insert(tool_id.to_string(), tool);
        }
        stats
    }

    /// Stop the sweeper, close every idle connection and refuse further
    /// checkouts. Connections still held by callers are terminated when they
    /// are released. Returns how many idle connections were closed.
    pub async fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.cancel.cancel();

        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("pool_sweeper_join_failed: {}", e);
            }
        }

        let mut idle = Vec::new();
        let mut still_active = 0;
        for (_, slot) in self.slots() {
            let mut pool = slot.state.lock().await;
            idle.extend(pool.idle.drain(..));
            still_active += pool.active.len();
        }

        let count = idle.len();
        self.terminate_all(idle).await;
        self.terminations.close();
        self.terminations.wait().await;

        tracing::info!(
            "pool_shutdown: closed={}, still_active={}",
            count,
            still_active
        );
        count
    }

    async fn terminate_all(&self, connections: Vec<Connection>) {
        let graceful = self.config.graceful_shutdown_timeout;
        let kill = self.config.kill_timeout;
        let outcomes = futures::future::join_all(
            connections
                .into_iter()
                .map(|connection| connection.terminate(graceful, kill)),
        )
        .await;
        let failed = outcomes
            .iter()
            .filter(|outcome| **outcome == TerminationOutcome::Failed)
            .count();
        if failed > 0 {
            tracing::warn!("connections_not_reaped: count={}", failed);
        }
    }

    /// Terminate off the caller's path.
    fn retire(&self, connection: Connection) {
        let graceful = self.config.graceful_shutdown_timeout;
        let kill = self.config.kill_timeout;
        self.terminations.spawn(async move {
            let tool_id = connection.tool_id().clone();
            let connection_id = connection.id().clone();
            let outcome = connection.terminate(graceful, kill).await;
            tracing::debug!(
                "connection_terminated: tool={}, connection_id={}, outcome={}",
                tool_id,
                connection_id,
                outcome
            );
        });
    }
}
