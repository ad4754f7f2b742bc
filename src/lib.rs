//! # Toolgate Core - Execution Resource Governance
//!
//! Governs access to shared execution resources for tool subprocesses:
//! - Connection pooling: reuse of spawned tool processes per tool, bounded by
//!   `max_size`, with health checks and idle/lifetime eviction
//! - Rate limiting: sliding-window logs per (user, resource) across minute,
//!   hour and day windows, with per-role limits
//! - Resource quotas: per-user CPU, memory, concurrency and daily execution
//!   ceilings with per-execution allocation records
//!
//! ## Architecture
//!
//! Cross-instance state lives in a shared counter store; pooled processes are
//! local to the instance that spawned them:
//! ```text
//!   request → ExecutionGate
//!               ├─ RateLimiter ──────────┐
//!               ├─ ResourceQuotaManager ─┼─→ CounterStore (memory | redis)
//!               │        └─ QuotaOverrideStore (memory | sqlite)
//!               └─ ConnectionPoolManager ──→ tool subprocesses
//! ```
//!
//! Rate-limit and quota checks fail open when the store is unreachable
//! (quota checks can be configured to fail closed).

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod clock;
pub mod gate;
pub mod pool;
pub mod quota;
pub mod rate_limit;
pub mod store;
pub mod types;

// Internal utilities
pub mod observability;

pub use gate::{ExecutionGate, ExecutionPermit, ExecutionRequest, GateDecision};
pub use pool::{Connection, ConnectionPoolManager, PoolConfig, PoolStats, SpawnSpec};
pub use quota::{ResourceQuotaManager, ResourceRequirements, UserQuota};
pub use rate_limit::{RateLimitResult, RateLimiter, UserRole};
pub use store::{CounterStore, InMemoryCounterStore};
pub use types::{Config, Error, Result};
