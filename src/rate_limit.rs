//! Rate limiting and throttling.
//!
//! Sliding-window-log limiter over the shared counter store. Each
//! (user, resource, window) owns a sorted set of request timestamps; a check
//! prunes entries that left the window and compares the survivors against the
//! role's limit for that window. Minute, hour and day windows must all pass.
//!
//! Checks fail open: a store outage admits the request with `degraded = true`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::clock::{epoch_seconds, Clock, SystemClock};
use crate::store::{CounterStore, StoreResult};
use crate::types::{Result, UserId};

/// Caller tier. Each tier has its own per-window limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Viewer,
    Developer,
    Admin,
}

impl FromStr for UserRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "viewer" => Ok(UserRole::Viewer),
            "developer" => Ok(UserRole::Developer),
            "admin" => Ok(UserRole::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Sliding window, checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindow {
    Minute,
    Hour,
    Day,
}

impl RateWindow {
    pub const ALL: [RateWindow; 3] = [RateWindow::Minute, RateWindow::Hour, RateWindow::Day];

    pub fn duration(self) -> Duration {
        match self {
            RateWindow::Minute => Duration::minutes(1),
            RateWindow::Hour => Duration::hours(1),
            RateWindow::Day => Duration::days(1),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RateWindow::Minute => "minute",
            RateWindow::Hour => "hour",
            RateWindow::Day => "day",
        }
    }
}

impl fmt::Display for RateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request ceilings for one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl WindowLimits {
    pub fn limit(&self, window: RateWindow) -> u32 {
        match window {
            RateWindow::Minute => self.per_minute,
            RateWindow::Hour => self.per_hour,
            RateWindow::Day => self.per_day,
        }
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub viewer: WindowLimits,
    pub developer: WindowLimits,
    pub admin: WindowLimits,
    /// Added to each window's duration when (re)setting key expiry so
    /// abandoned windows clean themselves up.
    #[serde(with = "humantime_serde")]
    pub key_expiry_buffer: std::time::Duration,
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            viewer: WindowLimits {
                per_minute: 10,
                per_hour: 100,
                per_day: 1000,
            },
            developer: WindowLimits {
                per_minute: 60,
                per_hour: 1000,
                per_day: 10_000,
            },
            admin: WindowLimits {
                per_minute: 300,
                per_hour: 5000,
                per_day: 50_000,
            },
            key_expiry_buffer: std::time::Duration::from_secs(60),
            key_prefix: "ratelimit".to_string(),
        }
    }
}

impl RateLimitConfig {
    pub fn limits_for(&self, role: UserRole) -> &WindowLimits {
        match role {
            UserRole::Viewer => &self.viewer,
            UserRole::Developer => &self.developer,
            UserRole::Admin => &self.admin,
        }
    }
}

/// Outcome of a rate-limit check. Denial is a value, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Requests left in `window` (the violated window when denied, the window
    /// with the least headroom when allowed).
    pub remaining: u32,
    pub limit: u32,
    pub window: RateWindow,
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until a slot frees up; only set when denied.
    #[serde(with = "humantime_serde")]
    pub retry_after: Option<std::time::Duration>,
    pub reason: Option<String>,
    /// True when the store failed and the request was admitted anyway.
    pub degraded: bool,
}

/// Read-only view of the minute window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub window: RateWindow,
    pub limit: u32,
    pub used: u32,
    pub remaining: u32,
}

/// Sliding-window rate limiter over a shared [`CounterStore`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn CounterStore>,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn key(&self, user: &UserId, resource: &str, window: RateWindow) -> String {
        format!(
            "{}:{}:{}:{}",
            self.config.key_prefix,
            user,
            resource,
            window.as_str()
        )
    }

    /// Check whether `user` may issue another request against `resource`.
    ///
    /// Prunes expired entries as a side effect but never records the request;
    /// call [`consume_quota`](Self::consume_quota) once the request proceeds.
    pub async fn check_rate_limit(
        &self,
        user: &UserId,
        role: UserRole,
        resource: &str,
    ) -> RateLimitResult {
        let now = self.clock.now();
        match self.evaluate(user, role, resource, now).await {
            Ok(result) => {
                if !result.allowed {
                    tracing::debug!(
                        "rate_limit_denied: user={}, resource={}, window={}, retry_after={:?}",
                        user,
                        resource,
                        result.window,
                        result.retry_after
                    );
                }
                result
            }
            Err(e) => {
                tracing::warn!(
                    "rate_limit_check_failed_open: user={}, resource={}, error={}",
                    user,
                    resource,
                    e
                );
                let limit = self.config.limits_for(role).per_minute;
                RateLimitResult {
                    allowed: true,
                    remaining: limit,
                    limit,
                    window: RateWindow::Minute,
                    reset_at: now + RateWindow::Minute.duration(),
                    retry_after: None,
                    reason: Some(format!("rate limit store unavailable: {e}")),
                    degraded: true,
                }
            }
        }
    }

    async fn evaluate(
        &self,
        user: &UserId,
        role: UserRole,
        resource: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitResult> {
        let limits = self.config.limits_for(role);
        let now_s = epoch_seconds(now);
        let mut tightest: Option<RateLimitResult> = None;

        for window in RateWindow::ALL {
            let key = self.key(user, resource, window);
            let span = window.duration();
            let cutoff = now_s - span.num_seconds() as f64;

            self.store
                .zrem_range_by_score(&key, f64::NEG_INFINITY, cutoff)
                .await?;
            let count = self.store.zcard(&key).await?;
            let limit = limits.limit(window);

            let oldest = self
                .store
                .zrange_with_scores(&key, 0, 0)
                .await?
                .first()
                .map(|(_, score)| *score);
            let reset_at = oldest
                .and_then(from_epoch_seconds)
                .map_or(now + span, |at| at + span);

            if count >= u64::from(limit) {
                let wait_secs = (reset_at - now).num_milliseconds().max(0) as f64 / 1000.0;
                let retry_after = std::time::Duration::from_secs(wait_secs.ceil().max(1.0) as u64);
                return Ok(RateLimitResult {
                    allowed: false,
                    remaining: 0,
                    limit,
                    window,
                    reset_at,
                    retry_after: Some(retry_after),
                    reason: Some(format!(
                        "rate limit exceeded: {} requests per {}",
                        limit, window
                    )),
                    degraded: false,
                });
            }

            let remaining = limit - count as u32;
            if tightest.as_ref().map_or(true, |t| remaining < t.remaining) {
                tightest = Some(RateLimitResult {
                    allowed: true,
                    remaining,
                    limit,
                    window,
                    reset_at,
                    retry_after: None,
                    reason: None,
                    degraded: false,
                });
            }
        }

        // ALL is non-empty, so the loop either returned or set `tightest`.
        Ok(tightest.unwrap_or(RateLimitResult {
            allowed: true,
            remaining: limits.per_minute,
            limit: limits.per_minute,
            window: RateWindow::Minute,
            reset_at: now + RateWindow::Minute.duration(),
            retry_after: None,
            reason: None,
            degraded: false,
        }))
    }

    /// Record `amount` requests in every window and refresh each window key's
    /// expiry. Returns false (and logs) if the store rejected the write.
    pub async fn consume_quota(
        &self,
        user: &UserId,
        role: UserRole,
        resource: &str,
        amount: u32,
    ) -> bool {
        if amount == 0 {
            return true;
        }
        match self.record(user, resource, amount).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "rate_limit_consume_failed: user={}, role={:?}, resource={}, amount={}, error={}",
                    user,
                    role,
                    resource,
                    amount,
                    e
                );
                false
            }
        }
    }

    async fn record(&self, user: &UserId, resource: &str, amount: u32) -> StoreResult<()> {
        let now_s = epoch_seconds(self.clock.now());
        for window in RateWindow::ALL {
            let key = self.key(user, resource, window);
            for _ in 0..amount {
                let member = format!("{:.6}:{}", now_s, uuid::Uuid::new_v4());
                self.store.zadd(&key, &member, now_s).await?;
            }
            let span = window.duration().to_std().unwrap_or_default();
            self.store
                .expire(&key, span + self.config.key_expiry_buffer)
                .await?;
        }
        Ok(())
    }

    /// Minute-window usage without pruning or recording anything.
    pub async fn get_rate_limit_status(
        &self,
        user: &UserId,
        role: UserRole,
        resource: &str,
    ) -> Result<RateLimitStatus> {
        let window = RateWindow::Minute;
        let now_s = epoch_seconds(self.clock.now());
        // Scores carry microsecond precision; exclude entries exactly at the
        // cutoff to match the pruning rule.
        let cutoff = now_s - window.duration().num_seconds() as f64 + 1e-6;
        let used = self
            .store
            .zcount(&self.key(user, resource, window), cutoff, f64::INFINITY)
            .await?;
        let limit = self.config.limits_for(role).limit(window);
        let used = u32::try_from(used).unwrap_or(u32::MAX);
        Ok(RateLimitStatus {
            window,
            limit,
            used,
            remaining: limit.saturating_sub(used),
        })
    }

    /// Administrative override: clear every window for (user, resource).
    pub async fn reset_rate_limit(&self, user: &UserId, resource: &str) -> Result<()> {
        for window in RateWindow::ALL {
            self.store.delete(&self.key(user, resource, window)).await?;
        }
        tracing::info!("rate_limit_reset: user={}, resource={}", user, resource);
        Ok(())
    }
}

fn from_epoch_seconds(score: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros((score * 1_000_000.0).round() as i64)
}
