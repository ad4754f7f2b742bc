//! Configuration structures.
//!
//! Configuration is loaded from a JSON file and/or `TOOLGATE_*` environment
//! variables. Component configs live next to their components and are
//! assembled here.

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::errors::{Error, Result};
use crate::pool::PoolConfig;
use crate::quota::{FailMode, QuotaConfig};
use crate::rate_limit::RateLimitConfig;

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Connection pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Rate limiter tiers and key settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Quota defaults and failure mode.
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Backing store locations.
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Override selected fields from `TOOLGATE_*` environment variables.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = var("TOOLGATE_REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Some(path) = var("TOOLGATE_SQLITE_PATH") {
            self.store.sqlite_path = path;
        }
        if let Some(raw) = var("TOOLGATE_POOL_MAX_SIZE") {
            self.pool.max_size = raw
                .parse()
                .map_err(|_| Error::config(format!("TOOLGATE_POOL_MAX_SIZE is not a number: {raw}")))?;
        }
        if let Some(raw) = var("TOOLGATE_QUOTA_FAIL_MODE") {
            self.quota.fail_mode = match raw.to_ascii_lowercase().as_str() {
                "open" => FailMode::Open,
                "closed" => FailMode::Closed,
                other => {
                    return Err(Error::config(format!(
                        "TOOLGATE_QUOTA_FAIL_MODE must be open or closed, got {other}"
                    )))
                }
            };
        }
        if let Some(level) = var("TOOLGATE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject configurations the components cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(Error::config("pool.max_size must be at least 1"));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(Error::config(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        self.quota.defaults.validate()?;
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Backing store locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL for the shared counter store.
    pub redis_url: String,

    /// Key prefix applied by the Redis backend to every key.
    pub redis_key_prefix: String,

    /// SQLite database holding per-user quota overrides.
    pub sqlite_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_key_prefix: "toolgate".to_string(),
            sqlite_path: "toolgate.db".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.quota.fail_mode, FailMode::Open);
    }

    #[test]
    fn rejects_min_above_max() {
        let mut config = Config::default();
        config.pool.min_size = 11;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn loads_partial_json_with_humantime_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"pool": {{"min_size": 1, "max_size": 3, "idle_timeout": "30s", "max_lifetime": "10m",
                "health_check_interval": "5s", "sweep_interval": "15s", "spawn_timeout": "2s",
                "spawn_grace": "50ms", "graceful_shutdown_timeout": "1s", "kill_timeout": "1s"}},
               "quota": {{"fail_mode": "closed"}}}}"#
        )
        .unwrap();

        let config = Config::from_json_file(file.path()).unwrap();
        assert_eq!(config.pool.max_size, 3);
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.pool.spawn_grace, Duration::from_millis(50));
        assert_eq!(config.quota.fail_mode, FailMode::Closed);
        assert_eq!(config.rate_limit.viewer.per_minute, 10);
    }

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn env_overrides_apply_and_blank_values_are_ignored() {
        let vars = [
            ("TOOLGATE_REDIS_URL", "redis://cache:6380"),
            ("TOOLGATE_SQLITE_PATH", "  "),
            ("TOOLGATE_POOL_MAX_SIZE", "4"),
            ("TOOLGATE_QUOTA_FAIL_MODE", "Closed"),
            ("TOOLGATE_LOG_LEVEL", "debug"),
        ];
        let config = Config::default().apply_overrides(lookup(&vars)).unwrap();
        assert_eq!(config.store.redis_url, "redis://cache:6380");
        assert_eq!(config.store.sqlite_path, "toolgate.db");
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.quota.fail_mode, FailMode::Closed);
        assert_eq!(config.observability.log_level, "debug");
    }

    #[test]
    fn env_overrides_reject_bad_values() {
        let bad_size = [("TOOLGATE_POOL_MAX_SIZE", "many")];
        assert!(matches!(
            Config::default().apply_overrides(lookup(&bad_size)),
            Err(Error::Config(_))
        ));

        let bad_mode = [("TOOLGATE_QUOTA_FAIL_MODE", "sometimes")];
        assert!(matches!(
            Config::default().apply_overrides(lookup(&bad_mode)),
            Err(Error::Config(_))
        ));

        let zero = [("TOOLGATE_POOL_MAX_SIZE", "0")];
        assert!(matches!(
            Config::default().apply_overrides(lookup(&zero)),
            Err(Error::Config(_))
        ));
    }
}
