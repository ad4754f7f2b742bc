//! Toolgate admin CLI - main entry point.
//!
//! Operator commands against the shared Redis counter store and the SQLite
//! quota overrides:
//! - rate-status: minute-window usage for a user and resource
//! - reset-rate-limit: clear every window for a user and resource
//! - quota-usage: per-dimension usage, limit and headroom
//! - set-quota: persist new limits for a user
//!
//! Results are printed as JSON.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use toolgate_core::quota::{QuotaUpdate, SqliteQuotaOverrides};
use toolgate_core::store::RedisCounterStore;
use toolgate_core::types::UserId;
use toolgate_core::{Config, Error, RateLimiter, ResourceQuotaManager, UserRole};

#[derive(Debug, Parser)]
#[command(name = "toolgate", version, about = "Toolgate rate limit and quota administration")]
struct Cli {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(long, env = "TOOLGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show minute-window usage for a user and resource.
    RateStatus {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "viewer")]
        role: String,
        #[arg(long, default_value = "tool_execution")]
        resource: String,
    },
    /// Clear every rate-limit window for a user and resource.
    ResetRateLimit {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "tool_execution")]
        resource: String,
    },
    /// Show quota usage for a user.
    QuotaUsage {
        #[arg(long)]
        user: String,
    },
    /// Persist new quota limits for a user. Omitted limits are unchanged.
    SetQuota {
        #[arg(long)]
        user: String,
        #[arg(long)]
        cpu_cores: Option<f64>,
        #[arg(long)]
        memory_mb: Option<u64>,
        #[arg(long)]
        concurrent: Option<u64>,
        #[arg(long)]
        daily: Option<u64>,
    },
}

fn parse_user(raw: &str) -> Result<UserId, Error> {
    UserId::from_string(raw.to_string()).map_err(Error::validation)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    }
    .apply_env()?;

    // Initialize observability
    toolgate_core::observability::init_tracing_from(&config.observability);

    let store = Arc::new(
        RedisCounterStore::connect(&config.store.redis_url, config.store.redis_key_prefix.clone())
            .await
            .map_err(Error::from)?,
    );

    let output = match cli.command {
        Command::RateStatus {
            user,
            role,
            resource,
        } => {
            let role: UserRole = role.parse().map_err(Error::validation)?;
            let limiter = RateLimiter::new(store, config.rate_limit.clone());
            let status = limiter
                .get_rate_limit_status(&parse_user(&user)?, role, &resource)
                .await?;
            serde_json::to_value(status)?
        }
        Command::ResetRateLimit { user, resource } => {
            let user = parse_user(&user)?;
            let limiter = RateLimiter::new(store, config.rate_limit.clone());
            limiter.reset_rate_limit(&user, &resource).await?;
            serde_json::json!({ "reset": true, "user": user, "resource": resource })
        }
        Command::QuotaUsage { user } => {
            let overrides = Arc::new(SqliteQuotaOverrides::open(&config.store.sqlite_path)?);
            let quotas = ResourceQuotaManager::new(store, overrides, config.quota.clone());
            serde_json::to_value(quotas.get_quota_usage(&parse_user(&user)?).await?)?
        }
        Command::SetQuota {
            user,
            cpu_cores,
            memory_mb,
            concurrent,
            daily,
        } => {
            let overrides = Arc::new(SqliteQuotaOverrides::open(&config.store.sqlite_path)?);
            let quotas = ResourceQuotaManager::new(store, overrides, config.quota.clone());
            let update = QuotaUpdate {
                max_cpu_cores: cpu_cores,
                max_memory_mb: memory_mb,
                max_concurrent_executions: concurrent,
                max_daily_executions: daily,
            };
            serde_json::to_value(quotas.update_user_quota(&parse_user(&user)?, update).await?)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
