//! SQLite-backed quota overrides.
//!
//! One row per user in `user_quotas`. Calls hop onto the blocking pool; the
//! connection sits behind a mutex.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{QuotaOverrideStore, UserQuota};
use crate::store::StoreError;
use crate::types::{Error, Result, UserId};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS user_quotas (
    user_id TEXT PRIMARY KEY NOT NULL,
    max_cpu_cores REAL NOT NULL,
    max_memory_mb INTEGER NOT NULL,
    max_concurrent_executions INTEGER NOT NULL,
    max_daily_executions INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);";

fn db_error(err: rusqlite::Error) -> Error {
    StoreError::Unavailable(format!("sqlite: {err}")).into()
}

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql_int(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// [`QuotaOverrideStore`] persisted in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteQuotaOverrides {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteQuotaOverrides {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let connection = Connection::open(path).map_err(db_error)?;
        Self::init(connection)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().map_err(db_error)?;
        Self::init(connection)
    }

    fn init(connection: Connection) -> Result<Self> {
        connection.execute_batch(SCHEMA).map_err(db_error)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let guard = connection
                .lock()
                .map_err(|_| Error::from(StoreError::Unavailable("sqlite mutex poisoned".to_string())))?;
            f(&guard).map_err(db_error)
        })
        .await
        .map_err(|e| Error::internal(format!("sqlite task failed: {e}")))?
    }
}

#[async_trait]
impl QuotaOverrideStore for SqliteQuotaOverrides {
    async fn get(&self, user: &UserId) -> Result<Option<UserQuota>> {
        let user = user.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT max_cpu_cores, max_memory_mb, max_concurrent_executions, max_daily_executions
                 FROM user_quotas WHERE user_id = ?1",
                params![user],
                |row| {
                    Ok(UserQuota {
                        max_cpu_cores: row.get(0)?,
                        max_memory_mb: from_sql_int(row.get(1)?),
                        max_concurrent_executions: from_sql_int(row.get(2)?),
                        max_daily_executions: from_sql_int(row.get(3)?),
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn put(&self, user: &UserId, quota: &UserQuota) -> Result<()> {
        let user = user.to_string();
        let quota = *quota;
        let updated_at = Utc::now().to_rfc3339();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO user_quotas (user_id, max_cpu_cores, max_memory_mb,
                     max_concurrent_executions, max_daily_executions, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                     max_cpu_cores = excluded.max_cpu_cores,
                     max_memory_mb = excluded.max_memory_mb,
                     max_concurrent_executions = excluded.max_concurrent_executions,
                     max_daily_executions = excluded.max_daily_executions,
                     updated_at = excluded.updated_at",
                params![
                    user,
                    quota.max_cpu_cores,
                    to_sql_int(quota.max_memory_mb),
                    to_sql_int(quota.max_concurrent_executions),
                    to_sql_int(quota.max_daily_executions),
                    updated_at,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn remove(&self, user: &UserId) -> Result<bool> {
        let user = user.to_string();
        self.with_connection(move |conn| {
            conn.execute("DELETE FROM user_quotas WHERE user_id = ?1", params![user])
                .map(|removed| removed > 0)
        })
        .await
    }
}
