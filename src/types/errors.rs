//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Rate-limit and quota denials are not
//! errors; they are reported as structured results by their components.

use thiserror::Error;

use crate::store::StoreError;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for toolgate.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input (bad quota values, bad ids, bad config values).
    #[error("validation error: {0}")]
    Validation(String),

    /// Pool for a tool is at max_size with no idle connection. Never retried
    /// internally; the caller decides whether to retry or reject.
    #[error("capacity exceeded for tool {tool_id}: pool is at max_size {max_size}")]
    CapacityExceeded { tool_id: String, max_size: usize },

    /// Tool process could not be started, or exited immediately.
    #[error("failed to spawn tool {tool_id} ({command}): {reason}")]
    SpawnFailure {
        tool_id: String,
        command: String,
        reason: String,
    },

    /// Pool manager has been shut down.
    #[error("pool closed: {0}")]
    PoolClosed(String),

    /// Shared counter store or override store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration loading/validation errors.
    #[error("config error: {0}")]
    Config(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True for outcomes the caller is expected to handle by backing off
    /// rather than failing the request outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. } | Error::Store(StoreError::Unavailable(_)))
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn capacity_exceeded(tool_id: impl Into<String>, max_size: usize) -> Self {
        Self::CapacityExceeded {
            tool_id: tool_id.into(),
            max_size,
        }
    }

    pub fn spawn_failure(
        tool_id: impl Into<String>,
        command: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SpawnFailure {
            tool_id: tool_id.into(),
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub fn pool_closed(msg: impl Into<String>) -> Self {
        Self::PoolClosed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
