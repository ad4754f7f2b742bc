//! Core types for toolgate.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ToolId, UserId, ConnectionId, ExecutionId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures assembled from the component configs

mod config;
mod errors;
mod ids;

pub use config::{Config, ObservabilityConfig, StoreConfig};
pub use errors::{Error, Result};
pub use ids::{ConnectionId, ExecutionId, ToolId, UserId};
