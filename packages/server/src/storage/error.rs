//! Typed errors for the storage layer.

use thiserror::Error;

use crate::common::BatchId;
use crate::domains::executions::models::Execution;

/// Errors a store can return.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// A launch hit the one-active-execution-per-batch rule.
    #[error("batch {} already has an active execution {}", .0.batch_id, .0.id)]
    ActiveExecution(Box<Execution>),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be mapped back to a model.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("in-memory store lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, StoreError>;
