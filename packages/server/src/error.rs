//! Errors returned by orchestrator operations.
//!
//! Every rejected command carries enough state for the caller to see why:
//! conflicts embed the current execution, bulk rejections list each target.

use std::fmt::Display;

use thiserror::Error;

use crate::domains::executions::models::Execution;
use crate::domains::jobs::models::BulkRejection;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{0}")]
    Validation(String),

    /// A launch collided with the batch's running or paused execution.
    #[error("batch {} already has an active execution {}", .0.batch_id, .0.id)]
    ActiveExecution(Box<Execution>),

    #[error("cannot {action} execution {} while it is {}", .execution.id, .execution.status.as_str())]
    InvalidTransition {
        action: &'static str,
        execution: Box<Execution>,
    },

    /// Nothing was applied; every rejected target is listed.
    #[error("bulk operation rejected for {} job(s)", .0.len())]
    BulkRejected(Vec<BulkRejection>),

    #[error(transparent)]
    Store(StoreError),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_transition(action: &'static str, execution: Execution) -> Self {
        Self::InvalidTransition {
            action,
            execution: Box::new(execution),
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BatchNotFound(id) => Self::not_found("batch", id),
            StoreError::ActiveExecution(execution) => Self::ActiveExecution(execution),
            other => Self::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
