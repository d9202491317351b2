//! HTTP error mapping.
//!
//! Conflicts carry the authoritative current state so clients can reconcile
//! without a second request.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::domains::executions::models::Execution;
use crate::domains::jobs::models::BulkRejection;
use crate::error::OrchestratorError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<Execution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<Vec<BulkRejection>>,
}

impl ErrorBody {
    fn message(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            execution: None,
            rejected: None,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Orchestrator(OrchestratorError),
    BadRequest(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self::Orchestrator(err)
    }
}

impl From<crate::storage::StoreError> for ApiError {
    fn from(err: crate::storage::StoreError) -> Self {
        Self::Orchestrator(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::BadRequest(message) => {
                return (StatusCode::BAD_REQUEST, Json(ErrorBody::message(message))).into_response()
            }
            ApiError::Orchestrator(err) => err,
        };

        let message = err.to_string();
        let (status, body) = match err {
            OrchestratorError::NotFound { .. } => (StatusCode::NOT_FOUND, ErrorBody::message(message)),
            OrchestratorError::Validation(_) => (StatusCode::BAD_REQUEST, ErrorBody::message(message)),
            OrchestratorError::ActiveExecution(execution)
            | OrchestratorError::InvalidTransition { execution, .. } => (
                StatusCode::CONFLICT,
                ErrorBody {
                    execution: Some(*execution),
                    ..ErrorBody::message(message)
                },
            ),
            OrchestratorError::BulkRejected(rejected) => (
                StatusCode::CONFLICT,
                ErrorBody {
                    rejected: Some(rejected),
                    ..ErrorBody::message(message)
                },
            ),
            OrchestratorError::Store(e) => {
                tracing::error!(error = %e, "Store error while handling request");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorBody::message("internal error"),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
