//! Bulk job operations.
//!
//! Every bulk request is all-or-nothing: if any target is missing or running,
//! the response is a 409 listing each rejected job and nothing is written.

use axum::{extract::Extension, Json};
use serde::{Deserialize, Serialize};

use crate::common::JobId;
use crate::domains::jobs::actions;
use crate::domains::jobs::models::{Job, JobPatch};
use crate::server::app::AppState;
use crate::server::error::ApiResult;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkJobsRequest {
    job_ids: Vec<JobId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateRequest {
    job_ids: Vec<JobId>,
    #[serde(flatten)]
    patch: JobPatch,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkJobsResponse {
    jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDeleteResponse {
    deleted: u64,
}

/// POST /jobs/bulk - rerun
pub async fn bulk_rerun(
    Extension(state): Extension<AppState>,
    Json(request): Json<BulkJobsRequest>,
) -> ApiResult<Json<BulkJobsResponse>> {
    let jobs = state.executions.rerun_jobs(&request.job_ids).await?;
    Ok(Json(BulkJobsResponse { jobs }))
}

/// DELETE /jobs/bulk
pub async fn bulk_delete(
    Extension(state): Extension<AppState>,
    Json(request): Json<BulkJobsRequest>,
) -> ApiResult<Json<BulkDeleteResponse>> {
    let deleted = actions::delete_jobs(&state.deps, &request.job_ids).await?;
    Ok(Json(BulkDeleteResponse { deleted }))
}

/// PATCH /jobs/bulk
pub async fn bulk_update(
    Extension(state): Extension<AppState>,
    Json(request): Json<BulkUpdateRequest>,
) -> ApiResult<Json<BulkJobsResponse>> {
    let jobs = actions::update_jobs(&state.deps, &request.job_ids, &request.patch).await?;
    Ok(Json(BulkJobsResponse { jobs }))
}
