//! Execution lifecycle endpoints.

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::common::{BatchId, ExecutionId};
use crate::domains::executions::models::Execution;
use crate::domains::executions::{ExecutionStats, LaunchRequest, DEFAULT_RUNNING_LIMIT};
use crate::server::app::AppState;
use crate::server::error::ApiResult;

/// POST /executions
pub async fn create_execution(
    Extension(state): Extension<AppState>,
    Json(request): Json<LaunchRequest>,
) -> ApiResult<(StatusCode, Json<Execution>)> {
    let execution = state.executions.launch(request).await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExecutionsQuery {
    batch_id: Option<BatchId>,
}

/// GET /executions?batchId=
pub async fn list_executions(
    Extension(state): Extension<AppState>,
    Query(query): Query<ListExecutionsQuery>,
) -> ApiResult<Json<Vec<Execution>>> {
    Ok(Json(state.executions.list(query.batch_id).await?))
}

/// GET /executions/:id
pub async fn get_execution(
    Extension(state): Extension<AppState>,
    Path(id): Path<ExecutionId>,
) -> ApiResult<Json<Execution>> {
    Ok(Json(state.executions.get(id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateExecutionRequest {
    concurrency: i32,
}

/// PATCH /executions/:id
pub async fn update_execution(
    Extension(state): Extension<AppState>,
    Path(id): Path<ExecutionId>,
    Json(request): Json<UpdateExecutionRequest>,
) -> ApiResult<Json<Execution>> {
    let execution = state
        .executions
        .set_concurrency(id, request.concurrency)
        .await?;
    Ok(Json(execution))
}

/// POST /executions/:id/pause
pub async fn pause_execution(
    Extension(state): Extension<AppState>,
    Path(id): Path<ExecutionId>,
) -> ApiResult<Json<Execution>> {
    Ok(Json(state.executions.pause(id).await?))
}

/// POST /executions/:id/resume
pub async fn resume_execution(
    Extension(state): Extension<AppState>,
    Path(id): Path<ExecutionId>,
) -> ApiResult<Json<Execution>> {
    Ok(Json(state.executions.resume(id).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    reason: Option<String>,
}

/// POST /executions/:id/stop
///
/// The body is optional.
pub async fn stop_execution(
    Extension(state): Extension<AppState>,
    Path(id): Path<ExecutionId>,
    request: Option<Json<StopRequest>>,
) -> ApiResult<Json<Execution>> {
    let Json(request) = request.unwrap_or_default();
    Ok(Json(state.executions.stop(id, request.reason).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    running_limit: Option<usize>,
}

/// GET /executions/:id/stats?runningLimit=
pub async fn execution_stats(
    Extension(state): Extension<AppState>,
    Path(id): Path<ExecutionId>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<ExecutionStats>> {
    let limit = query.running_limit.unwrap_or(DEFAULT_RUNNING_LIMIT);
    Ok(Json(state.executions.stats(id, limit).await?))
}
