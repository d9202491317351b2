//! Batch intake, ground-truth metrics and failure analysis.

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::common::BatchId;
use crate::domains::accuracy::models::{
    AccuracyReport, MetricsSnapshot, SnapshotTrigger, TrendReport,
};
use crate::domains::batches::actions::{self, CreateBatchRequest};
use crate::domains::batches::models::Batch;
use crate::domains::failures::{analyze_failures, FailureReport};
use crate::domains::jobs::models::{Job, JobStatus};
use crate::server::app::AppState;
use crate::server::error::ApiResult;

const DEFAULT_SNAPSHOT_LIMIT: usize = 20;

/// POST /batches
pub async fn create_batch(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateBatchRequest>,
) -> ApiResult<(StatusCode, Json<Batch>)> {
    let batch = actions::create_batch(&state.deps, request).await?;
    Ok((StatusCode::CREATED, Json(batch)))
}

/// GET /batches/:id
pub async fn get_batch(
    Extension(state): Extension<AppState>,
    Path(id): Path<BatchId>,
) -> ApiResult<Json<Batch>> {
    Ok(Json(actions::get_batch(&state.deps, id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    status: Option<JobStatus>,
}

/// GET /batches/:id/jobs?status=
pub async fn list_jobs(
    Extension(state): Extension<AppState>,
    Path(id): Path<BatchId>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let jobs = actions::list_batch_jobs(&state.deps, id, query.status).await?;
    Ok(Json(jobs))
}

/// GET /batches/:id/ground-truth/column-metrics
pub async fn column_metrics(
    Extension(state): Extension<AppState>,
    Path(id): Path<BatchId>,
) -> ApiResult<Json<AccuracyReport>> {
    Ok(Json(state.deps.metrics.recompute(id).await?))
}

/// POST /batches/:id/ground-truth/snapshot
pub async fn create_snapshot(
    Extension(state): Extension<AppState>,
    Path(id): Path<BatchId>,
) -> ApiResult<(StatusCode, Json<MetricsSnapshot>)> {
    let snapshot = state
        .deps
        .metrics
        .snapshot(id, None, SnapshotTrigger::Manual)
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotsQuery {
    limit: Option<usize>,
}

/// GET /batches/:id/ground-truth/snapshots?limit=
pub async fn list_snapshots(
    Extension(state): Extension<AppState>,
    Path(id): Path<BatchId>,
    Query(query): Query<SnapshotsQuery>,
) -> ApiResult<Json<Vec<MetricsSnapshot>>> {
    let limit = query.limit.unwrap_or(DEFAULT_SNAPSHOT_LIMIT);
    Ok(Json(state.deps.metrics.snapshots(id, limit).await?))
}

/// GET /batches/:id/ground-truth/trend
pub async fn trend(
    Extension(state): Extension<AppState>,
    Path(id): Path<BatchId>,
) -> ApiResult<Json<TrendReport>> {
    Ok(Json(state.deps.metrics.trend(id).await?))
}

/// GET /batches/:id/failure-patterns
pub async fn failure_patterns(
    Extension(state): Extension<AppState>,
    Path(id): Path<BatchId>,
) -> ApiResult<Json<FailureReport>> {
    let jobs = actions::list_batch_jobs(&state.deps, id, None).await?;
    Ok(Json(analyze_failures(id, &jobs)))
}
