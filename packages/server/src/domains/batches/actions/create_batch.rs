//! Batch intake: a named table of rows becomes a batch of queued jobs.

use std::collections::BTreeSet;

use serde::Deserialize;
use tracing::info;

use crate::common::{BatchId, FieldMap};
use crate::domains::batches::models::{Batch, ColumnDef};
use crate::domains::jobs::models::{Job, JobStatus};
use crate::error::{OrchestratorError, Result};
use crate::kernel::ServerDeps;
use crate::storage::JobFilter;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequest {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<BatchRowInput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRowInput {
    pub url: String,
    pub goal: String,
    #[serde(default)]
    pub ground_truth: Option<FieldMap>,
}

fn validate(request: &CreateBatchRequest) -> Result<()> {
    if request.name.trim().is_empty() {
        return Err(OrchestratorError::validation("name must not be empty"));
    }
    if request.rows.is_empty() {
        return Err(OrchestratorError::validation("rows must not be empty"));
    }

    let mut names = BTreeSet::new();
    for column in &request.columns {
        if column.name.trim().is_empty() {
            return Err(OrchestratorError::validation("column names must not be empty"));
        }
        if !names.insert(column.name.as_str()) {
            return Err(OrchestratorError::validation(format!(
                "duplicate column: {}",
                column.name
            )));
        }
    }

    for (index, row) in request.rows.iter().enumerate() {
        if row.url.trim().is_empty() {
            return Err(OrchestratorError::validation(format!("row {index}: url must not be empty")));
        }
        if row.goal.trim().is_empty() {
            return Err(OrchestratorError::validation(format!("row {index}: goal must not be empty")));
        }
    }
    Ok(())
}

/// Create the batch and one queued job per row, in upload order.
pub async fn create_batch(deps: &ServerDeps, request: CreateBatchRequest) -> Result<Batch> {
    validate(&request)?;

    let batch = Batch::new(
        request.name.trim(),
        request.columns,
        request.rows.len() as i32,
    );
    let jobs: Vec<Job> = request
        .rows
        .into_iter()
        .enumerate()
        .map(|(index, row)| {
            let mut job = Job::builder()
                .batch_id(batch.id)
                .row_index(index as i32)
                .url(row.url.trim())
                .goal(row.goal)
                .build();
            job.ground_truth = row.ground_truth.filter(|gt| !gt.is_empty());
            job
        })
        .collect();

    deps.store.insert_batch(&batch, &jobs).await?;
    info!(batch_id = %batch.id, rows = jobs.len(), "Batch created");
    Ok(batch)
}

pub async fn get_batch(deps: &ServerDeps, id: BatchId) -> Result<Batch> {
    deps.store
        .find_batch(id)
        .await?
        .ok_or_else(|| OrchestratorError::not_found("batch", id))
}

/// The batch's jobs in row order, optionally narrowed to one status.
pub async fn list_batch_jobs(
    deps: &ServerDeps,
    id: BatchId,
    status: Option<JobStatus>,
) -> Result<Vec<Job>> {
    get_batch(deps, id).await?;
    let mut filter = JobFilter::batch(id);
    filter.status = status;
    Ok(deps.store.list_jobs(&filter).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::TestDependencies;
    use serde_json::json;

    fn request(rows: serde_json::Value) -> CreateBatchRequest {
        serde_json::from_value(json!({
            "name": "Pricing",
            "columns": [{ "name": "price", "kind": "text", "isGroundTruth": true }],
            "rows": rows,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn creates_queued_jobs_in_row_order() {
        let deps = TestDependencies::new().into_deps();
        let batch = create_batch(
            &deps,
            request(json!([
                { "url": "https://a.example", "goal": "price", "groundTruth": { "price": "$5" } },
                { "url": "https://b.example", "goal": "price" },
            ])),
        )
        .await
        .unwrap();

        let jobs = list_batch_jobs(&deps, batch.id, None).await.unwrap();
        assert_eq!(batch.total_rows, 2);
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Queued));
        assert_eq!(jobs[0].row_index, 0);
        assert!(jobs[0].has_ground_truth());
        assert!(jobs[1].ground_truth.is_none());
    }

    #[tokio::test]
    async fn rejects_blank_url() {
        let deps = TestDependencies::new().into_deps();
        let err = create_batch(&deps, request(json!([{ "url": " ", "goal": "price" }])))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn rejects_empty_rows() {
        let deps = TestDependencies::new().into_deps();
        let err = create_batch(&deps, request(json!([]))).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let deps = TestDependencies::new().into_deps();
        let err = get_batch(&deps, BatchId::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { entity: "batch", .. }));
    }
}
