//! Test fixtures for creating batches and launching executions.

use anyhow::Result;
use orchestrator_core::common::FieldMap;
use orchestrator_core::domains::batches::actions::{create_batch, BatchRowInput, CreateBatchRequest};
use orchestrator_core::domains::batches::models::{Batch, ColumnDef, ColumnKind};
use orchestrator_core::domains::executions::models::{Execution, ExecutionType};
use orchestrator_core::domains::executions::LaunchRequest;
use orchestrator_core::domains::jobs::models::Job;
use orchestrator_core::storage::JobFilter;
use serde_json::json;

use super::TestHarness;

/// URL of the row at `index`.
pub fn row_url(index: usize) -> String {
    format!("https://shop.example.org/item/{}", index)
}

/// Fields the default mock agent extracts for every row.
pub fn extracted_fields() -> FieldMap {
    FieldMap::from([
        ("price".to_string(), json!("$20")),
        ("title".to_string(), json!("Blue Widget")),
    ])
}

/// A batch with `rows` rows whose ground truth matches [`extracted_fields`].
pub fn batch_request(name: &str, rows: usize) -> CreateBatchRequest {
    CreateBatchRequest {
        name: name.to_string(),
        columns: vec![
            ColumnDef::ground_truth("price", ColumnKind::Text),
            ColumnDef::ground_truth("title", ColumnKind::Text),
        ],
        rows: (0..rows)
            .map(|i| BatchRowInput {
                url: row_url(i),
                goal: "Find the product price and title".to_string(),
                ground_truth: Some(extracted_fields()),
            })
            .collect(),
    }
}

/// Create a batch directly through the domain action.
pub async fn create_test_batch(ctx: &TestHarness, rows: usize) -> Result<Batch> {
    Ok(create_batch(&ctx.deps, batch_request("Test Batch", rows)).await?)
}

/// Launch a full execution at the given concurrency.
pub async fn launch_full(ctx: &TestHarness, batch: &Batch, concurrency: i32) -> Result<Execution> {
    Ok(ctx
        .executions()
        .launch(LaunchRequest {
            batch_id: batch.id,
            execution_type: ExecutionType::Full,
            concurrency: Some(concurrency),
            sample_size: None,
        })
        .await?)
}

/// Every job of the batch in row order.
pub async fn batch_jobs(ctx: &TestHarness, batch: &Batch) -> Result<Vec<Job>> {
    Ok(ctx.deps.store.list_jobs(&JobFilter::batch(batch.id)).await?)
}
