//! Batch-level accuracy: recomputation, snapshots and trends.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument};

use super::metrics::{compute_accuracy, compute_trend};
use super::models::{AccuracyReport, MetricsSnapshot, SnapshotTrigger, TrendReport};
use crate::common::{BatchId, ExecutionId, SnapshotId};
use crate::domains::events::models::{EventType, NewEvent};
use crate::domains::events::EventPublisher;
use crate::error::{OrchestratorError, Result};
use crate::storage::{JobFilter, Store};

#[derive(Clone)]
pub struct MetricsAggregator {
    store: Arc<dyn Store>,
    events: EventPublisher,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn Store>, events: EventPublisher) -> Self {
        Self { store, events }
    }

    /// Fold every scored job of the batch into fresh column metrics.
    pub async fn recompute(&self, batch_id: BatchId) -> Result<AccuracyReport> {
        let batch = self
            .store
            .find_batch(batch_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("batch", batch_id))?;
        let jobs = self.store.list_jobs(&JobFilter::batch(batch_id)).await?;
        Ok(compute_accuracy(&batch, &jobs))
    }

    /// Record an immutable snapshot and refresh the batch's accuracy fields.
    #[instrument(skip(self), err)]
    pub async fn snapshot(
        &self,
        batch_id: BatchId,
        execution_id: Option<ExecutionId>,
        trigger: SnapshotTrigger,
    ) -> Result<MetricsSnapshot> {
        let report = self.recompute(batch_id).await?;
        let now = Utc::now();
        let snapshot = MetricsSnapshot {
            id: SnapshotId::new(),
            batch_id,
            execution_id,
            trigger,
            column_metrics: report.column_metrics,
            overall_accuracy: report.overall_accuracy,
            jobs_scored: report.jobs_scored,
            created_at: now,
        };

        self.store.insert_snapshot(&snapshot).await?;
        self.store
            .update_batch_accuracy(batch_id, snapshot.overall_accuracy, now)
            .await?;

        self.events
            .emit(
                NewEvent::new(EventType::MetricsSnapshotCreated, batch_id)
                    .maybe_execution(execution_id)
                    .payload(json!({
                        "snapshotId": snapshot.id,
                        "trigger": snapshot.trigger,
                        "overallAccuracy": snapshot.overall_accuracy,
                        "jobsScored": snapshot.jobs_scored,
                    })),
            )
            .await;

        info!(
            snapshot_id = %snapshot.id,
            overall_accuracy = ?snapshot.overall_accuracy,
            jobs_scored = snapshot.jobs_scored,
            "Metrics snapshot created"
        );
        Ok(snapshot)
    }

    /// Snapshot history, newest first.
    pub async fn snapshots(&self, batch_id: BatchId, limit: usize) -> Result<Vec<MetricsSnapshot>> {
        self.ensure_batch(batch_id).await?;
        Ok(self.store.list_snapshots(batch_id, limit).await?)
    }

    /// Compare the two newest snapshots.
    pub async fn trend(&self, batch_id: BatchId) -> Result<TrendReport> {
        self.ensure_batch(batch_id).await?;
        let snapshots = self.store.list_snapshots(batch_id, 2).await?;
        Ok(compute_trend(batch_id, &snapshots))
    }

    /// Recompute accuracy for every batch with an active execution and store
    /// it on the batch. No snapshot is written. Returns how many batches were
    /// refreshed.
    pub async fn refresh_active(&self) -> Result<usize> {
        let batch_ids: BTreeSet<BatchId> = self
            .store
            .list_active_executions()
            .await?
            .into_iter()
            .map(|e| e.batch_id)
            .collect();

        for batch_id in &batch_ids {
            let report = self.recompute(*batch_id).await?;
            self.store
                .update_batch_accuracy(*batch_id, report.overall_accuracy, Utc::now())
                .await?;
            debug!(batch_id = %batch_id, overall_accuracy = ?report.overall_accuracy, "Batch accuracy refreshed");
        }
        Ok(batch_ids.len())
    }

    async fn ensure_batch(&self, batch_id: BatchId) -> Result<()> {
        match self.store.find_batch(batch_id).await? {
            Some(_) => Ok(()),
            None => Err(OrchestratorError::not_found("batch", batch_id)),
        }
    }
}
