//! Storage traits for batches, jobs, executions, events and snapshots.
//!
//! The storage layer is split into focused traits:
//! - `BatchStore`: uploaded batches and their schema
//! - `JobStore`: per-row jobs and their compare-and-swap transitions
//! - `ExecutionStore`: controlled runs and their lifecycle
//! - `EventStore`: the append-only event log
//! - `SnapshotStore`: accuracy snapshots
//! - `Store`: composite trait combining all of them
//!
//! Every state transition is a compare-and-swap: the write only lands if the
//! row is still in the expected status, and the caller learns whether it did.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::Result;
use crate::common::{BatchId, ExecutionId, JobId};
use crate::domains::accuracy::models::MetricsSnapshot;
use crate::domains::batches::models::Batch;
use crate::domains::events::models::{Event, EventQuery, NewEvent};
use crate::domains::executions::models::{Execution, ExecutionLaunch, ExecutionStatus};
use crate::domains::jobs::models::{Job, JobCompletion, JobCounters, JobPatch, JobProgress, JobStatus};

/// Outcome of a multi-job write that must apply to every target or none.
#[derive(Debug, Clone)]
pub enum BulkWrite<T> {
    Applied(T),
    /// Nothing was written; these targets are running.
    Blocked(Vec<Job>),
}

/// Which jobs to list.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub batch_id: Option<BatchId>,
    pub execution_id: Option<ExecutionId>,
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn batch(batch_id: BatchId) -> Self {
        Self {
            batch_id: Some(batch_id),
            ..Default::default()
        }
    }

    pub fn execution(execution_id: ExecutionId) -> Self {
        Self {
            execution_id: Some(execution_id),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.batch_id.map_or(true, |id| job.batch_id == id)
            && self
                .execution_id
                .map_or(true, |id| job.execution_id == Some(id))
            && self.status.map_or(true, |s| job.status == s)
    }
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Insert a batch together with its queued jobs.
    async fn insert_batch(&self, batch: &Batch, jobs: &[Job]) -> Result<()>;

    async fn find_batch(&self, id: BatchId) -> Result<Option<Batch>>;

    /// Refresh the accuracy fields, the only mutable part of a batch.
    async fn update_batch_accuracy(
        &self,
        id: BatchId,
        accuracy: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Cheap round trip used by the health check.
    async fn ping(&self) -> Result<()>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Load every job that exists among `ids`, in row order.
    async fn find_jobs(&self, ids: &[JobId]) -> Result<Vec<Job>>;

    /// Jobs matching `filter`, ordered by row index.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Move the lowest-row queued job of a running execution to `running`.
    ///
    /// Returns `None` when nothing is queued or the execution is not running.
    async fn claim_next_job(&self, execution_id: ExecutionId) -> Result<Option<Job>>;

    /// Persist a progress update. Returns `false` if the job is no longer running.
    async fn update_job_progress(&self, id: JobId, progress: &JobProgress) -> Result<bool>;

    /// Record a retry attempt. The reason is only kept from the first retry.
    async fn record_job_retry(&self, id: JobId, retry_count: i32, reason: &str) -> Result<bool>;

    /// CAS `running → completed|error`. Returns the updated job if it landed.
    async fn finish_job(&self, id: JobId, completion: &JobCompletion) -> Result<Option<Job>>;

    /// Reset the jobs to queued, attaching each to its batch's active
    /// execution or detaching it when the batch has none.
    async fn requeue_jobs(&self, ids: &[JobId]) -> Result<BulkWrite<Vec<Job>>>;

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<BulkWrite<u64>>;

    async fn update_jobs(&self, ids: &[JobId], patch: &JobPatch) -> Result<BulkWrite<Vec<Job>>>;

    /// Apply `completion` to every job of an execution that is still running.
    async fn fail_interrupted_jobs(
        &self,
        execution_id: ExecutionId,
        completion: &JobCompletion,
    ) -> Result<Vec<Job>>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create an execution and select its jobs in one atomic step.
    ///
    /// Fails with `ActiveExecution` if the batch already has a running or
    /// paused execution, and with `BatchNotFound` for an unknown batch.
    async fn launch_execution(&self, launch: &ExecutionLaunch) -> Result<Execution>;

    /// Load an execution with freshly derived counters.
    async fn find_execution(&self, id: ExecutionId) -> Result<Option<Execution>>;

    async fn find_active_execution(&self, batch_id: BatchId) -> Result<Option<Execution>>;

    /// Newest first.
    async fn list_executions(&self, batch_id: Option<BatchId>) -> Result<Vec<Execution>>;

    async fn list_active_executions(&self) -> Result<Vec<Execution>>;

    /// CAS the status from any of `from` to `to`, stamping the matching timestamp.
    ///
    /// Moving to `stopped` or `completed` freezes the execution's counters:
    /// later launches and reruns that take its jobs leave them untouched, and
    /// only an in-flight job finishing after a stop still settles into them.
    /// Returns `None` if the execution was not in one of the `from` states.
    async fn transition_execution(
        &self,
        id: ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        reason: Option<&str>,
    ) -> Result<Option<Execution>>;

    /// CAS `running → completed` in the same atomic step that checks no
    /// tracked job is queued or running.
    ///
    /// Returns `None` if the execution is not running or still has work, for
    /// instance a rerun that attached a job after the caller last looked.
    async fn complete_execution(&self, id: ExecutionId) -> Result<Option<Execution>>;

    /// Change the limit of an active execution. `None` if it is terminal.
    async fn set_execution_concurrency(
        &self,
        id: ExecutionId,
        concurrency: i32,
    ) -> Result<Option<Execution>>;

    /// Bump `last_activity_at`.
    async fn touch_execution(&self, id: ExecutionId) -> Result<()>;

    /// Per-status counts over the jobs this execution tracks.
    async fn execution_counters(&self, id: ExecutionId) -> Result<JobCounters>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append to the log, assigning id, sequence and timestamp.
    async fn append_event(&self, event: &NewEvent) -> Result<Event>;

    /// Matching events in log order, up to `page.fetch_limit()` after `page.offset`,
    /// plus the total number of matches ignoring pagination.
    async fn query_events(&self, query: &EventQuery) -> Result<(Vec<Event>, i64)>;

    /// Retention cleanup. Returns how many events were removed.
    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn insert_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()>;

    /// Newest first.
    async fn list_snapshots(&self, batch_id: BatchId, limit: usize)
        -> Result<Vec<MetricsSnapshot>>;
}

/// Composite storage trait used by the orchestrator.
pub trait Store: BatchStore + JobStore + ExecutionStore + EventStore + SnapshotStore {}

// Blanket implementation: anything implementing all five traits is a Store
impl<T> Store for T where T: BatchStore + JobStore + ExecutionStore + EventStore + SnapshotStore {}
