//! PostgreSQL storage implementation.
//!
//! Job claims use `FOR UPDATE SKIP LOCKED` so concurrent dispatchers never hand
//! out the same row twice; every other transition is an `UPDATE ... WHERE status`
//! compare-and-swap. Counters of active executions are derived from
//! `extraction_jobs` on every read; stopped and completed executions carry the
//! counters frozen at their terminal transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder};
use tracing::{debug, info, instrument};

use super::error::{Result, StoreError};
use super::traits::{
    BatchStore, BulkWrite, EventStore, ExecutionStore, JobFilter, JobStore, SnapshotStore,
};
use crate::common::{BatchId, EventId, ExecutionId, FieldMap, JobId, SnapshotId};
use crate::domains::accuracy::models::{ColumnMetric, MetricsSnapshot, SnapshotTrigger};
use crate::domains::batches::models::{Batch, ColumnDef};
use crate::domains::events::models::{Event, EventQuery, EventType, NewEvent};
use crate::domains::executions::models::{
    Execution, ExecutionLaunch, ExecutionStatus, ExecutionType,
};
use crate::domains::jobs::models::{
    EvaluationResult, Job, JobCompletion, JobCounters, JobPatch, JobProgress, JobStatus,
};

/// Columns cleared when a job goes back to `queued`.
const RESET_JOB_COLUMNS: &str = "status = 'queued', progress_percentage = 0, current_step = NULL, \
     started_at = NULL, last_activity_at = NULL, completed_at = NULL, retry_count = 0, \
     retry_reason = NULL, extracted_data = NULL, raw_log = NULL, error_message = NULL, \
     failure_category = NULL, accuracy = NULL, evaluation_result = 'unset', updated_at = NOW()";

/// Executions joined with their per-status counts, frozen or derived.
const EXECUTION_SELECT: &str = "SELECT e.*, \
     COALESCE(e.final_queued, COUNT(j.id) FILTER (WHERE j.status = 'queued')) AS queued, \
     COALESCE(e.final_running, COUNT(j.id) FILTER (WHERE j.status = 'running')) AS running, \
     COALESCE(e.final_completed, COUNT(j.id) FILTER (WHERE j.status = 'completed')) AS completed, \
     COALESCE(e.final_error, COUNT(j.id) FILTER (WHERE j.status = 'error')) AS error \
     FROM executions e LEFT JOIN extraction_jobs j ON j.execution_id = e.id";

/// Capture the live counters of execution `$1` onto its row.
const FREEZE_COUNTERS: &str = "\
     final_queued = (SELECT COUNT(*) FROM extraction_jobs WHERE execution_id = $1 AND status = 'queued'), \
     final_running = (SELECT COUNT(*) FROM extraction_jobs WHERE execution_id = $1 AND status = 'running'), \
     final_completed = (SELECT COUNT(*) FROM extraction_jobs WHERE execution_id = $1 AND status = 'completed'), \
     final_error = (SELECT COUNT(*) FROM extraction_jobs WHERE execution_id = $1 AND status = 'error')";

// ============================================================================
// Row types
// ============================================================================

#[derive(FromRow)]
struct BatchRow {
    id: BatchId,
    name: String,
    total_rows: i32,
    columns: Json<Vec<ColumnDef>>,
    last_accuracy: Option<f64>,
    accuracy_updated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<BatchRow> for Batch {
    fn from(row: BatchRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            total_rows: row.total_rows,
            columns: row.columns.0,
            last_accuracy: row.last_accuracy,
            accuracy_updated_at: row.accuracy_updated_at,
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct JobRow {
    id: JobId,
    batch_id: BatchId,
    execution_id: Option<ExecutionId>,
    row_index: i32,
    url: String,
    goal: String,
    status: JobStatus,
    progress_percentage: i32,
    current_step: Option<String>,
    started_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    retry_reason: Option<String>,
    ground_truth: Option<Json<FieldMap>>,
    extracted_data: Option<Json<FieldMap>>,
    raw_log: Option<String>,
    error_message: Option<String>,
    failure_category: Option<String>,
    accuracy: Option<f64>,
    evaluation_result: EvaluationResult,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Self {
            id: row.id,
            batch_id: row.batch_id,
            execution_id: row.execution_id,
            row_index: row.row_index,
            url: row.url,
            goal: row.goal,
            status: row.status,
            progress_percentage: row.progress_percentage,
            current_step: row.current_step,
            started_at: row.started_at,
            last_activity_at: row.last_activity_at,
            completed_at: row.completed_at,
            retry_count: row.retry_count,
            retry_reason: row.retry_reason,
            ground_truth: row.ground_truth.map(|j| j.0),
            extracted_data: row.extracted_data.map(|j| j.0),
            raw_log: row.raw_log,
            error_message: row.error_message,
            failure_category: row.failure_category,
            accuracy: row.accuracy,
            evaluation_result: row.evaluation_result,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct ExecutionRow {
    id: ExecutionId,
    batch_id: BatchId,
    execution_type: ExecutionType,
    status: ExecutionStatus,
    concurrency: i32,
    sample_size: Option<i32>,
    started_at: DateTime<Utc>,
    paused_at: Option<DateTime<Utc>>,
    resumed_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    stop_reason: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    last_activity_at: DateTime<Utc>,
    queued: i64,
    running: i64,
    completed: i64,
    error: i64,
}

impl From<ExecutionRow> for Execution {
    fn from(row: ExecutionRow) -> Self {
        let counters = JobCounters {
            queued: row.queued,
            running: row.running,
            completed: row.completed,
            error: row.error,
        };
        Self {
            id: row.id,
            batch_id: row.batch_id,
            execution_type: row.execution_type,
            status: row.status,
            concurrency: row.concurrency,
            sample_size: row.sample_size,
            started_at: row.started_at,
            paused_at: row.paused_at,
            resumed_at: row.resumed_at,
            stopped_at: row.stopped_at,
            stop_reason: row.stop_reason,
            completed_at: row.completed_at,
            last_activity_at: row.last_activity_at,
            total_jobs: counters.total(),
            counters,
        }
    }
}

#[derive(FromRow)]
struct EventRow {
    sequence: i64,
    id: EventId,
    event_type: String,
    execution_id: Option<ExecutionId>,
    batch_id: BatchId,
    job_id: Option<JobId>,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self> {
        let event_type: EventType = row
            .event_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("event {}: {e}", row.sequence)))?;
        Ok(Self {
            id: row.id,
            sequence: row.sequence,
            event_type,
            execution_id: row.execution_id,
            batch_id: row.batch_id,
            job_id: row.job_id,
            timestamp: row.created_at,
            payload: row.payload,
        })
    }
}

#[derive(FromRow)]
struct SnapshotRow {
    id: SnapshotId,
    batch_id: BatchId,
    execution_id: Option<ExecutionId>,
    trigger: SnapshotTrigger,
    column_metrics: Json<Vec<ColumnMetric>>,
    overall_accuracy: Option<f64>,
    jobs_scored: i64,
    created_at: DateTime<Utc>,
}

impl From<SnapshotRow> for MetricsSnapshot {
    fn from(row: SnapshotRow) -> Self {
        Self {
            id: row.id,
            batch_id: row.batch_id,
            execution_id: row.execution_id,
            trigger: row.trigger,
            column_metrics: row.column_metrics.0,
            overall_accuracy: row.overall_accuracy,
            jobs_scored: row.jobs_scored,
            created_at: row.created_at,
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply pending migrations from `migrations/`.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_execution<'e, E>(executor: E, id: ExecutionId) -> Result<Option<Execution>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let sql = format!("{EXECUTION_SELECT} WHERE e.id = $1 GROUP BY e.id");
        let row: Option<ExecutionRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await?;
        Ok(row.map(Execution::from))
    }

    async fn fetch_active_execution<'e, E>(
        executor: E,
        batch_id: BatchId,
    ) -> Result<Option<Execution>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "{EXECUTION_SELECT} WHERE e.batch_id = $1 AND e.status IN ('running', 'paused') \
             GROUP BY e.id"
        );
        let row: Option<ExecutionRow> = sqlx::query_as(&sql)
            .bind(batch_id)
            .fetch_optional(executor)
            .await?;
        Ok(row.map(Execution::from))
    }

    /// Lock the target rows and report the running ones.
    async fn lock_for_bulk(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        ids: &[JobId],
    ) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM extraction_jobs WHERE id = ANY($1) ORDER BY row_index FOR UPDATE",
        )
        .bind(ids.to_vec())
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(Job::from)
            .filter(|j| j.status == JobStatus::Running)
            .collect())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl BatchStore for PostgresStore {
    #[instrument(skip_all, fields(batch_id = %batch.id, jobs = jobs.len()))]
    async fn insert_batch(&self, batch: &Batch, jobs: &[Job]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO batches (id, name, total_rows, columns, created_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(batch.id)
        .bind(&batch.name)
        .bind(batch.total_rows)
        .bind(Json(&batch.columns))
        .bind(batch.created_at)
        .execute(&mut *tx)
        .await?;

        for job in jobs {
            sqlx::query(
                "INSERT INTO extraction_jobs \
                 (id, batch_id, row_index, url, goal, status, ground_truth, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(job.id)
            .bind(job.batch_id)
            .bind(job.row_index)
            .bind(&job.url)
            .bind(&job.goal)
            .bind(job.status)
            .bind(job.ground_truth.as_ref().map(Json))
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Batch inserted");
        Ok(())
    }

    async fn find_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        let row: Option<BatchRow> = sqlx::query_as("SELECT * FROM batches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Batch::from))
    }

    async fn update_batch_accuracy(
        &self,
        id: BatchId,
        accuracy: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE batches SET last_accuracy = $2, accuracy_updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(accuracy)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::BatchNotFound(id));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn find_job(&self, id: JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM extraction_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Job::from))
    }

    async fn find_jobs(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT * FROM extraction_jobs WHERE id = ANY($1) ORDER BY batch_id, row_index",
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT * FROM extraction_jobs WHERE TRUE");
        if let Some(batch_id) = filter.batch_id {
            qb.push(" AND batch_id = ").push_bind(batch_id);
        }
        if let Some(execution_id) = filter.execution_id {
            qb.push(" AND execution_id = ").push_bind(execution_id);
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status);
        }
        qb.push(" ORDER BY batch_id, row_index");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    #[instrument(skip_all, fields(execution_id = %execution_id))]
    async fn claim_next_job(&self, execution_id: ExecutionId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE extraction_jobs j \
             SET status = 'running', progress_percentage = 0, current_step = NULL, \
                 started_at = NOW(), last_activity_at = NOW(), updated_at = NOW() \
             WHERE j.id = ( \
                 SELECT c.id FROM extraction_jobs c \
                 JOIN executions e ON e.id = c.execution_id \
                 WHERE c.execution_id = $1 AND c.status = 'queued' AND e.status = 'running' \
                 ORDER BY c.row_index \
                 LIMIT 1 \
                 FOR UPDATE OF c SKIP LOCKED \
             ) AND j.status = 'queued' \
             RETURNING j.*",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_some() {
            self.touch_execution(execution_id).await?;
        }
        Ok(row.map(Job::from))
    }

    async fn update_job_progress(&self, id: JobId, progress: &JobProgress) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE extraction_jobs \
             SET current_step = $2, progress_percentage = $3, last_activity_at = $4, updated_at = $4 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(&progress.current_step)
        .bind(progress.progress_percentage.clamp(0, 100))
        .bind(progress.at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_job_retry(&self, id: JobId, retry_count: i32, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE extraction_jobs \
             SET retry_count = $2, retry_reason = COALESCE(retry_reason, $3), \
                 last_activity_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(retry_count)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, fields(job_id = %id, status = completion.status.as_str()))]
    async fn finish_job(&self, id: JobId, completion: &JobCompletion) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        // Serializes against the execution freezing its counters
        sqlx::query(
            "SELECT e.id FROM executions e JOIN extraction_jobs j ON j.execution_id = e.id \
             WHERE j.id = $1 FOR SHARE OF e",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE extraction_jobs \
             SET status = $2, \
                 progress_percentage = CASE WHEN $2 = 'completed'::job_status THEN 100 \
                                            ELSE progress_percentage END, \
                 extracted_data = $3, raw_log = $4, error_message = $5, failure_category = $6, \
                 accuracy = $7, evaluation_result = $8, retry_count = $9, \
                 completed_at = $10, last_activity_at = $10, updated_at = $10 \
             WHERE id = $1 AND status = 'running' \
             RETURNING *",
        )
        .bind(id)
        .bind(completion.status)
        .bind(completion.extracted_data.as_ref().map(Json))
        .bind(&completion.raw_log)
        .bind(&completion.error_message)
        .bind(&completion.failure_category)
        .bind(completion.accuracy)
        .bind(completion.evaluation_result)
        .bind(completion.retry_count)
        .bind(completion.completed_at)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(job) = row.map(Job::from) else {
            tx.rollback().await?;
            return Ok(None);
        };

        // In-flight job finishing after a stop
        if let Some(execution_id) = job.execution_id {
            sqlx::query(
                "UPDATE executions \
                 SET final_running = final_running - 1, \
                     final_completed = final_completed \
                         + CASE WHEN $2 = 'completed'::job_status THEN 1 ELSE 0 END, \
                     final_error = final_error \
                         + CASE WHEN $2 = 'error'::job_status THEN 1 ELSE 0 END \
                 WHERE id = $1 AND final_running > 0",
            )
            .bind(execution_id)
            .bind(job.status)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(job))
    }

    async fn requeue_jobs(&self, ids: &[JobId]) -> Result<BulkWrite<Vec<Job>>> {
        let mut tx = self.pool.begin().await?;
        let blocked = Self::lock_for_bulk(&mut tx, ids).await?;
        if !blocked.is_empty() {
            tx.rollback().await?;
            return Ok(BulkWrite::Blocked(blocked));
        }

        // Keeps each batch's active execution from completing under the rerun
        sqlx::query(
            "SELECT e.id FROM executions e \
             WHERE e.status IN ('running', 'paused') AND e.batch_id IN ( \
                 SELECT batch_id FROM extraction_jobs WHERE id = ANY($1) \
             ) \
             FOR SHARE OF e",
        )
        .bind(ids.to_vec())
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            "UPDATE extraction_jobs j SET {RESET_JOB_COLUMNS}, execution_id = ( \
                 SELECT e.id FROM executions e \
                 WHERE e.batch_id = j.batch_id AND e.status IN ('running', 'paused') \
             ) \
             WHERE j.id = ANY($1) RETURNING j.*"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(ids.to_vec())
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut jobs: Vec<Job> = rows.into_iter().map(Job::from).collect();
        jobs.sort_by_key(|j| j.row_index);
        Ok(BulkWrite::Applied(jobs))
    }

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<BulkWrite<u64>> {
        let mut tx = self.pool.begin().await?;
        let blocked = Self::lock_for_bulk(&mut tx, ids).await?;
        if !blocked.is_empty() {
            tx.rollback().await?;
            return Ok(BulkWrite::Blocked(blocked));
        }

        let result = sqlx::query("DELETE FROM extraction_jobs WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(BulkWrite::Applied(result.rows_affected()))
    }

    async fn update_jobs(&self, ids: &[JobId], patch: &JobPatch) -> Result<BulkWrite<Vec<Job>>> {
        let mut tx = self.pool.begin().await?;
        let blocked = Self::lock_for_bulk(&mut tx, ids).await?;
        if !blocked.is_empty() {
            tx.rollback().await?;
            return Ok(BulkWrite::Blocked(blocked));
        }

        let rows: Vec<JobRow> = sqlx::query_as(
            "UPDATE extraction_jobs \
             SET url = COALESCE($2, url), goal = COALESCE($3, goal), \
                 ground_truth = COALESCE($4, ground_truth), updated_at = NOW() \
             WHERE id = ANY($1) RETURNING *",
        )
        .bind(ids.to_vec())
        .bind(&patch.url)
        .bind(&patch.goal)
        .bind(patch.ground_truth.as_ref().map(Json))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut jobs: Vec<Job> = rows.into_iter().map(Job::from).collect();
        jobs.sort_by_key(|j| j.row_index);
        Ok(BulkWrite::Applied(jobs))
    }

    async fn fail_interrupted_jobs(
        &self,
        execution_id: ExecutionId,
        completion: &JobCompletion,
    ) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "UPDATE extraction_jobs \
             SET status = $2, extracted_data = $3, raw_log = $4, error_message = $5, \
                 failure_category = $6, accuracy = $7, evaluation_result = $8, \
                 completed_at = $9, last_activity_at = $9, updated_at = $9 \
             WHERE execution_id = $1 AND status = 'running' \
             RETURNING *",
        )
        .bind(execution_id)
        .bind(completion.status)
        .bind(completion.extracted_data.as_ref().map(Json))
        .bind(&completion.raw_log)
        .bind(&completion.error_message)
        .bind(&completion.failure_category)
        .bind(completion.accuracy)
        .bind(completion.evaluation_result)
        .bind(completion.completed_at)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs: Vec<Job> = rows.into_iter().map(Job::from).collect();
        jobs.sort_by_key(|j| j.row_index);
        Ok(jobs)
    }
}

#[async_trait]
impl ExecutionStore for PostgresStore {
    #[instrument(skip_all, fields(batch_id = %launch.batch_id))]
    async fn launch_execution(&self, launch: &ExecutionLaunch) -> Result<Execution> {
        let mut tx = self.pool.begin().await?;

        // Serializes launches for the same batch
        let exists: Option<(BatchId,)> =
            sqlx::query_as("SELECT id FROM batches WHERE id = $1 FOR UPDATE")
                .bind(launch.batch_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(StoreError::BatchNotFound(launch.batch_id));
        }

        if let Some(active) = Self::fetch_active_execution(&mut *tx, launch.batch_id).await? {
            return Err(StoreError::ActiveExecution(Box::new(active)));
        }

        let execution = Execution::new(launch);
        let inserted = sqlx::query(
            "INSERT INTO executions \
             (id, batch_id, execution_type, status, concurrency, sample_size, started_at, last_activity_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $7)",
        )
        .bind(execution.id)
        .bind(execution.batch_id)
        .bind(execution.execution_type)
        .bind(execution.status)
        .bind(execution.concurrency)
        .bind(execution.sample_size)
        .bind(execution.started_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                drop(tx);
                if let Some(active) =
                    Self::fetch_active_execution(&self.pool, launch.batch_id).await?
                {
                    return Err(StoreError::ActiveExecution(Box::new(active)));
                }
            }
            return Err(err.into());
        }

        match launch.execution_type {
            ExecutionType::Full => {
                let sql = format!(
                    "UPDATE extraction_jobs SET {RESET_JOB_COLUMNS}, execution_id = $2 \
                     WHERE batch_id = $1 AND status <> 'running'"
                );
                sqlx::query(&sql)
                    .bind(launch.batch_id)
                    .bind(execution.id)
                    .execute(&mut *tx)
                    .await?;
            }
            ExecutionType::Sample => {
                let sql = format!(
                    "UPDATE extraction_jobs SET {RESET_JOB_COLUMNS}, execution_id = $2 \
                     WHERE id IN ( \
                         SELECT id FROM extraction_jobs WHERE batch_id = $1 \
                         ORDER BY row_index LIMIT $3 \
                     ) AND status <> 'running'"
                );
                sqlx::query(&sql)
                    .bind(launch.batch_id)
                    .bind(execution.id)
                    .bind(i64::from(launch.sample_size.unwrap_or(0).max(0)))
                    .execute(&mut *tx)
                    .await?;
            }
            ExecutionType::Pending => {
                sqlx::query(
                    "UPDATE extraction_jobs SET execution_id = $2, updated_at = NOW() \
                     WHERE batch_id = $1 AND status = 'queued'",
                )
                .bind(launch.batch_id)
                .bind(execution.id)
                .execute(&mut *tx)
                .await?;
            }
        }

        let launched = Self::fetch_execution(&mut *tx, execution.id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("execution {} vanished", execution.id)))?;
        tx.commit().await?;

        info!(execution_id = %launched.id, total_jobs = launched.total_jobs, "Execution launched");
        Ok(launched)
    }

    async fn find_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        Self::fetch_execution(&self.pool, id).await
    }

    async fn find_active_execution(&self, batch_id: BatchId) -> Result<Option<Execution>> {
        Self::fetch_active_execution(&self.pool, batch_id).await
    }

    async fn list_executions(&self, batch_id: Option<BatchId>) -> Result<Vec<Execution>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(EXECUTION_SELECT);
        if let Some(batch_id) = batch_id {
            qb.push(" WHERE e.batch_id = ").push_bind(batch_id);
        }
        qb.push(" GROUP BY e.id ORDER BY e.started_at DESC, e.id DESC");

        let rows: Vec<ExecutionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Execution::from).collect())
    }

    async fn list_active_executions(&self) -> Result<Vec<Execution>> {
        let sql = format!(
            "{EXECUTION_SELECT} WHERE e.status IN ('running', 'paused') \
             GROUP BY e.id ORDER BY e.started_at"
        );
        let rows: Vec<ExecutionRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Execution::from).collect())
    }

    #[instrument(skip_all, fields(execution_id = %id, to = to.as_str()))]
    async fn transition_execution(
        &self,
        id: ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        reason: Option<&str>,
    ) -> Result<Option<Execution>> {
        let stamp = match to {
            ExecutionStatus::Paused => "paused_at",
            ExecutionStatus::Running => "resumed_at",
            ExecutionStatus::Stopped => "stopped_at",
            ExecutionStatus::Completed => "completed_at",
        };
        let mut tx = self.pool.begin().await?;

        let current: Option<(ExecutionStatus,)> =
            sqlx::query_as("SELECT status FROM executions WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        match current {
            Some((status,)) if from.contains(&status) => {}
            _ => {
                tx.rollback().await?;
                return Ok(None);
            }
        }

        let freeze = if to.is_terminal() {
            format!(", {FREEZE_COUNTERS}")
        } else {
            String::new()
        };
        let sql = format!(
            "UPDATE executions \
             SET status = $2, {stamp} = NOW(), stop_reason = COALESCE($3, stop_reason), \
                 last_activity_at = NOW(){freeze} \
             WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(to)
            .bind(reason)
            .execute(&mut *tx)
            .await?;

        let updated = Self::fetch_execution(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(updated)
    }

    #[instrument(skip_all, fields(execution_id = %id))]
    async fn complete_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let mut tx = self.pool.begin().await?;

        // Waits out a rerun holding the row; the update below then sees its jobs
        let locked: Option<(ExecutionId,)> = sqlx::query_as(
            "SELECT id FROM executions WHERE id = $1 AND status = 'running' FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let sql = format!(
            "UPDATE executions \
             SET status = 'completed', completed_at = NOW(), last_activity_at = NOW(), \
                 {FREEZE_COUNTERS} \
             WHERE id = $1 AND status = 'running' AND NOT EXISTS ( \
                 SELECT 1 FROM extraction_jobs \
                 WHERE execution_id = $1 AND status IN ('queued', 'running') \
             ) \
             RETURNING id"
        );
        let updated: Option<(ExecutionId,)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if updated.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let completed = Self::fetch_execution(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(completed)
    }

    async fn set_execution_concurrency(
        &self,
        id: ExecutionId,
        concurrency: i32,
    ) -> Result<Option<Execution>> {
        let updated: Option<(ExecutionId,)> = sqlx::query_as(
            "UPDATE executions SET concurrency = $2, last_activity_at = NOW() \
             WHERE id = $1 AND status IN ('running', 'paused') \
             RETURNING id",
        )
        .bind(id)
        .bind(concurrency)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(_) => self.find_execution(id).await,
            None => Ok(None),
        }
    }

    async fn touch_execution(&self, id: ExecutionId) -> Result<()> {
        sqlx::query("UPDATE executions SET last_activity_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn execution_counters(&self, id: ExecutionId) -> Result<JobCounters> {
        let rows: Vec<(JobStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM extraction_jobs WHERE execution_id = $1 GROUP BY status",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut counters = JobCounters::default();
        for (status, count) in rows {
            match status {
                JobStatus::Queued => counters.queued = count,
                JobStatus::Running => counters.running = count,
                JobStatus::Completed => counters.completed = count,
                JobStatus::Error => counters.error = count,
            }
        }
        Ok(counters)
    }
}

fn push_event_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &EventQuery) {
    if let Some(execution_id) = query.filter.execution_id {
        qb.push(" AND execution_id = ").push_bind(execution_id);
    }
    if let Some(batch_id) = query.filter.batch_id {
        qb.push(" AND batch_id = ").push_bind(batch_id);
    }
    if let Some(job_id) = query.filter.job_id {
        qb.push(" AND job_id = ").push_bind(job_id);
    }
    if let Some(event_type) = query.event_type {
        qb.push(" AND event_type = ").push_bind(event_type.as_str());
    }
    if let Some(since) = query.since {
        qb.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(until) = query.until {
        qb.push(" AND created_at <= ").push_bind(until);
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn append_event(&self, event: &NewEvent) -> Result<Event> {
        let row: EventRow = sqlx::query_as(
            "INSERT INTO events (id, event_type, execution_id, batch_id, job_id, payload) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING *",
        )
        .bind(EventId::new())
        .bind(event.event_type.as_str())
        .bind(event.execution_id)
        .bind(event.batch_id)
        .bind(event.job_id)
        .bind(&event.payload)
        .fetch_one(&self.pool)
        .await?;
        Event::try_from(row)
    }

    async fn query_events(&self, query: &EventQuery) -> Result<(Vec<Event>, i64)> {
        let mut count: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM events WHERE TRUE");
        push_event_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM events WHERE TRUE");
        push_event_filters(&mut qb, query);
        if let Some(after) = query.page.after {
            qb.push(" AND sequence > ").push_bind(after);
        }
        qb.push(" ORDER BY sequence ASC LIMIT ")
            .push_bind(query.page.fetch_limit() as i64)
            .push(" OFFSET ")
            .push_bind(query.page.offset as i64);

        let rows: Vec<EventRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let events = rows
            .into_iter()
            .map(Event::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((events, total))
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SnapshotStore for PostgresStore {
    async fn insert_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        sqlx::query(
            "INSERT INTO metrics_snapshots \
             (id, batch_id, execution_id, trigger, column_metrics, overall_accuracy, jobs_scored, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(snapshot.id)
        .bind(snapshot.batch_id)
        .bind(snapshot.execution_id)
        .bind(snapshot.trigger)
        .bind(Json(&snapshot.column_metrics))
        .bind(snapshot.overall_accuracy)
        .bind(snapshot.jobs_scored)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        batch_id: BatchId,
        limit: usize,
    ) -> Result<Vec<MetricsSnapshot>> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT * FROM metrics_snapshots WHERE batch_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(batch_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(MetricsSnapshot::from).collect())
    }
}
