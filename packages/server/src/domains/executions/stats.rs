//! Live statistics for an execution.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::{BatchId, ExecutionId, JobId};
use crate::domains::executions::models::{Execution, ExecutionStatus};
use crate::domains::jobs::models::{Job, JobCounters};

/// Running jobs listed when the caller does not ask for a limit.
pub const DEFAULT_RUNNING_LIMIT: usize = 50;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningJob {
    pub job_id: JobId,
    pub row_index: i32,
    pub url: String,
    pub current_step: Option<String>,
    pub progress_percentage: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// No activity within the staleness window. Display only.
    pub stalled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub execution_id: ExecutionId,
    pub batch_id: BatchId,
    pub status: ExecutionStatus,
    pub concurrency: i32,
    pub total_jobs: i64,
    #[serde(flatten)]
    pub counters: JobCounters,
    pub progress_percentage: f64,
    pub elapsed_seconds: i64,
    /// Seconds, extrapolated from the average time per finished job.
    pub estimated_time_remaining: Option<i64>,
    pub running_jobs: Vec<RunningJob>,
}

pub fn compute_stats(
    execution: &Execution,
    running: &[Job],
    now: DateTime<Utc>,
    stall_threshold: chrono::Duration,
    running_limit: usize,
) -> ExecutionStats {
    let counters = execution.counters;
    let total = counters.total();
    let finished = counters.finished();

    let progress_percentage = if total > 0 {
        finished as f64 / total as f64 * 100.0
    } else if execution.status == ExecutionStatus::Completed {
        100.0
    } else {
        0.0
    };

    let ended_at = execution
        .completed_at
        .or(execution.stopped_at)
        .unwrap_or(now);
    let elapsed_seconds = (ended_at - execution.started_at).num_seconds().max(0);

    let remaining = counters.queued + counters.running;
    let estimated_time_remaining = if !execution.status.is_active() {
        None
    } else if remaining == 0 {
        Some(0)
    } else if finished == 0 {
        None
    } else {
        Some((elapsed_seconds as f64 / finished as f64 * remaining as f64).round() as i64)
    };

    let running_jobs = running
        .iter()
        .take(running_limit)
        .map(|job| RunningJob {
            job_id: job.id,
            row_index: job.row_index,
            url: job.url.clone(),
            current_step: job.current_step.clone(),
            progress_percentage: job.progress_percentage,
            started_at: job.started_at,
            last_activity_at: job.last_activity_at,
            stalled: job.is_stalled(now, stall_threshold),
        })
        .collect();

    ExecutionStats {
        execution_id: execution.id,
        batch_id: execution.batch_id,
        status: execution.status,
        concurrency: execution.concurrency,
        total_jobs: total,
        counters,
        progress_percentage,
        elapsed_seconds,
        estimated_time_remaining,
        running_jobs,
    }
}
