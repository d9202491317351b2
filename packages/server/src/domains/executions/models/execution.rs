//! Execution model - one controlled run over a batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{BatchId, ExecutionId};
use crate::domains::jobs::models::JobCounters;

/// Lower bound for an execution's concurrency limit.
pub const MIN_CONCURRENCY: i32 = 1;

/// Upper bound for an execution's concurrency limit.
pub const MAX_CONCURRENCY: i32 = 20;

/// Which jobs a launch selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// Every job in the batch, reset to queued.
    Full,
    /// The first `sample_size` rows by row index, reset to queued.
    Sample,
    /// Only jobs that are currently queued.
    Pending,
}

/// Execution lifecycle status.
///
/// `running ⇄ paused → {stopped | completed}`. Stopped and completed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Stopped,
    Completed,
}

impl ExecutionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Stopped => "stopped",
            ExecutionStatus::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: ExecutionId,
    pub batch_id: BatchId,
    pub execution_type: ExecutionType,
    pub status: ExecutionStatus,
    pub concurrency: i32,
    pub sample_size: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    /// Size of the tracked job subset.
    pub total_jobs: i64,
    /// Derived from the job table each time the execution is read.
    #[serde(flatten)]
    pub counters: JobCounters,
}

impl Execution {
    pub fn new(launch: &ExecutionLaunch) -> Self {
        let now = Utc::now();
        Self {
            id: ExecutionId::new(),
            batch_id: launch.batch_id,
            execution_type: launch.execution_type,
            status: ExecutionStatus::Running,
            concurrency: launch.concurrency,
            sample_size: launch.sample_size,
            started_at: now,
            paused_at: None,
            resumed_at: None,
            stopped_at: None,
            stop_reason: None,
            completed_at: None,
            last_activity_at: now,
            total_jobs: 0,
            counters: JobCounters::default(),
        }
    }

    /// Attach freshly derived counters.
    pub fn with_counters(mut self, counters: JobCounters) -> Self {
        self.total_jobs = counters.total();
        self.counters = counters;
        self
    }

    /// Apply a status change and stamp the matching timestamp.
    pub fn apply_transition(
        &mut self,
        to: ExecutionStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) {
        match to {
            ExecutionStatus::Paused => self.paused_at = Some(now),
            ExecutionStatus::Running => self.resumed_at = Some(now),
            ExecutionStatus::Stopped => {
                self.stopped_at = Some(now);
                self.stop_reason = reason.map(str::to_string);
            }
            ExecutionStatus::Completed => self.completed_at = Some(now),
        }
        self.status = to;
        self.last_activity_at = now;
    }
}

/// Validated launch request.
#[derive(Debug, Clone)]
pub struct ExecutionLaunch {
    pub batch_id: BatchId,
    pub execution_type: ExecutionType,
    pub concurrency: i32,
    pub sample_size: Option<i32>,
}

pub fn concurrency_in_range(concurrency: i32) -> bool {
    (MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency)
}
