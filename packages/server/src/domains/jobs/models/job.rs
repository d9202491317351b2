//! Extraction job model - one row's task within a batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::common::{BatchId, ExecutionId, FieldMap, JobId};

// ============================================================================
// Enums
// ============================================================================

/// Job lifecycle status.
///
/// Only moves forward: queued → running → {completed | error}. A rerun puts
/// a finished job back to queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }
}

/// Pass/fail verdict against ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "evaluation_result", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EvaluationResult {
    Pass,
    Fail,
    #[default]
    Unset,
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = JobId::new())]
    pub id: JobId,
    pub batch_id: BatchId,
    /// The execution that most recently picked this job up.
    #[builder(default, setter(strip_option))]
    pub execution_id: Option<ExecutionId>,
    #[builder(default = 0)]
    pub row_index: i32,

    // What to do
    pub url: String,
    pub goal: String,

    // Live state
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub progress_percentage: i32,
    #[builder(default, setter(strip_option))]
    pub current_step: Option<String>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,

    // Retry tracking
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default, setter(strip_option))]
    pub retry_reason: Option<String>,

    // Inputs and results
    #[builder(default, setter(strip_option))]
    pub ground_truth: Option<FieldMap>,
    #[builder(default, setter(strip_option))]
    pub extracted_data: Option<FieldMap>,
    #[builder(default, setter(strip_option))]
    pub raw_log: Option<String>,

    // Failure annotation
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
    #[builder(default, setter(strip_option))]
    pub failure_category: Option<String>,

    // Scoring
    #[builder(default, setter(strip_option))]
    pub accuracy: Option<f64>,
    #[builder(default)]
    pub evaluation_result: EvaluationResult,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether this row has any expected values to score against.
    pub fn has_ground_truth(&self) -> bool {
        self.ground_truth
            .as_ref()
            .map(|gt| gt.values().any(|v| crate::common::field_text(v).is_some()))
            .unwrap_or(false)
    }

    /// Whether the job has been quiet longer than `threshold` while running.
    ///
    /// Display-only: stalled jobs are neither cancelled nor retried.
    pub fn is_stalled(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        match self.last_activity_at.or(self.started_at) {
            Some(last) => now - last > threshold,
            None => false,
        }
    }

    /// Put the job back to queued and clear everything a run produced.
    pub fn reset_for_rerun(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Queued;
        self.progress_percentage = 0;
        self.current_step = None;
        self.started_at = None;
        self.last_activity_at = None;
        self.completed_at = None;
        self.retry_count = 0;
        self.retry_reason = None;
        self.extracted_data = None;
        self.raw_log = None;
        self.error_message = None;
        self.failure_category = None;
        self.accuracy = None;
        self.evaluation_result = EvaluationResult::Unset;
        self.updated_at = now;
    }

    /// Write a terminal result onto the job.
    pub fn apply_completion(&mut self, completion: &JobCompletion) {
        self.status = completion.status;
        if completion.status == JobStatus::Completed {
            self.progress_percentage = 100;
        }
        self.extracted_data = completion.extracted_data.clone();
        self.raw_log = completion.raw_log.clone();
        self.error_message = completion.error_message.clone();
        self.failure_category = completion.failure_category.clone();
        self.accuracy = completion.accuracy;
        self.evaluation_result = completion.evaluation_result;
        self.retry_count = completion.retry_count;
        self.completed_at = Some(completion.completed_at);
        self.last_activity_at = Some(completion.completed_at);
        self.updated_at = completion.completed_at;
    }
}

// ============================================================================
// Write models
// ============================================================================

/// An advisory progress update for a running job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub current_step: String,
    pub progress_percentage: i32,
    pub at: DateTime<Utc>,
}

/// Terminal result written when a job leaves `running`.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub extracted_data: Option<FieldMap>,
    pub raw_log: Option<String>,
    pub error_message: Option<String>,
    pub failure_category: Option<String>,
    pub accuracy: Option<f64>,
    pub evaluation_result: EvaluationResult,
    pub retry_count: i32,
    pub completed_at: DateTime<Utc>,
}

impl JobCompletion {
    /// An `error` result with no extraction output.
    pub fn failed(
        message: impl Into<String>,
        failure_category: impl Into<String>,
        retry_count: i32,
    ) -> Self {
        Self {
            status: JobStatus::Error,
            extracted_data: None,
            raw_log: None,
            error_message: Some(message.into()),
            failure_category: Some(failure_category.into()),
            accuracy: None,
            evaluation_result: EvaluationResult::Unset,
            retry_count,
            completed_at: Utc::now(),
        }
    }
}

/// Field updates applied by a bulk patch. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    pub url: Option<String>,
    pub goal: Option<String>,
    pub ground_truth: Option<FieldMap>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.goal.is_none() && self.ground_truth.is_none()
    }

    pub fn apply(&self, job: &mut Job, now: DateTime<Utc>) {
        if let Some(url) = &self.url {
            job.url = url.clone();
        }
        if let Some(goal) = &self.goal {
            job.goal = goal.clone();
        }
        if let Some(ground_truth) = &self.ground_truth {
            job.ground_truth = Some(ground_truth.clone());
        }
        job.updated_at = now;
    }
}

/// Why a bulk operation refused one of its targets.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRejection {
    pub job_id: JobId,
    pub reason: String,
    /// `None` when the job does not exist.
    pub current_status: Option<JobStatus>,
}

impl BulkRejection {
    pub fn missing(job_id: JobId) -> Self {
        Self {
            job_id,
            reason: "job not found".to_string(),
            current_status: None,
        }
    }

    pub fn running(job: &Job) -> Self {
        Self {
            job_id: job.id,
            reason: "job is running".to_string(),
            current_status: Some(job.status),
        }
    }
}

/// Derived per-status counts for a set of jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounters {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub error: i64,
}

impl JobCounters {
    pub fn total(&self) -> i64 {
        self.queued + self.running + self.completed + self.error
    }

    /// Jobs that reached a terminal state.
    pub fn finished(&self) -> i64 {
        self.completed + self.error
    }

    pub fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Error => self.error += 1,
        }
    }

    /// Move one job from `from` to `to`.
    pub fn settle(&mut self, from: JobStatus, to: JobStatus) {
        let slot = match from {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Error => &mut self.error,
        };
        if *slot > 0 {
            *slot -= 1;
            self.add(to);
        }
    }

    pub fn from_statuses(statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        let mut counters = Self::default();
        for status in statuses {
            counters.add(status);
        }
        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job::builder()
            .batch_id(BatchId::new())
            .url("https://example.org")
            .goal("find the price")
            .build()
    }

    #[test]
    fn builder_defaults_to_queued() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress_percentage, 0);
        assert_eq!(job.evaluation_result, EvaluationResult::Unset);
    }

    #[test]
    fn reset_for_rerun_clears_run_output() {
        let mut job = sample_job();
        job.status = JobStatus::Completed;
        job.progress_percentage = 100;
        job.completed_at = Some(Utc::now());
        job.extracted_data = Some(FieldMap::from([("price".to_string(), json!("$20"))]));
        job.evaluation_result = EvaluationResult::Pass;

        job.reset_for_rerun(Utc::now());

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress_percentage, 0);
        assert!(job.completed_at.is_none());
        assert!(job.extracted_data.is_none());
        assert_eq!(job.evaluation_result, EvaluationResult::Unset);
    }

    #[test]
    fn stalled_only_when_running_and_quiet() {
        let now = Utc::now();
        let mut job = sample_job();
        job.last_activity_at = Some(now - chrono::Duration::seconds(120));
        assert!(!job.is_stalled(now, chrono::Duration::seconds(90)));

        job.status = JobStatus::Running;
        assert!(job.is_stalled(now, chrono::Duration::seconds(90)));

        job.last_activity_at = Some(now - chrono::Duration::seconds(10));
        assert!(!job.is_stalled(now, chrono::Duration::seconds(90)));
    }

    #[test]
    fn ground_truth_ignores_blank_values() {
        let mut job = sample_job();
        assert!(!job.has_ground_truth());

        job.ground_truth = Some(FieldMap::from([("price".to_string(), json!(""))]));
        assert!(!job.has_ground_truth());

        job.ground_truth = Some(FieldMap::from([("price".to_string(), json!("$20"))]));
        assert!(job.has_ground_truth());
    }

    #[test]
    fn counters_sum_to_total() {
        let counters = JobCounters::from_statuses([
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Completed,
            JobStatus::Error,
        ]);
        assert_eq!(counters.total(), 5);
        assert_eq!(counters.finished(), 3);
    }

    #[test]
    fn settle_moves_one_job_between_states() {
        let mut counters = JobCounters::from_statuses([JobStatus::Running, JobStatus::Queued]);
        counters.settle(JobStatus::Running, JobStatus::Completed);
        assert_eq!(counters.running, 0);
        assert_eq!(counters.completed, 1);
        assert_eq!(counters.total(), 2);

        // Nothing left to move
        counters.settle(JobStatus::Running, JobStatus::Error);
        assert_eq!(counters.error, 0);
        assert_eq!(counters.total(), 2);
    }
}
