//! Failure classification and batch-level failure patterns.

pub mod classifier;
pub mod patterns;

pub use classifier::{classify, Classification, FailureCategory};
pub use patterns::{analyze_failures, FailureExample, FailurePattern, FailureReport};

use crate::domains::jobs::models::{Job, JobStatus};

/// Error message recorded on jobs whose agent call was cancelled by a stop.
pub const CANCELLED_BY_STOP: &str = "cancelled by stop";

/// Error message recorded on jobs that were running when the process died.
pub const INTERRUPTED_BY_RESTART: &str = "interrupted by restart";

/// Whether the orchestrator, rather than the agent, ended this job.
///
/// Such jobs say nothing about extraction quality, so accuracy metrics and
/// failure patterns both leave them out.
pub fn ended_by_orchestrator(job: &Job) -> bool {
    job.status == JobStatus::Error
        && matches!(
            job.error_message.as_deref(),
            Some(CANCELLED_BY_STOP | INTERRUPTED_BY_RESTART)
        )
}
