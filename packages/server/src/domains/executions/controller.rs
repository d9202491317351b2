//! Per-execution dispatcher.
//!
//! One dispatcher task runs per active execution. It is the only writer of
//! the `queued → running` claim and of the automatic `completed` transition.
//! Job tasks record their own terminal state with a `running → done` CAS.
//!
//! ```text
//! Dispatcher
//!     │
//!     ├─► claim_next_job (while in flight < concurrency)
//!     │       └─► spawn job task ─► JobRunner ─► finish_job (CAS) ─► job.completed / job.failed
//!     ├─► nothing queued, nothing in flight ─► running → completed (CAS) ─► snapshot
//!     └─► wait for: control change | job finished | wake-up | poll tick
//! ```

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::common::{BatchId, ExecutionId};
use crate::domains::accuracy::models::SnapshotTrigger;
use crate::domains::accuracy::score_job;
use crate::domains::batches::models::ColumnDef;
use crate::domains::events::models::{EventType, NewEvent};
use crate::domains::failures::{FailureCategory, CANCELLED_BY_STOP};
use crate::domains::jobs::models::{EvaluationResult, Job, JobCompletion, JobStatus};
use crate::domains::jobs::{JobOutcome, JobRunner};
use crate::kernel::ServerDeps;

// ============================================================================
// Control channel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchSignal {
    Run,
    Pause,
    Stop,
}

/// What the dispatcher should currently be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchControl {
    pub signal: DispatchSignal,
    pub concurrency: usize,
}

impl DispatchControl {
    pub fn new(signal: DispatchSignal, concurrency: i32) -> Self {
        Self {
            signal,
            concurrency: concurrency.max(1) as usize,
        }
    }
}

// ============================================================================
// Completion building
// ============================================================================

/// Turn a runner outcome into the terminal row update.
pub fn completion_for(job: &Job, outcome: JobOutcome, columns: &[ColumnDef]) -> JobCompletion {
    match outcome {
        JobOutcome::Succeeded {
            response,
            retry_count,
        } => {
            let (accuracy, evaluation_result) = match &job.ground_truth {
                Some(expected) if job.has_ground_truth() => {
                    let score = score_job(expected, Some(&response.extracted_fields), columns);
                    (score.accuracy, score.verdict)
                }
                _ => (None, EvaluationResult::Unset),
            };
            JobCompletion {
                status: JobStatus::Completed,
                extracted_data: Some(response.extracted_fields),
                raw_log: response.raw_log,
                error_message: None,
                failure_category: None,
                accuracy,
                evaluation_result,
                retry_count,
                completed_at: Utc::now(),
            }
        }
        JobOutcome::Failed {
            message,
            classification,
            retry_count,
        } => JobCompletion::failed(message, classification.category.label(), retry_count),
        JobOutcome::Cancelled { retry_count } => JobCompletion {
            failure_category: None,
            ..JobCompletion::failed(CANCELLED_BY_STOP, FailureCategory::Unknown.label(), retry_count)
        },
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct Dispatcher {
    deps: ServerDeps,
    runner: JobRunner,
    execution_id: ExecutionId,
    batch_id: BatchId,
    columns: Arc<Vec<ColumnDef>>,
    control: watch::Receiver<DispatchControl>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        deps: ServerDeps,
        execution_id: ExecutionId,
        batch_id: BatchId,
        columns: Vec<ColumnDef>,
        control: watch::Receiver<DispatchControl>,
        wake: Arc<Notify>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner: JobRunner::new(&deps),
            deps,
            execution_id,
            batch_id,
            columns: Arc::new(columns),
            control,
            wake,
            cancel,
        }
    }

    #[instrument(skip_all, fields(execution_id = %self.execution_id))]
    pub async fn run(mut self) {
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut poll = tokio::time::interval(self.deps.settings.dispatch_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Dispatcher started");
        loop {
            let control = *self.control.borrow_and_update();
            match control.signal {
                DispatchSignal::Stop => break,
                DispatchSignal::Pause => {}
                DispatchSignal::Run => {
                    self.fill(&mut in_flight, control.concurrency).await;
                    if in_flight.is_empty() && self.try_complete().await {
                        break;
                    }
                }
            }

            tokio::select! {
                changed = self.control.changed() => {
                    if changed.is_err() {
                        debug!("Control channel closed");
                        break;
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Job task panicked");
                    }
                }
                _ = self.wake.notified() => {}
                _ = poll.tick() => {}
            }
        }

        // In-flight jobs always get their result recorded, even after a stop.
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task panicked");
            }
        }
        info!("Dispatcher finished");
    }

    /// Claim queued jobs until the concurrency limit is reached.
    async fn fill(&self, in_flight: &mut JoinSet<()>, concurrency: usize) {
        while in_flight.len() < concurrency {
            let job = match self.deps.store.claim_next_job(self.execution_id).await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Failed to claim next job");
                    return;
                }
            };

            debug!(job_id = %job.id, row_index = job.row_index, in_flight = in_flight.len() + 1, "Job claimed");
            self.deps
                .events
                .emit(
                    NewEvent::new(EventType::JobStarted, self.batch_id)
                        .execution(self.execution_id)
                        .job(job.id)
                        .payload(json!({ "rowIndex": job.row_index, "url": job.url })),
                )
                .await;

            let task = JobTask {
                deps: self.deps.clone(),
                runner: self.runner.clone(),
                columns: self.columns.clone(),
                cancel: self.cancel.clone(),
            };
            in_flight.spawn(task.process(job));
        }
    }

    /// Complete the execution once nothing is queued or running.
    async fn try_complete(&self) -> bool {
        let counters = match self.deps.store.execution_counters(self.execution_id).await {
            Ok(counters) => counters,
            Err(e) => {
                warn!(error = %e, "Failed to read execution counters");
                return false;
            }
        };
        if counters.queued > 0 || counters.running > 0 {
            return false;
        }

        // Re-checks for queued work atomically; a rerun may have landed since the read.
        let completed = match self.deps.store.complete_execution(self.execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Failed to complete execution");
                return false;
            }
        };

        info!(
            completed = completed.counters.completed,
            error = completed.counters.error,
            "Execution completed"
        );
        self.deps
            .events
            .emit(
                NewEvent::new(EventType::ExecutionCompleted, self.batch_id)
                    .execution(self.execution_id)
                    .payload(json!({
                        "totalJobs": completed.total_jobs,
                        "completed": completed.counters.completed,
                        "error": completed.counters.error,
                    })),
            )
            .await;

        if let Err(e) = self
            .deps
            .metrics
            .snapshot(
                self.batch_id,
                Some(self.execution_id),
                SnapshotTrigger::ExecutionCompleted,
            )
            .await
        {
            warn!(error = %e, "Failed to snapshot metrics on completion");
        }
        true
    }
}

/// Everything a spawned job needs.
struct JobTask {
    deps: ServerDeps,
    runner: JobRunner,
    columns: Arc<Vec<ColumnDef>>,
    cancel: CancellationToken,
}

impl JobTask {
    async fn process(self, job: Job) {
        let outcome = self.runner.run(&job, &self.columns, &self.cancel).await;
        let suggested_fix = match &outcome {
            JobOutcome::Failed { classification, .. } => Some(classification.suggested_fix),
            _ => None,
        };
        let completion = completion_for(&job, outcome, &self.columns);

        let finished = match self.deps.store.finish_job(job.id, &completion).await {
            Ok(Some(finished)) => finished,
            Ok(None) => {
                warn!(job_id = %job.id, "Job was no longer running when its result arrived");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job result");
                return;
            }
        };

        let event = match finished.status {
            JobStatus::Completed => NewEvent::new(EventType::JobCompleted, finished.batch_id).payload(json!({
                "rowIndex": finished.row_index,
                "accuracy": finished.accuracy,
                "evaluationResult": finished.evaluation_result,
                "retryCount": finished.retry_count,
            })),
            _ => NewEvent::new(EventType::JobFailed, finished.batch_id).payload(json!({
                "rowIndex": finished.row_index,
                "error": finished.error_message,
                "category": finished.failure_category,
                "suggestedFix": suggested_fix,
                "retryCount": finished.retry_count,
            })),
        };
        self.deps
            .events
            .emit(event.maybe_execution(finished.execution_id).job(finished.id))
            .await;

        if let Some(execution_id) = finished.execution_id {
            if let Err(e) = self.deps.store.touch_execution(execution_id).await {
                debug!(error = %e, "Failed to touch execution");
            }
        }
    }
}
