//! Executes one job against the agent with retry and progress tracking.
//!
//! The runner never writes the terminal job state; it returns a
//! [`JobOutcome`] and the execution controller records it with a CAS.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domains::batches::models::ColumnDef;
use crate::domains::events::models::{EventType, NewEvent};
use crate::domains::events::EventPublisher;
use crate::domains::failures::{classify, Classification};
use crate::domains::jobs::models::{Job, JobProgress};
use crate::kernel::{AgentError, AgentProgress, AgentRequest, AgentResponse, BaseAgent, ServerDeps};
use crate::storage::Store;

/// Buffered progress updates per agent call.
const PROGRESS_BUFFER: usize = 16;

// ============================================================================
// Retry policy
// ============================================================================

/// How transient failures are retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

// ============================================================================
// Outcome
// ============================================================================

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded {
        response: AgentResponse,
        retry_count: i32,
    },
    Failed {
        message: String,
        classification: Classification,
        retry_count: i32,
    },
    /// The execution was stopped while the job was in flight.
    Cancelled { retry_count: i32 },
}

impl JobOutcome {
    pub fn retry_count(&self) -> i32 {
        match self {
            JobOutcome::Succeeded { retry_count, .. }
            | JobOutcome::Failed { retry_count, .. }
            | JobOutcome::Cancelled { retry_count } => *retry_count,
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn Store>,
    agent: Arc<dyn BaseAgent>,
    events: EventPublisher,
    policy: RetryPolicy,
}

impl JobRunner {
    pub fn new(deps: &ServerDeps) -> Self {
        Self {
            store: deps.store.clone(),
            agent: deps.agent.clone(),
            events: deps.events.clone(),
            policy: deps.settings.retry.clone(),
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, url = %job.url))]
    pub async fn run(&self, job: &Job, columns: &[ColumnDef], cancel: &CancellationToken) -> JobOutcome {
        let mut retry_count = job.retry_count;
        let mut attempt: u32 = 1;

        loop {
            let error = match self.attempt(job, columns, cancel).await {
                Ok(response) => {
                    debug!(attempt, "Agent call succeeded");
                    return JobOutcome::Succeeded {
                        response,
                        retry_count,
                    };
                }
                Err(AgentError::CancelledByStop) => return JobOutcome::Cancelled { retry_count },
                Err(error) => error,
            };

            let message = error.to_string();
            let classification = classify(&message);
            if !classification.transient || attempt >= self.policy.max_attempts {
                info!(
                    attempt,
                    category = %classification.category,
                    error = %message,
                    "Job failed"
                );
                return JobOutcome::Failed {
                    message,
                    classification,
                    retry_count,
                };
            }

            retry_count += 1;
            let delay = self.policy.delay_for(attempt);
            warn!(
                attempt,
                retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Transient failure, retrying"
            );

            if let Err(e) = self.store.record_job_retry(job.id, retry_count, &message).await {
                warn!(error = %e, "Failed to record retry");
            }
            self.events
                .emit(
                    NewEvent::new(EventType::JobRetrying, job.batch_id)
                        .maybe_execution(job.execution_id)
                        .job(job.id)
                        .payload(json!({
                            "retryCount": retry_count,
                            "reason": message,
                            "category": classification.category,
                            "delayMs": delay.as_millis() as u64,
                        })),
                )
                .await;

            tokio::select! {
                _ = cancel.cancelled() => return JobOutcome::Cancelled { retry_count },
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// One agent call, persisting progress while it runs.
    async fn attempt(
        &self,
        job: &Job,
        columns: &[ColumnDef],
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
        let request = AgentRequest {
            job_id: job.id,
            url: job.url.clone(),
            goal: job.goal.clone(),
            column_schema: columns.to_vec(),
        };

        let call = self.agent.run(request, tx, cancel.clone());
        tokio::pin!(call);

        let result = loop {
            tokio::select! {
                result = &mut call => break result,
                Some(progress) = rx.recv() => self.record_progress(job, progress).await,
            }
        };
        while let Ok(progress) = rx.try_recv() {
            self.record_progress(job, progress).await;
        }

        let response = result?;
        match &response.error {
            Some(reason) => Err(AgentError::Rejected(reason.clone())),
            None => Ok(response),
        }
    }

    async fn record_progress(&self, job: &Job, progress: AgentProgress) {
        let update = JobProgress {
            current_step: progress.current_step,
            progress_percentage: progress.progress_percentage.clamp(0, 100),
            at: Utc::now(),
        };

        match self.store.update_job_progress(job.id, &update).await {
            Ok(true) => {
                self.events
                    .emit(
                        NewEvent::new(EventType::JobProgress, job.batch_id)
                            .maybe_execution(job.execution_id)
                            .job(job.id)
                            .payload(json!({
                                "currentStep": update.current_step,
                                "progressPercentage": update.progress_percentage,
                            })),
                    )
                    .await;
            }
            Ok(false) => debug!("Progress for a job that is no longer running"),
            Err(e) => warn!(error = %e, "Failed to record progress"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BatchId;
    use crate::domains::batches::models::{Batch, ColumnKind};
    use crate::domains::events::models::EventQuery;
    use crate::domains::executions::models::{ExecutionLaunch, ExecutionType};
    use crate::domains::failures::FailureCategory;
    use crate::kernel::{MockAgent, MockReply, TestDependencies};
    use crate::storage::JobFilter;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    /// Insert a one-row batch, launch it and claim the job.
    async fn claimed_job(deps: &ServerDeps, url: &str) -> Job {
        let batch = Batch::new("runner", vec![ColumnDef::ground_truth("price", ColumnKind::Text)], 1);
        let job = Job::builder().batch_id(batch.id).url(url).goal("find the price").build();
        deps.store.insert_batch(&batch, &[job]).await.unwrap();
        let execution = deps
            .store
            .launch_execution(&ExecutionLaunch {
                batch_id: batch.id,
                execution_type: ExecutionType::Full,
                concurrency: 1,
                sample_size: None,
            })
            .await
            .unwrap();
        deps.store.claim_next_job(execution.id).await.unwrap().unwrap()
    }

    async fn events_of(deps: &ServerDeps, batch_id: BatchId, event_type: EventType) -> usize {
        let query = EventQuery {
            filter: crate::domains::events::models::EventFilter {
                batch_id: Some(batch_id),
                ..Default::default()
            },
            event_type: Some(event_type),
            ..Default::default()
        };
        deps.events.query(&query).await.unwrap().total as usize
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() {
        let url = "https://shop.example/a";
        let agent = MockAgent::new().failing_times(url, 1, AgentError::Timeout(Duration::from_secs(30)));
        let deps = TestDependencies::new().mock_agent(agent).into_deps();
        let job = claimed_job(&deps, url).await;

        let outcome = JobRunner::new(&deps).run(&job, &[], &CancellationToken::new()).await;

        assert!(matches!(outcome, JobOutcome::Succeeded { retry_count: 1, .. }));
        let stored = deps.store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(stored.retry_reason.unwrap().contains("timed out"));
        assert_eq!(events_of(&deps, job.batch_id, EventType::JobRetrying).await, 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let url = "https://shop.example/b";
        let agent = MockAgent::new().with_reply(
            url,
            MockReply::Fail(AgentError::Rejected("403 Forbidden: invalid session".into())),
        );
        let deps = TestDependencies::new().mock_agent(agent.clone()).into_deps();
        let job = claimed_job(&deps, url).await;

        let outcome = JobRunner::new(&deps).run(&job, &[], &CancellationToken::new()).await;

        match outcome {
            JobOutcome::Failed { classification, retry_count, .. } => {
                assert_eq!(classification.category, FailureCategory::AuthorizationError);
                assert_eq!(retry_count, 0);
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(agent.calls_for(url), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let url = "https://shop.example/c";
        let agent = MockAgent::new().failing_times(url, 5, AgentError::Unreachable("connection refused".into()));
        let deps = TestDependencies::new().mock_agent(agent.clone()).into_deps();
        let job = claimed_job(&deps, url).await;

        let outcome = JobRunner::new(&deps).run(&job, &[], &CancellationToken::new()).await;

        assert!(matches!(outcome, JobOutcome::Failed { retry_count: 2, .. }));
        assert_eq!(agent.calls_for(url), 3);
    }

    #[tokio::test]
    async fn progress_is_persisted_and_emitted() {
        let url = "https://shop.example/d";
        let deps = TestDependencies::new().into_deps();
        let job = claimed_job(&deps, url).await;

        JobRunner::new(&deps).run(&job, &[], &CancellationToken::new()).await;

        let stored = deps
            .store
            .list_jobs(&JobFilter::batch(job.batch_id))
            .await
            .unwrap()
            .remove(0);
        assert_eq!(stored.current_step.as_deref(), Some("Extracting fields"));
        assert_eq!(stored.progress_percentage, 80);
        assert_eq!(events_of(&deps, job.batch_id, EventType::JobProgress).await, 2);
    }

    #[tokio::test]
    async fn cancellation_yields_cancelled() {
        let url = "https://shop.example/e";
        let deps = TestDependencies::new().mock_agent(MockAgent::new().gated()).into_deps();
        let job = claimed_job(&deps, url).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = JobRunner::new(&deps).run(&job, &[], &cancel).await;
        assert!(matches!(outcome, JobOutcome::Cancelled { retry_count: 0 }));
    }
}
