//! Integration tests for execution control against the in-memory store.
//!
//! Covers the dispatcher end to end:
//! - retries, completion and the event stream seen by an early subscriber
//! - the concurrency ceiling
//! - stop with jobs in flight
//! - pause/resume idempotence and restart recovery

mod common;

use std::time::Duration;

use crate::common::{
    batch_jobs, create_test_batch, extracted_fields, launch_full, row_url, TestHarness, WAIT_TIMEOUT,
};
use orchestrator_core::domains::events::models::{EventFilter, EventQuery, EventType};
use orchestrator_core::domains::events::StreamItem;
use orchestrator_core::domains::executions::models::{
    ExecutionLaunch, ExecutionStatus, ExecutionType,
};
use orchestrator_core::domains::executions::LaunchRequest;
use orchestrator_core::domains::failures::{CANCELLED_BY_STOP, INTERRUPTED_BY_RESTART};
use orchestrator_core::domains::jobs::models::{EvaluationResult, JobStatus};
use orchestrator_core::kernel::{AgentError, MockAgent};
use orchestrator_core::OrchestratorError;
use test_context::test_context;

// =============================================================================
// Full runs
// =============================================================================

#[tokio::test]
async fn ten_jobs_with_one_transient_failure_each_all_complete() {
    let mut agent = MockAgent::new().with_fields(extracted_fields());
    for i in 0..10 {
        agent = agent.failing_times(&row_url(i), 1, AgentError::Timeout(Duration::from_secs(30)));
    }
    let ctx = TestHarness::with_agent(agent);
    let batch = create_test_batch(&ctx, 10).await.unwrap();

    // Subscribe before launch so nothing can be missed
    let mut subscription = ctx
        .deps
        .events
        .subscribe(
            EventFilter {
                batch_id: Some(batch.id),
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();

    let execution = launch_full(&ctx, &batch, 5).await.unwrap();

    let mut completed_events = 0;
    let mut failed_events = 0;
    let collect = async {
        while let Some(item) = subscription.next().await {
            let StreamItem::Event(event) = item else { continue };
            match event.event_type {
                EventType::JobCompleted => completed_events += 1,
                EventType::JobFailed => failed_events += 1,
                EventType::ExecutionCompleted => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, collect)
        .await
        .expect("execution did not complete in time");

    assert_eq!(completed_events, 10);
    assert_eq!(failed_events, 0);

    let finished = ctx.wait_for_status(execution.id, ExecutionStatus::Completed).await;
    assert_eq!(finished.counters.completed, 10);
    assert_eq!(finished.counters.error, 0);
    assert_eq!(finished.counters.total(), finished.total_jobs);

    for job in batch_jobs(&ctx, &batch).await.unwrap() {
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1, "row {} retried once", job.row_index);
        assert_eq!(job.evaluation_result, EvaluationResult::Pass);
        assert_eq!(ctx.agent.calls_for(&job.url), 2);
    }
    assert!(ctx.agent.max_active() <= 5);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn completed_execution_takes_accuracy_snapshot(ctx: &TestHarness) {
    let batch = create_test_batch(ctx, 3).await.unwrap();
    let execution = launch_full(ctx, &batch, 3).await.unwrap();
    ctx.wait_for_status(execution.id, ExecutionStatus::Completed).await;
    ctx.executions().wait_until_settled(execution.id).await;

    let snapshots = ctx.deps.metrics.snapshots(batch.id, 10).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].execution_id, Some(execution.id));

    let events = ctx
        .deps
        .events
        .query(&EventQuery {
            filter: EventFilter {
                execution_id: Some(execution.id),
                ..Default::default()
            },
            ..Default::default()
        })
        .await
        .unwrap();
    let types: Vec<EventType> = events.events.iter().map(|e| e.event_type).collect();
    assert_eq!(types.first(), Some(&EventType::ExecutionStarted));
    assert!(types.contains(&EventType::ExecutionCompleted));
    assert!(types.contains(&EventType::MetricsSnapshotCreated));
}

#[tokio::test]
async fn running_jobs_never_exceed_concurrency() {
    let ctx = TestHarness::with_agent(MockAgent::new().gated());
    let batch = create_test_batch(&ctx, 8).await.unwrap();
    let execution = launch_full(&ctx, &batch, 3).await.unwrap();

    assert!(ctx.agent.wait_for_active(3, WAIT_TIMEOUT).await);
    ctx.settle().await;
    assert_eq!(ctx.agent.active(), 3);

    let stats = ctx.executions().stats(execution.id, 50).await.unwrap();
    assert_eq!(stats.counters.running, 3);
    assert_eq!(stats.counters.queued, 5);
    assert_eq!(stats.running_jobs.len(), 3);

    // Raising the limit lets more jobs start
    ctx.executions().set_concurrency(execution.id, 5).await.unwrap();
    assert!(ctx.agent.wait_for_active(5, WAIT_TIMEOUT).await);

    ctx.agent.release(8);
    ctx.wait_for_status(execution.id, ExecutionStatus::Completed).await;
    assert_eq!(ctx.agent.max_active(), 5);
}

#[tokio::test]
async fn sample_execution_only_runs_leading_rows() {
    let ctx = TestHarness::with_agent(MockAgent::new().with_fields(extracted_fields()));
    let batch = create_test_batch(&ctx, 6).await.unwrap();

    let execution = ctx
        .executions()
        .launch(LaunchRequest {
            batch_id: batch.id,
            execution_type: ExecutionType::Sample,
            concurrency: Some(2),
            sample_size: Some(2),
        })
        .await
        .unwrap();
    assert_eq!(execution.total_jobs, 2);

    ctx.wait_for_status(execution.id, ExecutionStatus::Completed).await;
    let jobs = batch_jobs(&ctx, &batch).await.unwrap();
    assert!(jobs[..2].iter().all(|j| j.status == JobStatus::Completed));
    assert!(jobs[2..].iter().all(|j| j.status == JobStatus::Queued));
    assert_eq!(ctx.agent.call_count(), 2);
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test]
async fn stop_records_in_flight_results_and_leaves_queued_jobs() {
    let ctx = TestHarness::with_agent(
        MockAgent::new()
            .with_fields(extracted_fields())
            .gated()
            .ignoring_cancellation(),
    );
    let batch = create_test_batch(&ctx, 7).await.unwrap();
    let execution = launch_full(&ctx, &batch, 3).await.unwrap();
    assert!(ctx.agent.wait_for_active(3, WAIT_TIMEOUT).await);

    let stopped = ctx
        .executions()
        .stop(execution.id, Some("operator request".to_string()))
        .await
        .unwrap();
    assert_eq!(stopped.status, ExecutionStatus::Stopped);
    assert_eq!(stopped.stop_reason.as_deref(), Some("operator request"));

    // Late results still land on the jobs
    ctx.agent.release(3);
    ctx.executions().wait_until_settled(execution.id).await;

    let jobs = batch_jobs(&ctx, &batch).await.unwrap();
    let completed = jobs.iter().filter(|j| j.status == JobStatus::Completed).count();
    let queued = jobs.iter().filter(|j| j.status == JobStatus::Queued).count();
    assert_eq!(completed, 3);
    assert_eq!(queued, 4);

    let after = ctx.executions().get(execution.id).await.unwrap();
    assert_eq!(after.status, ExecutionStatus::Stopped);
    assert_eq!(after.counters.completed, 3);
    assert_eq!(after.counters.running, 0);
    assert_eq!(after.counters.queued, 4);
    assert_eq!(ctx.agent.call_count(), 3);
}

#[tokio::test]
async fn stop_cancels_agent_calls_that_honor_cancellation() {
    let ctx = TestHarness::with_agent(MockAgent::new().gated());
    let batch = create_test_batch(&ctx, 5).await.unwrap();
    let execution = launch_full(&ctx, &batch, 2).await.unwrap();
    assert!(ctx.agent.wait_for_active(2, WAIT_TIMEOUT).await);

    ctx.executions().stop(execution.id, None).await.unwrap();
    ctx.executions().wait_until_settled(execution.id).await;

    let jobs = batch_jobs(&ctx, &batch).await.unwrap();
    let cancelled: Vec<_> = jobs.iter().filter(|j| j.status == JobStatus::Error).collect();
    assert_eq!(cancelled.len(), 2);
    for job in cancelled {
        assert_eq!(job.error_message.as_deref(), Some(CANCELLED_BY_STOP));
        assert!(job.failure_category.is_none());
    }
    assert_eq!(jobs.iter().filter(|j| j.status == JobStatus::Queued).count(), 3);
}

#[tokio::test]
async fn stopped_execution_rejects_resume_and_frees_the_batch() {
    let ctx = TestHarness::with_agent(MockAgent::new().gated());
    let batch = create_test_batch(&ctx, 2).await.unwrap();
    let execution = launch_full(&ctx, &batch, 1).await.unwrap();
    ctx.executions().stop(execution.id, None).await.unwrap();

    match ctx.executions().resume(execution.id).await {
        Err(OrchestratorError::InvalidTransition { execution: current, .. }) => {
            assert_eq!(current.status, ExecutionStatus::Stopped);
        }
        other => panic!("expected invalid transition, got {:?}", other),
    }

    // The batch can run again once nothing is active
    ctx.agent.release(10);
    ctx.executions().wait_until_settled(execution.id).await;
    let next = launch_full(&ctx, &batch, 1).await.unwrap();
    assert_ne!(next.id, execution.id);
}

// =============================================================================
// Pause / resume
// =============================================================================

#[tokio::test]
async fn pause_twice_is_a_no_op_and_resume_continues() {
    let ctx = TestHarness::with_agent(MockAgent::new().gated());
    let batch = create_test_batch(&ctx, 4).await.unwrap();
    let execution = launch_full(&ctx, &batch, 1).await.unwrap();
    assert!(ctx.agent.wait_for_active(1, WAIT_TIMEOUT).await);

    let paused = ctx.executions().pause(execution.id).await.unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    let again = ctx.executions().pause(execution.id).await.unwrap();
    assert_eq!(again.status, ExecutionStatus::Paused);
    assert_eq!(again.paused_at, paused.paused_at);

    // In-flight work finishes, nothing new starts
    ctx.agent.release(1);
    ctx.settle().await;
    assert_eq!(ctx.agent.call_count(), 1);

    let resumed = ctx.executions().resume(execution.id).await.unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Running);
    ctx.agent.release(10);
    ctx.wait_for_status(execution.id, ExecutionStatus::Completed).await;
    assert_eq!(ctx.agent.call_count(), 4);
}

// =============================================================================
// Rerun
// =============================================================================

#[tokio::test]
async fn rerun_resets_a_job_and_dispatches_it_exactly_once() {
    let ctx = TestHarness::with_agent(MockAgent::new().with_fields(extracted_fields()));
    let batch = create_test_batch(&ctx, 3).await.unwrap();
    let first = launch_full(&ctx, &batch, 3).await.unwrap();
    ctx.wait_for_status(first.id, ExecutionStatus::Completed).await;
    ctx.executions().wait_until_settled(first.id).await;

    let target = batch_jobs(&ctx, &batch).await.unwrap()[1].clone();
    let rerun = ctx.executions().rerun_jobs(&[target.id]).await.unwrap();
    assert_eq!(rerun.len(), 1);
    assert_eq!(rerun[0].status, JobStatus::Queued);
    assert_eq!(rerun[0].progress_percentage, 0);
    assert!(rerun[0].completed_at.is_none());

    let pending = ctx
        .executions()
        .launch(LaunchRequest {
            batch_id: batch.id,
            execution_type: ExecutionType::Pending,
            concurrency: Some(2),
            sample_size: None,
        })
        .await
        .unwrap();
    assert_eq!(pending.total_jobs, 1);
    ctx.wait_for_status(pending.id, ExecutionStatus::Completed).await;

    assert_eq!(ctx.agent.calls_for(&target.url), 2);
    assert_eq!(ctx.agent.call_count(), 4);
}

#[tokio::test]
async fn finished_executions_keep_their_counts_after_relaunch_and_rerun() {
    let ctx = TestHarness::with_agent(MockAgent::new().with_fields(extracted_fields()));
    let batch = create_test_batch(&ctx, 4).await.unwrap();

    let first = launch_full(&ctx, &batch, 2).await.unwrap();
    ctx.wait_for_status(first.id, ExecutionStatus::Completed).await;
    ctx.executions().wait_until_settled(first.id).await;

    // A second full run takes every job of the batch
    let second = launch_full(&ctx, &batch, 2).await.unwrap();
    ctx.wait_for_status(second.id, ExecutionStatus::Completed).await;
    ctx.executions().wait_until_settled(second.id).await;

    // With no active execution the rerun detaches the job
    let target = batch_jobs(&ctx, &batch).await.unwrap()[0].clone();
    let rerun = ctx.executions().rerun_jobs(&[target.id]).await.unwrap();
    assert_eq!(rerun[0].execution_id, None);

    for id in [first.id, second.id] {
        let execution = ctx.executions().get(id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.total_jobs, 4);
        assert_eq!(execution.counters.completed, 4);
        assert_eq!(execution.counters.queued, 0);
    }
}

#[tokio::test]
async fn rerun_into_active_execution_wakes_the_dispatcher() {
    let ctx = TestHarness::with_agent(MockAgent::new().gated());
    let batch = create_test_batch(&ctx, 3).await.unwrap();
    let execution = launch_full(&ctx, &batch, 1).await.unwrap();

    // Let the first job finish, hold the second
    assert!(ctx.agent.wait_for_active(1, WAIT_TIMEOUT).await);
    ctx.agent.release(1);

    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    let finished = loop {
        let jobs = batch_jobs(&ctx, &batch).await.unwrap();
        if let Some(job) = jobs.into_iter().find(|j| j.status == JobStatus::Completed) {
            break job;
        }
        assert!(tokio::time::Instant::now() < deadline, "first job never completed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    ctx.executions().rerun_jobs(&[finished.id]).await.unwrap();

    ctx.agent.release(10);
    ctx.wait_for_status(execution.id, ExecutionStatus::Completed).await;
    assert_eq!(ctx.agent.calls_for(&finished.url), 2);
    assert_eq!(ctx.agent.max_active(), 1);
}

// =============================================================================
// Recovery
// =============================================================================

#[tokio::test]
async fn recover_fails_interrupted_jobs_and_resumes_dispatch() {
    let ctx = TestHarness::with_agent(MockAgent::new().with_fields(extracted_fields()));
    let batch = create_test_batch(&ctx, 3).await.unwrap();

    // Simulate a previous process that claimed a job and then died
    let execution = ctx
        .deps
        .store
        .launch_execution(&ExecutionLaunch {
            batch_id: batch.id,
            execution_type: ExecutionType::Full,
            concurrency: 2,
            sample_size: None,
        })
        .await
        .unwrap();
    let claimed = ctx
        .deps
        .store
        .claim_next_job(execution.id)
        .await
        .unwrap()
        .expect("a queued job");

    let recovered = ctx.executions().recover().await.unwrap();
    assert_eq!(recovered, 1);

    let finished = ctx.wait_for_status(execution.id, ExecutionStatus::Completed).await;
    assert_eq!(finished.counters.completed, 2);
    assert_eq!(finished.counters.error, 1);

    let interrupted = ctx.deps.store.find_job(claimed.id).await.unwrap().unwrap();
    assert_eq!(interrupted.status, JobStatus::Error);
    assert_eq!(interrupted.error_message.as_deref(), Some(INTERRUPTED_BY_RESTART));
    assert_eq!(ctx.agent.calls_for(&claimed.url), 0);
}
