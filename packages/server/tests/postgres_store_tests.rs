//! PostgreSQL store tests against a real database.
//!
//! These need Docker and are ignored by default:
//! `cargo test --test postgres_store_tests -- --ignored`

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_core::domains::batches::actions::create_batch;
use orchestrator_core::domains::events::models::{EventFilter, EventQuery, EventType, NewEvent};
use orchestrator_core::domains::executions::models::{
    ExecutionLaunch, ExecutionStatus, ExecutionType,
};
use orchestrator_core::domains::jobs::models::{JobCompletion, JobStatus};
use orchestrator_core::kernel::{ServerDeps, TestDependencies};
use orchestrator_core::storage::{JobFilter, PostgresStore, Store, StoreError};
use sqlx::postgres::PgPoolOptions;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

use crate::common::batch_request;

struct PgContext {
    deps: ServerDeps,
    store: Arc<dyn Store>,
    // Keep the container alive for the whole test
    _postgres: ContainerAsync<Postgres>,
}

async fn setup() -> Result<PgContext> {
    let postgres = Postgres::default()
        .with_tag("16")
        .start()
        .await
        .context("Failed to start Postgres container")?;
    let host = postgres.get_host().await?;
    let port = postgres.get_host_port_ipv4(5432).await?;
    let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("Failed to connect to Postgres")?;
    let postgres_store = PostgresStore::new(pool);
    postgres_store.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(postgres_store);

    let deps = TestDependencies::new().store(store.clone()).into_deps();
    Ok(PgContext {
        deps,
        store,
        _postgres: postgres,
    })
}

fn full(batch_id: orchestrator_core::common::BatchId, concurrency: i32) -> ExecutionLaunch {
    ExecutionLaunch {
        batch_id,
        execution_type: ExecutionType::Full,
        concurrency,
        sample_size: None,
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn concurrent_claims_never_hand_out_the_same_job() {
    let ctx = setup().await.unwrap();
    let batch = create_batch(&ctx.deps, batch_request("Claims", 20)).await.unwrap();
    let execution = ctx.store.launch_execution(&full(batch.id, 20)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let store = ctx.store.clone();
        handles.push(tokio::spawn(async move {
            store.claim_next_job(execution.id).await
        }));
    }

    let mut claimed = HashSet::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap().unwrap() {
            assert_eq!(job.status, JobStatus::Running);
            assert!(claimed.insert(job.id), "job {} claimed twice", job.id);
        }
    }
    assert_eq!(claimed.len(), 20);
    assert!(ctx.store.claim_next_job(execution.id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn one_active_execution_per_batch() {
    let ctx = setup().await.unwrap();
    let batch = create_batch(&ctx.deps, batch_request("Exclusive", 2)).await.unwrap();
    let first = ctx.store.launch_execution(&full(batch.id, 2)).await.unwrap();

    match ctx.store.launch_execution(&full(batch.id, 2)).await {
        Err(StoreError::ActiveExecution(active)) => assert_eq!(active.id, first.id),
        other => panic!("expected ActiveExecution, got {:?}", other),
    }

    ctx.store
        .transition_execution(
            first.id,
            &[ExecutionStatus::Running],
            ExecutionStatus::Stopped,
            None,
        )
        .await
        .unwrap()
        .expect("running execution should stop");
    ctx.store.launch_execution(&full(batch.id, 2)).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn finish_job_is_a_compare_and_swap() {
    let ctx = setup().await.unwrap();
    let batch = create_batch(&ctx.deps, batch_request("Cas", 1)).await.unwrap();
    let execution = ctx.store.launch_execution(&full(batch.id, 1)).await.unwrap();
    let job = ctx
        .store
        .claim_next_job(execution.id)
        .await
        .unwrap()
        .expect("queued job");

    let completion = JobCompletion::failed("Connection timed out after 30000ms", "Timeout", 2);
    let finished = ctx.store.finish_job(job.id, &completion).await.unwrap();
    assert_eq!(finished.map(|j| j.status), Some(JobStatus::Error));

    // A second terminal write loses
    assert!(ctx.store.finish_job(job.id, &completion).await.unwrap().is_none());

    let counters = ctx.store.execution_counters(execution.id).await.unwrap();
    assert_eq!(counters.error, 1);
    assert_eq!(counters.total(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn stopped_execution_counters_are_frozen() {
    let ctx = setup().await.unwrap();
    let batch = create_batch(&ctx.deps, batch_request("Frozen", 3)).await.unwrap();
    let execution = ctx.store.launch_execution(&full(batch.id, 3)).await.unwrap();
    let in_flight = ctx
        .store
        .claim_next_job(execution.id)
        .await
        .unwrap()
        .expect("queued job");

    let stopped = ctx
        .store
        .transition_execution(
            execution.id,
            &[ExecutionStatus::Running],
            ExecutionStatus::Stopped,
            Some("operator"),
        )
        .await
        .unwrap()
        .expect("running execution should stop");
    assert_eq!(stopped.counters.running, 1);
    assert_eq!(stopped.counters.queued, 2);

    // The in-flight result settles into the frozen counts
    let completion = JobCompletion::failed("boom", "Unknown Error", 0);
    ctx.store.finish_job(in_flight.id, &completion).await.unwrap();

    // A new full run takes every job, a rerun afterwards detaches one
    let relaunched = ctx.store.launch_execution(&full(batch.id, 3)).await.unwrap();
    assert_eq!(relaunched.total_jobs, 3);
    ctx.store
        .transition_execution(
            relaunched.id,
            &[ExecutionStatus::Running],
            ExecutionStatus::Stopped,
            None,
        )
        .await
        .unwrap();
    ctx.store.requeue_jobs(&[in_flight.id]).await.unwrap();

    let stopped = ctx.store.find_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(stopped.total_jobs, 3);
    assert_eq!(stopped.counters.running, 0);
    assert_eq!(stopped.counters.error, 1);
    assert_eq!(stopped.counters.queued, 2);

    let relaunched = ctx.store.find_execution(relaunched.id).await.unwrap().unwrap();
    assert_eq!(relaunched.total_jobs, 3);
    assert_eq!(relaunched.counters.queued, 3);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn completion_waits_for_a_rerun_landing_first() {
    let ctx = setup().await.unwrap();
    let batch = create_batch(&ctx.deps, batch_request("Complete", 1)).await.unwrap();
    let execution = ctx.store.launch_execution(&full(batch.id, 1)).await.unwrap();
    let job = ctx
        .store
        .claim_next_job(execution.id)
        .await
        .unwrap()
        .expect("queued job");
    let completion = JobCompletion::failed("boom", "Unknown Error", 0);
    ctx.store.finish_job(job.id, &completion).await.unwrap();

    // Rerun attaches the job to the still-running execution
    ctx.store.requeue_jobs(&[job.id]).await.unwrap();
    assert!(ctx.store.complete_execution(execution.id).await.unwrap().is_none());

    let job = ctx.store.claim_next_job(execution.id).await.unwrap().expect("requeued job");
    ctx.store.finish_job(job.id, &completion).await.unwrap();
    let completed = ctx
        .store
        .complete_execution(execution.id)
        .await
        .unwrap()
        .expect("drained execution should complete");
    assert_eq!(completed.status, ExecutionStatus::Completed);
    assert_eq!(completed.counters.error, 1);
    assert_eq!(completed.total_jobs, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn event_log_is_ordered_and_filterable() {
    let ctx = setup().await.unwrap();
    let batch = create_batch(&ctx.deps, batch_request("Events", 2)).await.unwrap();
    let jobs = ctx.store.list_jobs(&JobFilter::batch(batch.id)).await.unwrap();

    for job in &jobs {
        ctx.store
            .append_event(&NewEvent::new(EventType::JobStarted, batch.id).job(job.id))
            .await
            .unwrap();
    }

    let (events, total) = ctx
        .store
        .query_events(&EventQuery {
            filter: EventFilter {
                batch_id: Some(batch.id),
                ..Default::default()
            },
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 2);
    assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let (only_first, _) = ctx
        .store
        .query_events(&EventQuery {
            filter: EventFilter {
                job_id: Some(jobs[0].id),
                ..Default::default()
            },
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(only_first.len(), 1);
    assert_eq!(only_first[0].job_id, Some(jobs[0].id));
}
