//! Bulk job operations: rerun, delete and field updates.
//!
//! Each operation validates every target first and applies to all of them or
//! none. A rejection lists each refused job with its reason and current status.

use std::collections::{BTreeSet, HashMap};

use serde_json::json;
use tracing::info;

use crate::common::JobId;
use crate::domains::events::models::{EventType, NewEvent};
use crate::domains::jobs::models::{BulkRejection, Job, JobPatch, JobStatus};
use crate::error::{OrchestratorError, Result};
use crate::kernel::ServerDeps;
use crate::storage::BulkWrite;

/// Dedupe while keeping the caller's order.
fn unique_ids(ids: &[JobId]) -> Vec<JobId> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Reject missing or running targets before anything is written.
async fn validate_targets(deps: &ServerDeps, ids: &[JobId]) -> Result<Vec<JobId>> {
    let ids = unique_ids(ids);
    if ids.is_empty() {
        return Err(OrchestratorError::validation("jobIds must not be empty"));
    }

    let found: HashMap<JobId, Job> = deps
        .store
        .find_jobs(&ids)
        .await?
        .into_iter()
        .map(|job| (job.id, job))
        .collect();

    let rejections: Vec<BulkRejection> = ids
        .iter()
        .filter_map(|id| match found.get(id) {
            None => Some(BulkRejection::missing(*id)),
            Some(job) if job.status == JobStatus::Running => Some(BulkRejection::running(job)),
            Some(_) => None,
        })
        .collect();

    if rejections.is_empty() {
        Ok(ids)
    } else {
        Err(OrchestratorError::BulkRejected(rejections))
    }
}

/// The store re-checks running status atomically; anything that started in
/// between is reported the same way as an upfront rejection.
fn applied<T>(write: BulkWrite<T>) -> Result<T> {
    match write {
        BulkWrite::Applied(value) => Ok(value),
        BulkWrite::Blocked(jobs) => Err(OrchestratorError::BulkRejected(
            jobs.iter().map(BulkRejection::running).collect(),
        )),
    }
}

/// Reset the jobs to queued so they run again.
///
/// A job whose batch has an active execution joins that execution; otherwise
/// it waits for the next launch. Returns the requeued jobs.
pub async fn rerun_jobs(deps: &ServerDeps, ids: &[JobId]) -> Result<Vec<Job>> {
    let ids = validate_targets(deps, ids).await?;
    let jobs = applied(deps.store.requeue_jobs(&ids).await?)?;

    for job in &jobs {
        deps.events
            .emit(
                NewEvent::new(EventType::JobRerun, job.batch_id)
                    .maybe_execution(job.execution_id)
                    .job(job.id)
                    .payload(json!({ "rowIndex": job.row_index })),
            )
            .await;
    }

    info!(count = jobs.len(), "Jobs requeued");
    Ok(jobs)
}

/// Delete the jobs. Returns how many were removed.
pub async fn delete_jobs(deps: &ServerDeps, ids: &[JobId]) -> Result<u64> {
    let ids = validate_targets(deps, ids).await?;
    let deleted = applied(deps.store.delete_jobs(&ids).await?)?;
    info!(deleted, "Jobs deleted");
    Ok(deleted)
}

/// Apply field updates to the jobs.
pub async fn update_jobs(deps: &ServerDeps, ids: &[JobId], patch: &JobPatch) -> Result<Vec<Job>> {
    if patch.is_empty() {
        return Err(OrchestratorError::validation(
            "at least one of url, goal or groundTruth is required",
        ));
    }
    if matches!(patch.url.as_deref(), Some(url) if url.trim().is_empty()) {
        return Err(OrchestratorError::validation("url must not be empty"));
    }

    let ids = validate_targets(deps, ids).await?;
    let jobs = applied(deps.store.update_jobs(&ids, patch).await?)?;
    info!(count = jobs.len(), "Jobs updated");
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::batches::models::Batch;
    use crate::kernel::TestDependencies;

    async fn seeded(deps: &ServerDeps, statuses: &[JobStatus]) -> Vec<Job> {
        let batch = Batch::new("bulk", vec![], statuses.len() as i32);
        let jobs: Vec<Job> = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                Job::builder()
                    .batch_id(batch.id)
                    .row_index(i as i32)
                    .url(format!("https://site.example/{i}"))
                    .goal("find the title")
                    .status(*status)
                    .build()
            })
            .collect();
        deps.store.insert_batch(&batch, &jobs).await.unwrap();
        jobs
    }

    #[tokio::test]
    async fn delete_rejects_running_targets_and_applies_nothing() {
        let deps = TestDependencies::new().into_deps();
        let jobs = seeded(&deps, &[JobStatus::Completed, JobStatus::Running]).await;
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();

        let err = delete_jobs(&deps, &ids).await.unwrap_err();
        match err {
            OrchestratorError::BulkRejected(rejections) => {
                assert_eq!(rejections.len(), 1);
                assert_eq!(rejections[0].job_id, jobs[1].id);
                assert_eq!(rejections[0].current_status, Some(JobStatus::Running));
            }
            other => panic!("expected bulk rejection, got {other:?}"),
        }
        assert_eq!(deps.store.find_jobs(&ids).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let deps = TestDependencies::new().into_deps();
        let jobs = seeded(&deps, &[JobStatus::Error]).await;
        let missing = JobId::new();

        let err = rerun_jobs(&deps, &[jobs[0].id, missing]).await.unwrap_err();
        match err {
            OrchestratorError::BulkRejected(rejections) => {
                assert_eq!(rejections, vec![BulkRejection::missing(missing)]);
            }
            other => panic!("expected bulk rejection, got {other:?}"),
        }
        let untouched = deps.store.find_job(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Error);
    }

    #[tokio::test]
    async fn rerun_without_active_execution_detaches() {
        let deps = TestDependencies::new().into_deps();
        let jobs = seeded(&deps, &[JobStatus::Error]).await;

        let requeued = rerun_jobs(&deps, &[jobs[0].id]).await.unwrap();
        assert_eq!(requeued[0].status, JobStatus::Queued);
        assert!(requeued[0].execution_id.is_none());
    }

    #[tokio::test]
    async fn empty_patch_is_invalid() {
        let deps = TestDependencies::new().into_deps();
        let jobs = seeded(&deps, &[JobStatus::Queued]).await;
        let err = update_jobs(&deps, &[jobs[0].id], &JobPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[tokio::test]
    async fn patch_updates_goal() {
        let deps = TestDependencies::new().into_deps();
        let jobs = seeded(&deps, &[JobStatus::Queued, JobStatus::Completed]).await;
        let patch = JobPatch {
            goal: Some("find the SKU".into()),
            ..Default::default()
        };

        let updated = update_jobs(&deps, &[jobs[0].id, jobs[1].id], &patch).await.unwrap();
        assert!(updated.iter().all(|j| j.goal == "find the SKU"));
    }
}
