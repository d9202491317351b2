//! In-memory storage implementation for tests and local development.
//!
//! All state sits behind one mutex, so every method is trivially atomic and
//! the compare-and-swap semantics of the Postgres store hold here too. Data
//! is lost on restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::error::{Result, StoreError};
use super::traits::{
    BatchStore, BulkWrite, EventStore, ExecutionStore, JobFilter, JobStore, SnapshotStore,
};
use crate::common::{BatchId, EventId, ExecutionId, JobId};
use crate::domains::accuracy::models::MetricsSnapshot;
use crate::domains::batches::models::Batch;
use crate::domains::events::models::{Event, EventQuery, NewEvent};
use crate::domains::executions::models::{
    Execution, ExecutionLaunch, ExecutionStatus, ExecutionType,
};
use crate::domains::jobs::models::{
    Job, JobCompletion, JobCounters, JobPatch, JobProgress, JobStatus,
};

#[derive(Default)]
struct State {
    batches: HashMap<BatchId, Batch>,
    jobs: HashMap<JobId, Job>,
    executions: HashMap<ExecutionId, Execution>,
    events: Vec<Event>,
    next_sequence: i64,
    snapshots: Vec<MetricsSnapshot>,
    /// Counters captured when an execution went terminal.
    frozen: HashMap<ExecutionId, JobCounters>,
}

impl State {
    fn counters(&self, execution_id: ExecutionId) -> JobCounters {
        match self.frozen.get(&execution_id) {
            Some(frozen) => *frozen,
            None => self.live_counters(execution_id),
        }
    }

    fn live_counters(&self, execution_id: ExecutionId) -> JobCounters {
        JobCounters::from_statuses(
            self.jobs
                .values()
                .filter(|j| j.execution_id == Some(execution_id))
                .map(|j| j.status),
        )
    }

    fn with_counters(&self, execution: &Execution) -> Execution {
        execution.clone().with_counters(self.counters(execution.id))
    }

    fn running_among(&self, ids: &[JobId]) -> Vec<Job> {
        let mut running: Vec<Job> = ids
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|j| j.status == JobStatus::Running)
            .cloned()
            .collect();
        running.sort_by_key(|j| (j.batch_id, j.row_index));
        running.dedup_by_key(|j| j.id);
        running
    }
}

/// In-memory store for batches, jobs, executions, events and snapshots.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Number of events currently in the log.
    pub fn event_count(&self) -> usize {
        self.lock().map(|s| s.events.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn insert_batch(&self, batch: &Batch, jobs: &[Job]) -> Result<()> {
        let mut state = self.lock()?;
        state.batches.insert(batch.id, batch.clone());
        for job in jobs {
            state.jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn find_batch(&self, id: BatchId) -> Result<Option<Batch>> {
        Ok(self.lock()?.batches.get(&id).cloned())
    }

    async fn update_batch_accuracy(
        &self,
        id: BatchId,
        accuracy: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let batch = state
            .batches
            .get_mut(&id)
            .ok_or(StoreError::BatchNotFound(id))?;
        batch.last_accuracy = accuracy;
        batch.accuracy_updated_at = Some(at);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn find_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn find_jobs(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        let state = self.lock()?;
        let mut jobs: Vec<Job> = ids
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.batch_id, j.row_index));
        jobs.dedup_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let state = self.lock()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.batch_id, j.row_index));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn claim_next_job(&self, execution_id: ExecutionId) -> Result<Option<Job>> {
        let mut state = self.lock()?;
        let running = state
            .executions
            .get(&execution_id)
            .is_some_and(|e| e.status == ExecutionStatus::Running);
        if !running {
            return Ok(None);
        }

        let next = state
            .jobs
            .values()
            .filter(|j| j.execution_id == Some(execution_id) && j.status == JobStatus::Queued)
            .min_by_key(|j| j.row_index)
            .map(|j| j.id);
        let Some(job_id) = next else {
            return Ok(None);
        };

        let now = Utc::now();
        let claimed = state.jobs.get_mut(&job_id).map(|job| {
            job.status = JobStatus::Running;
            job.progress_percentage = 0;
            job.current_step = None;
            job.started_at = Some(now);
            job.last_activity_at = Some(now);
            job.updated_at = now;
            job.clone()
        });
        if let Some(execution) = state.executions.get_mut(&execution_id) {
            execution.last_activity_at = now;
        }
        Ok(claimed)
    }

    async fn update_job_progress(&self, id: JobId, progress: &JobProgress) -> Result<bool> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.current_step = Some(progress.current_step.clone());
                job.progress_percentage = progress.progress_percentage.clamp(0, 100);
                job.last_activity_at = Some(progress.at);
                job.updated_at = progress.at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_job_retry(&self, id: JobId, retry_count: i32, reason: &str) -> Result<bool> {
        let mut state = self.lock()?;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                let now = Utc::now();
                job.retry_count = retry_count;
                if job.retry_reason.is_none() {
                    job.retry_reason = Some(reason.to_string());
                }
                job.last_activity_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_job(&self, id: JobId, completion: &JobCompletion) -> Result<Option<Job>> {
        let mut state = self.lock()?;
        let finished = match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.apply_completion(completion);
                job.clone()
            }
            _ => return Ok(None),
        };
        // An in-flight job finishing after a stop still lands in the frozen counts.
        if let Some(frozen) = finished
            .execution_id
            .and_then(|execution_id| state.frozen.get_mut(&execution_id))
        {
            frozen.settle(JobStatus::Running, finished.status);
        }
        Ok(Some(finished))
    }

    async fn requeue_jobs(&self, ids: &[JobId]) -> Result<BulkWrite<Vec<Job>>> {
        let mut state = self.lock()?;
        let blocked = state.running_among(ids);
        if !blocked.is_empty() {
            return Ok(BulkWrite::Blocked(blocked));
        }

        let active: HashMap<BatchId, ExecutionId> = state
            .executions
            .values()
            .filter(|e| e.status.is_active())
            .map(|e| (e.batch_id, e.id))
            .collect();

        let now = Utc::now();
        let mut requeued = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = state.jobs.get_mut(id) {
                job.reset_for_rerun(now);
                job.execution_id = active.get(&job.batch_id).copied();
                requeued.push(job.clone());
            }
        }
        requeued.sort_by_key(|j| (j.batch_id, j.row_index));
        requeued.dedup_by_key(|j| j.id);
        Ok(BulkWrite::Applied(requeued))
    }

    async fn delete_jobs(&self, ids: &[JobId]) -> Result<BulkWrite<u64>> {
        let mut state = self.lock()?;
        let blocked = state.running_among(ids);
        if !blocked.is_empty() {
            return Ok(BulkWrite::Blocked(blocked));
        }

        let deleted = ids
            .iter()
            .filter(|id| state.jobs.remove(*id).is_some())
            .count();
        Ok(BulkWrite::Applied(deleted as u64))
    }

    async fn update_jobs(&self, ids: &[JobId], patch: &JobPatch) -> Result<BulkWrite<Vec<Job>>> {
        let mut state = self.lock()?;
        let blocked = state.running_among(ids);
        if !blocked.is_empty() {
            return Ok(BulkWrite::Blocked(blocked));
        }

        let now = Utc::now();
        let mut updated = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = state.jobs.get_mut(id) {
                patch.apply(job, now);
                updated.push(job.clone());
            }
        }
        updated.sort_by_key(|j| (j.batch_id, j.row_index));
        updated.dedup_by_key(|j| j.id);
        Ok(BulkWrite::Applied(updated))
    }

    async fn fail_interrupted_jobs(
        &self,
        execution_id: ExecutionId,
        completion: &JobCompletion,
    ) -> Result<Vec<Job>> {
        let mut state = self.lock()?;
        let mut failed = Vec::new();
        for job in state.jobs.values_mut() {
            if job.execution_id == Some(execution_id) && job.status == JobStatus::Running {
                // Keep the attempts already made.
                let completion = JobCompletion {
                    retry_count: job.retry_count,
                    ..completion.clone()
                };
                job.apply_completion(&completion);
                failed.push(job.clone());
            }
        }
        failed.sort_by_key(|j| j.row_index);
        Ok(failed)
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn launch_execution(&self, launch: &ExecutionLaunch) -> Result<Execution> {
        let mut state = self.lock()?;
        if !state.batches.contains_key(&launch.batch_id) {
            return Err(StoreError::BatchNotFound(launch.batch_id));
        }
        if let Some(active) = state
            .executions
            .values()
            .find(|e| e.batch_id == launch.batch_id && e.status.is_active())
        {
            return Err(StoreError::ActiveExecution(Box::new(
                state.with_counters(active),
            )));
        }

        let execution = Execution::new(launch);
        let now = execution.started_at;

        let mut batch_jobs: Vec<&mut Job> = state
            .jobs
            .values_mut()
            .filter(|j| j.batch_id == launch.batch_id)
            .collect();
        batch_jobs.sort_by_key(|j| j.row_index);

        let take = match launch.execution_type {
            ExecutionType::Sample => launch.sample_size.unwrap_or(0).max(0) as usize,
            _ => batch_jobs.len(),
        };
        for job in batch_jobs.into_iter().take(take) {
            match launch.execution_type {
                ExecutionType::Full | ExecutionType::Sample => {
                    if job.status == JobStatus::Running {
                        continue;
                    }
                    job.reset_for_rerun(now);
                }
                ExecutionType::Pending => {
                    if job.status != JobStatus::Queued {
                        continue;
                    }
                    job.updated_at = now;
                }
            }
            job.execution_id = Some(execution.id);
        }

        state.executions.insert(execution.id, execution.clone());
        Ok(state.with_counters(&execution))
    }

    async fn find_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let state = self.lock()?;
        Ok(state.executions.get(&id).map(|e| state.with_counters(e)))
    }

    async fn find_active_execution(&self, batch_id: BatchId) -> Result<Option<Execution>> {
        let state = self.lock()?;
        Ok(state
            .executions
            .values()
            .find(|e| e.batch_id == batch_id && e.status.is_active())
            .map(|e| state.with_counters(e)))
    }

    async fn list_executions(&self, batch_id: Option<BatchId>) -> Result<Vec<Execution>> {
        let state = self.lock()?;
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| batch_id.map_or(true, |id| e.batch_id == id))
            .map(|e| state.with_counters(e))
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(executions)
    }

    async fn list_active_executions(&self) -> Result<Vec<Execution>> {
        let state = self.lock()?;
        let mut executions: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| e.status.is_active())
            .map(|e| state.with_counters(e))
            .collect();
        executions.sort_by_key(|e| e.started_at);
        Ok(executions)
    }

    async fn transition_execution(
        &self,
        id: ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        reason: Option<&str>,
    ) -> Result<Option<Execution>> {
        let mut state = self.lock()?;
        let updated = match state.executions.get_mut(&id) {
            Some(execution) if from.contains(&execution.status) => {
                execution.apply_transition(to, reason, Utc::now());
                execution.clone()
            }
            _ => return Ok(None),
        };
        if to.is_terminal() {
            let counters = state.live_counters(id);
            state.frozen.insert(id, counters);
        }
        Ok(Some(state.with_counters(&updated)))
    }

    async fn complete_execution(&self, id: ExecutionId) -> Result<Option<Execution>> {
        let mut state = self.lock()?;
        let counters = state.live_counters(id);
        if counters.queued > 0 || counters.running > 0 {
            return Ok(None);
        }
        let updated = match state.executions.get_mut(&id) {
            Some(execution) if execution.status == ExecutionStatus::Running => {
                execution.apply_transition(ExecutionStatus::Completed, None, Utc::now());
                execution.clone()
            }
            _ => return Ok(None),
        };
        state.frozen.insert(id, counters);
        Ok(Some(updated.with_counters(counters)))
    }

    async fn set_execution_concurrency(
        &self,
        id: ExecutionId,
        concurrency: i32,
    ) -> Result<Option<Execution>> {
        let mut state = self.lock()?;
        let updated = match state.executions.get_mut(&id) {
            Some(execution) if execution.status.is_active() => {
                execution.concurrency = concurrency;
                execution.last_activity_at = Utc::now();
                execution.clone()
            }
            _ => return Ok(None),
        };
        Ok(Some(state.with_counters(&updated)))
    }

    async fn touch_execution(&self, id: ExecutionId) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(execution) = state.executions.get_mut(&id) {
            execution.last_activity_at = Utc::now();
        }
        Ok(())
    }

    async fn execution_counters(&self, id: ExecutionId) -> Result<JobCounters> {
        Ok(self.lock()?.counters(id))
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append_event(&self, event: &NewEvent) -> Result<Event> {
        let mut state = self.lock()?;
        state.next_sequence += 1;
        let stored = Event {
            id: EventId::new(),
            sequence: state.next_sequence,
            event_type: event.event_type,
            execution_id: event.execution_id,
            batch_id: event.batch_id,
            job_id: event.job_id,
            timestamp: Utc::now(),
            payload: event.payload.clone(),
        };
        state.events.push(stored.clone());
        Ok(stored)
    }

    async fn query_events(&self, query: &EventQuery) -> Result<(Vec<Event>, i64)> {
        let state = self.lock()?;
        let matching: Vec<&Event> = state.events.iter().filter(|e| query.matches(e)).collect();
        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .filter(|e| query.after_cursor(e))
            .skip(query.page.offset)
            .take(query.page.fetch_limit())
            .cloned()
            .collect();
        Ok((page, total))
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.lock()?;
        let before = state.events.len();
        state.events.retain(|e| e.timestamp >= cutoff);
        Ok((before - state.events.len()) as u64)
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn insert_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        self.lock()?.snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn list_snapshots(
        &self,
        batch_id: BatchId,
        limit: usize,
    ) -> Result<Vec<MetricsSnapshot>> {
        let state = self.lock()?;
        let mut snapshots: Vec<MetricsSnapshot> = state
            .snapshots
            .iter()
            .filter(|s| s.batch_id == batch_id)
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        snapshots.truncate(limit);
        Ok(snapshots)
    }
}
