//! Execution lifecycle: launch, pause, resume, stop, concurrency changes and
//! startup recovery.
//!
//! The store holds the authoritative status; every transition is a CAS there
//! first, and the dispatcher is only signalled once the CAS has landed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::controller::{DispatchControl, DispatchSignal, Dispatcher};
use super::models::{
    concurrency_in_range, Execution, ExecutionLaunch, ExecutionStatus, ExecutionType,
    MAX_CONCURRENCY, MIN_CONCURRENCY,
};
use super::stats::{compute_stats, ExecutionStats};
use crate::common::{BatchId, ExecutionId, JobId};
use crate::domains::events::models::{EventType, NewEvent};
use crate::domains::failures::{FailureCategory, INTERRUPTED_BY_RESTART};
use crate::domains::jobs::actions;
use crate::domains::jobs::models::{Job, JobCompletion, JobStatus};
use crate::error::{OrchestratorError, Result};
use crate::kernel::ServerDeps;
use crate::storage::JobFilter;

/// Launch request as it arrives from a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub batch_id: BatchId,
    pub execution_type: ExecutionType,
    pub concurrency: Option<i32>,
    pub sample_size: Option<i32>,
}

struct ExecutionControl {
    control: watch::Sender<DispatchControl>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct ExecutionManager {
    deps: ServerDeps,
    controls: Arc<RwLock<HashMap<ExecutionId, ExecutionControl>>>,
}

impl ExecutionManager {
    pub fn new(deps: ServerDeps) -> Self {
        Self {
            deps,
            controls: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn deps(&self) -> &ServerDeps {
        &self.deps
    }

    fn validate_concurrency(concurrency: i32) -> Result<()> {
        if concurrency_in_range(concurrency) {
            Ok(())
        } else {
            Err(OrchestratorError::validation(format!(
                "concurrency must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
            )))
        }
    }

    /// Start a new execution for a batch.
    #[instrument(skip_all, fields(batch_id = %request.batch_id, execution_type = ?request.execution_type), err)]
    pub async fn launch(&self, request: LaunchRequest) -> Result<Execution> {
        let concurrency = request
            .concurrency
            .unwrap_or(self.deps.settings.default_concurrency);
        Self::validate_concurrency(concurrency)?;

        let sample_size = match request.execution_type {
            ExecutionType::Sample => match request.sample_size {
                Some(size) if size >= 1 => Some(size),
                _ => {
                    return Err(OrchestratorError::validation(
                        "sampleSize must be at least 1 for a sample execution",
                    ))
                }
            },
            _ => None,
        };

        let execution = self
            .deps
            .store
            .launch_execution(&ExecutionLaunch {
                batch_id: request.batch_id,
                execution_type: request.execution_type,
                concurrency,
                sample_size,
            })
            .await?;

        self.deps
            .events
            .emit(
                NewEvent::new(EventType::ExecutionStarted, execution.batch_id)
                    .execution(execution.id)
                    .payload(json!({
                        "executionType": execution.execution_type,
                        "concurrency": execution.concurrency,
                        "sampleSize": execution.sample_size,
                        "totalJobs": execution.total_jobs,
                    })),
            )
            .await;

        self.spawn_dispatcher(&execution, DispatchSignal::Run).await?;
        info!(execution_id = %execution.id, total_jobs = execution.total_jobs, "Execution launched");
        Ok(execution)
    }

    pub async fn get(&self, id: ExecutionId) -> Result<Execution> {
        self.deps
            .store
            .find_execution(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("execution", id))
    }

    pub async fn list(&self, batch_id: Option<BatchId>) -> Result<Vec<Execution>> {
        Ok(self.deps.store.list_executions(batch_id).await?)
    }

    /// Stop dispatching; in-flight jobs finish. Pausing a paused execution is a no-op.
    #[instrument(skip(self), err)]
    pub async fn pause(&self, id: ExecutionId) -> Result<Execution> {
        let current = self.get(id).await?;
        match current.status {
            ExecutionStatus::Paused => Ok(current),
            ExecutionStatus::Running => {
                let paused = self
                    .transition(id, &[ExecutionStatus::Running], ExecutionStatus::Paused, None, "pause")
                    .await?;
                if paused.status == ExecutionStatus::Paused {
                    self.signal(id, DispatchSignal::Pause).await;
                    self.emit_lifecycle(EventType::ExecutionPaused, &paused, json!({})).await;
                }
                Ok(paused)
            }
            _ => Err(OrchestratorError::invalid_transition("pause", current)),
        }
    }

    /// Resume dispatching. Resuming a running execution is a no-op.
    #[instrument(skip(self), err)]
    pub async fn resume(&self, id: ExecutionId) -> Result<Execution> {
        let current = self.get(id).await?;
        match current.status {
            ExecutionStatus::Running => Ok(current),
            ExecutionStatus::Paused => {
                let resumed = self
                    .transition(id, &[ExecutionStatus::Paused], ExecutionStatus::Running, None, "resume")
                    .await?;
                if resumed.status == ExecutionStatus::Running {
                    if !self.signal(id, DispatchSignal::Run).await {
                        self.spawn_dispatcher(&resumed, DispatchSignal::Run).await?;
                    }
                    self.emit_lifecycle(EventType::ExecutionResumed, &resumed, json!({})).await;
                }
                Ok(resumed)
            }
            _ => Err(OrchestratorError::invalid_transition("resume", current)),
        }
    }

    /// Cancel in-flight agent calls; queued jobs stay queued.
    #[instrument(skip(self), err)]
    pub async fn stop(&self, id: ExecutionId, reason: Option<String>) -> Result<Execution> {
        let current = self.get(id).await?;
        if current.status.is_terminal() {
            return Err(OrchestratorError::invalid_transition("stop", current));
        }

        let stopped = self
            .deps
            .store
            .transition_execution(
                id,
                &[ExecutionStatus::Running, ExecutionStatus::Paused],
                ExecutionStatus::Stopped,
                reason.as_deref(),
            )
            .await?;
        let stopped = match stopped {
            Some(stopped) => stopped,
            None => return Err(OrchestratorError::invalid_transition("stop", self.get(id).await?)),
        };

        if let Some(control) = self.controls.read().await.get(&id) {
            control.cancel.cancel();
            control.control.send_modify(|c| c.signal = DispatchSignal::Stop);
        }

        self.emit_lifecycle(
            EventType::ExecutionStopped,
            &stopped,
            json!({
                "reason": stopped.stop_reason,
                "queued": stopped.counters.queued,
                "running": stopped.counters.running,
            }),
        )
        .await;
        info!(execution_id = %id, reason = ?stopped.stop_reason, "Execution stopped");
        Ok(stopped)
    }

    /// Change the concurrency limit. Takes effect on the next dispatch decision.
    #[instrument(skip(self), err)]
    pub async fn set_concurrency(&self, id: ExecutionId, concurrency: i32) -> Result<Execution> {
        Self::validate_concurrency(concurrency)?;
        let current = self.get(id).await?;
        if current.status.is_terminal() {
            return Err(OrchestratorError::invalid_transition("change concurrency of", current));
        }

        let updated = match self.deps.store.set_execution_concurrency(id, concurrency).await? {
            Some(updated) => updated,
            None => {
                return Err(OrchestratorError::invalid_transition(
                    "change concurrency of",
                    self.get(id).await?,
                ))
            }
        };

        if let Some(control) = self.controls.read().await.get(&id) {
            control
                .control
                .send_modify(|c| c.concurrency = concurrency.max(1) as usize);
        }
        self.emit_lifecycle(
            EventType::ExecutionConcurrencyChanged,
            &updated,
            json!({ "previous": current.concurrency, "concurrency": updated.concurrency }),
        )
        .await;
        Ok(updated)
    }

    /// Counters, progress, ETA and the running jobs.
    pub async fn stats(&self, id: ExecutionId, running_limit: usize) -> Result<ExecutionStats> {
        let execution = self.get(id).await?;
        let running = self
            .deps
            .store
            .list_jobs(
                &JobFilter::execution(id)
                    .with_status(JobStatus::Running)
                    .with_limit(running_limit),
            )
            .await?;
        let stall_threshold = chrono::Duration::from_std(self.deps.settings.stall_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        Ok(compute_stats(&execution, &running, Utc::now(), stall_threshold, running_limit))
    }

    /// Requeue jobs and wake the dispatchers that picked them up.
    pub async fn rerun_jobs(&self, ids: &[JobId]) -> Result<Vec<Job>> {
        let jobs = actions::rerun_jobs(&self.deps, ids).await?;
        let executions: BTreeSet<ExecutionId> = jobs.iter().filter_map(|j| j.execution_id).collect();
        for execution_id in executions {
            self.wake(execution_id).await;
        }
        Ok(jobs)
    }

    /// Nudge a dispatcher to re-check for queued work.
    pub async fn wake(&self, id: ExecutionId) {
        if let Some(control) = self.controls.read().await.get(&id) {
            control.wake.notify_one();
        }
    }

    /// Pick up executions a previous process left active.
    ///
    /// Jobs still marked running can no longer finish and are recorded as
    /// errors; the dispatcher then carries on with the queued remainder.
    pub async fn recover(&self) -> Result<usize> {
        let active = self.deps.store.list_active_executions().await?;
        for execution in &active {
            let interrupted = self
                .deps
                .store
                .fail_interrupted_jobs(
                    execution.id,
                    &JobCompletion::failed(INTERRUPTED_BY_RESTART, FailureCategory::Unknown.label(), 0),
                )
                .await?;
            for job in &interrupted {
                self.deps
                    .events
                    .emit(
                        NewEvent::new(EventType::JobFailed, job.batch_id)
                            .execution(execution.id)
                            .job(job.id)
                            .payload(json!({
                                "rowIndex": job.row_index,
                                "error": INTERRUPTED_BY_RESTART,
                                "retryCount": job.retry_count,
                            })),
                    )
                    .await;
            }

            let signal = match execution.status {
                ExecutionStatus::Paused => DispatchSignal::Pause,
                _ => DispatchSignal::Run,
            };
            self.spawn_dispatcher(execution, signal).await?;
            info!(
                execution_id = %execution.id,
                status = execution.status.as_str(),
                interrupted = interrupted.len(),
                "Execution recovered"
            );
        }
        Ok(active.len())
    }

    /// Wait for an execution's dispatcher to exit and drain its in-flight jobs.
    pub async fn wait_until_settled(&self, id: ExecutionId) {
        let task = self
            .controls
            .write()
            .await
            .get_mut(&id)
            .and_then(|control| control.task.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(execution_id = %id, error = %e, "Dispatcher task failed");
            }
        }
    }

    /// Whether a dispatcher is registered for the execution.
    pub async fn is_dispatching(&self, id: ExecutionId) -> bool {
        self.controls.read().await.contains_key(&id)
    }

    /// Number of live dispatchers in this process.
    pub async fn dispatcher_count(&self) -> usize {
        self.controls.read().await.len()
    }

    // ------------------------------------------------------------------------

    async fn transition(
        &self,
        id: ExecutionId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        reason: Option<&str>,
        action: &'static str,
    ) -> Result<Execution> {
        match self.deps.store.transition_execution(id, from, to, reason).await? {
            Some(execution) => Ok(execution),
            None => {
                // Lost a race; report the state that won.
                let current = self.get(id).await?;
                if current.status == to {
                    Ok(current)
                } else {
                    Err(OrchestratorError::invalid_transition(action, current))
                }
            }
        }
    }

    /// Update the dispatcher's signal. Returns false if none is registered.
    async fn signal(&self, id: ExecutionId, signal: DispatchSignal) -> bool {
        match self.controls.read().await.get(&id) {
            Some(control) => {
                control.control.send_modify(|c| c.signal = signal);
                true
            }
            None => false,
        }
    }

    async fn emit_lifecycle(&self, event_type: EventType, execution: &Execution, payload: serde_json::Value) {
        self.deps
            .events
            .emit(
                NewEvent::new(event_type, execution.batch_id)
                    .execution(execution.id)
                    .payload(payload),
            )
            .await;
    }

    async fn spawn_dispatcher(&self, execution: &Execution, signal: DispatchSignal) -> Result<()> {
        let batch = self
            .deps
            .store
            .find_batch(execution.batch_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("batch", execution.batch_id))?;

        // Held across the spawn so the task cannot deregister before it is registered.
        let mut controls = self.controls.write().await;
        if controls.contains_key(&execution.id) {
            warn!(execution_id = %execution.id, "Dispatcher already running");
            return Ok(());
        }

        let (control_tx, control_rx) =
            watch::channel(DispatchControl::new(signal, execution.concurrency));
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let dispatcher = Dispatcher::new(
            self.deps.clone(),
            execution.id,
            execution.batch_id,
            batch.columns,
            control_rx,
            wake.clone(),
            cancel.clone(),
        );

        let registry = self.controls.clone();
        let execution_id = execution.id;
        let task = tokio::spawn(async move {
            dispatcher.run().await;
            registry.write().await.remove(&execution_id);
        });

        controls.insert(
            execution.id,
            ExecutionControl {
                control: control_tx,
                cancel,
                wake,
                task: Some(task),
            },
        );
        Ok(())
    }
}
