//! Scheduled background tasks using tokio-cron-scheduler.
//!
//! - Daily event retention cleanup
//! - Periodic accuracy refresh for batches with an active execution
//!
//! ```text
//! Scheduler (daily, 03:00)
//!     └─► EventPublisher::cleanup(now - retention)
//!
//! Scheduler (every 5 minutes)
//!     └─► MetricsAggregator::refresh_active()
//!             └─► batch.last_accuracy updated (no snapshot)
//! ```

use anyhow::Result;
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};

use super::ServerDeps;

/// Start all scheduled tasks
pub async fn start_scheduler(deps: ServerDeps) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    // Event retention - runs daily at 03:00
    let retention_deps = deps.clone();
    let retention_job = Job::new_async("0 0 3 * * *", move |_uuid, _lock| {
        let deps = retention_deps.clone();
        Box::pin(async move {
            if let Err(e) = run_event_retention(&deps).await {
                tracing::error!("Event retention task failed: {}", e);
            }
        })
    })?;

    scheduler.add(retention_job).await?;

    // Accuracy refresh - runs every 5 minutes
    let metrics_deps = deps.clone();
    let metrics_job = Job::new_async("0 */5 * * * *", move |_uuid, _lock| {
        let deps = metrics_deps.clone();
        Box::pin(async move {
            if let Err(e) = run_metrics_refresh(&deps).await {
                tracing::error!("Metrics refresh task failed: {}", e);
            }
        })
    })?;

    scheduler.add(metrics_job).await?;
    scheduler.start().await?;

    tracing::info!(
        "Scheduled tasks started (event retention daily, accuracy refresh every 5 minutes)"
    );
    Ok(scheduler)
}

/// Delete events older than the retention window.
///
/// Job, execution and batch rows are never touched.
pub async fn run_event_retention(deps: &ServerDeps) -> Result<u64> {
    let cutoff = Utc::now() - deps.settings.event_retention;
    tracing::info!(%cutoff, "Running event retention task");

    let deleted = deps.events.cleanup(cutoff).await?;

    tracing::info!("Event retention complete: removed {} events", deleted);
    Ok(deleted)
}

/// Recompute accuracy for batches that are currently executing.
pub async fn run_metrics_refresh(deps: &ServerDeps) -> Result<usize> {
    let refreshed = deps.metrics.refresh_active().await?;
    if refreshed > 0 {
        tracing::debug!("Accuracy refreshed for {} batches", refreshed);
    }
    Ok(refreshed)
}
