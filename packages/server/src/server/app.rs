//! Application setup and server configuration.

use axum::{
    extract::Extension,
    http::{header::CONTENT_TYPE, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::domains::executions::ExecutionManager;
use crate::kernel::ServerDeps;
use crate::server::routes::{batches, events, executions, health_handler, jobs, stream};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub deps: ServerDeps,
    pub executions: ExecutionManager,
}

impl AppState {
    pub fn new(deps: ServerDeps) -> Self {
        Self {
            executions: ExecutionManager::new(deps.clone()),
            deps,
        }
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([CONTENT_TYPE]);

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    // No configured origins - allow any origin for development
    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    }
}

/// Build the Axum application router
pub fn build_app(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        // Executions
        .route(
            "/executions",
            post(executions::create_execution).get(executions::list_executions),
        )
        .route(
            "/executions/:id",
            get(executions::get_execution).patch(executions::update_execution),
        )
        .route("/executions/:id/pause", post(executions::pause_execution))
        .route("/executions/:id/resume", post(executions::resume_execution))
        .route("/executions/:id/stop", post(executions::stop_execution))
        .route("/executions/:id/stats", get(executions::execution_stats))
        // Event log
        .route(
            "/events",
            get(events::list_events).delete(events::delete_events),
        )
        .route("/events/stream", get(stream::stream_events))
        // Batches and ground truth
        .route("/batches", post(batches::create_batch))
        .route("/batches/:id", get(batches::get_batch))
        .route("/batches/:id/jobs", get(batches::list_jobs))
        .route(
            "/batches/:id/ground-truth/column-metrics",
            get(batches::column_metrics),
        )
        .route(
            "/batches/:id/ground-truth/snapshot",
            post(batches::create_snapshot),
        )
        .route(
            "/batches/:id/ground-truth/snapshots",
            get(batches::list_snapshots),
        )
        .route("/batches/:id/ground-truth/trend", get(batches::trend))
        .route("/batches/:id/failure-patterns", get(batches::failure_patterns))
        // Bulk job operations
        .route(
            "/jobs/bulk",
            post(jobs::bulk_rerun)
                .delete(jobs::bulk_delete)
                .patch(jobs::bulk_update),
        )
        // Health check
        .route("/health", get(health_handler))
        // Middleware layers (applied in reverse order - last added runs first)
        .layer(Extension(state))
        .layer(cors_layer(allowed_origins))
        .layer(TraceLayer::new_for_http())
}
