// Main entry point for the orchestrator server

use std::sync::Arc;

use anyhow::{Context, Result};
use orchestrator_core::kernel::{start_scheduler, HttpAgent, ServerDeps};
use orchestrator_core::server::{build_app, AppState};
use orchestrator_core::storage::{MemoryStore, PostgresStore, Store};
use orchestrator_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orchestrator_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting batch extraction orchestrator");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    let store: Arc<dyn Store> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Database connected");

            let store = PostgresStore::new(pool);
            tracing::info!("Running database migrations...");
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Migrations complete");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store (state is lost on exit)");
            Arc::new(MemoryStore::new())
        }
    };

    let agent = HttpAgent::new(&config.agent_url, config.agent_timeout)
        .context("Failed to create agent client")?;
    tracing::info!(agent_url = %config.agent_url, "Agent client ready");

    let deps = ServerDeps::new(store, Arc::new(agent), config.runtime_settings());
    let state = AppState::new(deps.clone());

    // Resume executions a previous process left running or paused
    let recovered = state
        .executions
        .recover()
        .await
        .context("Failed to recover executions")?;
    if recovered > 0 {
        tracing::info!(recovered, "Recovered active executions");
    }

    let scheduler = start_scheduler(deps)
        .await
        .context("Failed to start scheduler")?;

    let app = build_app(state, &config.allowed_origins);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .await
        .context("Server error")?;

    drop(scheduler);
    Ok(())
}
