use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::executions::models::concurrency_in_range;
use crate::domains::jobs::RetryPolicy;
use crate::kernel::RuntimeSettings;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Absent means the in-memory store is used.
    pub database_url: Option<String>,
    pub port: u16,
    pub agent_url: String,
    pub agent_timeout: Duration,
    pub default_concurrency: i32,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub stall_threshold: Duration,
    pub heartbeat_interval: Duration,
    pub event_retention_days: i64,
    pub allowed_origins: Vec<String>,
}

/// Parse an optional variable, falling back to `default` when unset.
fn var_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let default_concurrency = var_or("DEFAULT_CONCURRENCY", 5)?;
        if !concurrency_in_range(default_concurrency) {
            anyhow::bail!("DEFAULT_CONCURRENCY must be between 1 and 20");
        }

        let retry_max_attempts = var_or("RETRY_MAX_ATTEMPTS", 3)?;
        if retry_max_attempts == 0 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            port: var_or("PORT", 8080)?,
            agent_url: env::var("AGENT_URL").context("AGENT_URL must be set")?,
            agent_timeout: Duration::from_secs(var_or("AGENT_TIMEOUT_SECS", 300)?),
            default_concurrency,
            retry_max_attempts,
            retry_base_delay: Duration::from_millis(var_or("RETRY_BASE_DELAY_MS", 1000)?),
            retry_max_delay: Duration::from_millis(var_or("RETRY_MAX_DELAY_MS", 30_000)?),
            stall_threshold: Duration::from_secs(var_or("STALL_THRESHOLD_SECS", 90)?),
            heartbeat_interval: Duration::from_secs(var_or("HEARTBEAT_INTERVAL_SECS", 30)?),
            event_retention_days: var_or("EVENT_RETENTION_DAYS", 30)?,
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Orchestrator tuning derived from this config.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            default_concurrency: self.default_concurrency,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: self.retry_base_delay,
                max_delay: self.retry_max_delay,
            },
            stall_threshold: self.stall_threshold,
            heartbeat_interval: self.heartbeat_interval,
            event_retention: chrono::Duration::days(self.event_retention_days),
            ..RuntimeSettings::default()
        }
    }
}
