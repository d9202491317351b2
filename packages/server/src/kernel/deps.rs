//! Server dependencies for the orchestrator (using traits for testability)
//!
//! This module provides the central dependency container shared by the
//! execution controller, job runner and HTTP handlers. Storage and the agent
//! sit behind trait objects so tests can swap in the in-memory store and a
//! scripted agent.

use std::sync::Arc;
use std::time::Duration;

use crate::domains::accuracy::MetricsAggregator;
use crate::domains::events::EventPublisher;
use crate::domains::jobs::RetryPolicy;
use crate::kernel::BaseAgent;
use crate::storage::Store;

// =============================================================================
// RuntimeSettings
// =============================================================================

/// Tuning knobs for dispatch, retries and streaming.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Concurrency used when a launch request omits one.
    pub default_concurrency: i32,
    pub retry: RetryPolicy,
    /// Running jobs quiet for longer than this are reported as stalled.
    pub stall_threshold: Duration,
    /// Idle time after which a stream subscriber receives a heartbeat.
    pub heartbeat_interval: Duration,
    /// Events older than this are removed by the retention task.
    pub event_retention: chrono::Duration,
    /// Upper bound on how long a dispatcher sleeps without a wake-up.
    pub dispatch_poll_interval: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            default_concurrency: 5,
            retry: RetryPolicy::default(),
            stall_threshold: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
            event_retention: chrono::Duration::days(30),
            dispatch_poll_interval: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// ServerDeps
// =============================================================================

/// Server dependencies accessible to the domains (using traits for testability)
#[derive(Clone)]
pub struct ServerDeps {
    pub store: Arc<dyn Store>,
    /// Browser-automation agent that performs the extractions.
    pub agent: Arc<dyn BaseAgent>,
    /// Event log writer and live fan-out
    pub events: EventPublisher,
    pub metrics: MetricsAggregator,
    pub settings: RuntimeSettings,
}

impl ServerDeps {
    /// Create new ServerDeps, wiring the publisher and aggregator onto `store`
    pub fn new(store: Arc<dyn Store>, agent: Arc<dyn BaseAgent>, settings: RuntimeSettings) -> Self {
        let events = EventPublisher::new(store.clone(), settings.heartbeat_interval);
        let metrics = MetricsAggregator::new(store.clone(), events.clone());
        Self {
            store,
            agent,
            events,
            metrics,
            settings,
        }
    }
}
