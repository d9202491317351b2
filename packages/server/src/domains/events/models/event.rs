//! Event log entries.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::common::{BatchId, EventId, ExecutionId, JobId, ValidatedPage};

// ============================================================================
// Event types
// ============================================================================

/// Every kind of state change the orchestrator records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ExecutionStarted,
    ExecutionPaused,
    ExecutionResumed,
    ExecutionStopped,
    ExecutionCompleted,
    ExecutionConcurrencyChanged,
    JobStarted,
    JobProgress,
    JobRetrying,
    JobCompleted,
    JobFailed,
    JobRerun,
    MetricsSnapshotCreated,
}

impl EventType {
    pub const ALL: [EventType; 13] = [
        EventType::ExecutionStarted,
        EventType::ExecutionPaused,
        EventType::ExecutionResumed,
        EventType::ExecutionStopped,
        EventType::ExecutionCompleted,
        EventType::ExecutionConcurrencyChanged,
        EventType::JobStarted,
        EventType::JobProgress,
        EventType::JobRetrying,
        EventType::JobCompleted,
        EventType::JobFailed,
        EventType::JobRerun,
        EventType::MetricsSnapshotCreated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ExecutionStarted => "execution.started",
            EventType::ExecutionPaused => "execution.paused",
            EventType::ExecutionResumed => "execution.resumed",
            EventType::ExecutionStopped => "execution.stopped",
            EventType::ExecutionCompleted => "execution.completed",
            EventType::ExecutionConcurrencyChanged => "execution.concurrency_changed",
            EventType::JobStarted => "job.started",
            EventType::JobProgress => "job.progress",
            EventType::JobRetrying => "job.retrying",
            EventType::JobCompleted => "job.completed",
            EventType::JobFailed => "job.failed",
            EventType::JobRerun => "job.rerun",
            EventType::MetricsSnapshotCreated => "metrics.snapshot_created",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Event
// ============================================================================

/// An immutable entry in the ordered event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    /// Position in the log; strictly increasing in append order.
    pub sequence: i64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub execution_id: Option<ExecutionId>,
    pub batch_id: BatchId,
    pub job_id: Option<JobId>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "data")]
    pub payload: serde_json::Value,
}

/// An event before the log assigns it an id and sequence.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub batch_id: BatchId,
    pub execution_id: Option<ExecutionId>,
    pub job_id: Option<JobId>,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(event_type: EventType, batch_id: BatchId) -> Self {
        Self {
            event_type,
            batch_id,
            execution_id: None,
            job_id: None,
            payload: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn maybe_execution(mut self, execution_id: Option<ExecutionId>) -> Self {
        self.execution_id = execution_id;
        self
    }

    pub fn job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ============================================================================
// Queries
// ============================================================================

/// Which part of the log a reader cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub execution_id: Option<ExecutionId>,
    pub batch_id: Option<BatchId>,
    pub job_id: Option<JobId>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        self.execution_id
            .map_or(true, |id| event.execution_id == Some(id))
            && self.batch_id.map_or(true, |id| event.batch_id == id)
            && self.job_id.map_or(true, |id| event.job_id == Some(id))
    }
}

/// A filtered, paginated read of the log.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub filter: EventFilter,
    pub event_type: Option<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub page: ValidatedPage,
}

impl EventQuery {
    /// Filter conditions only; pagination is applied separately.
    pub fn matches(&self, event: &Event) -> bool {
        self.filter.matches(event)
            && self.event_type.map_or(true, |t| event.event_type == t)
            && self.since.map_or(true, |since| event.timestamp >= since)
            && self.until.map_or(true, |until| event.timestamp <= until)
    }

    pub fn after_cursor(&self, event: &Event) -> bool {
        self.page.after.map_or(true, |after| event.sequence > after)
    }
}

/// One page of log entries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<Event>,
    /// Matching entries ignoring pagination.
    pub total: i64,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}
