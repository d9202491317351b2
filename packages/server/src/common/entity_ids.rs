//! Typed ID definitions for all orchestrator entities.
//!
//! ```rust,ignore
//! use orchestrator_core::common::{BatchId, JobId};
//!
//! let batch_id = BatchId::new();
//! let job_id = JobId::new();
//!
//! // Compile error:
//! // let wrong: JobId = batch_id;
//! ```

pub use super::id::Id;

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker type for uploaded batches of rows.
pub struct Batch;

/// Marker type for a single row's extraction job.
pub struct ExtractionJob;

/// Marker type for a controlled run over a batch.
pub struct Execution;

/// Marker type for event log entries.
pub struct Event;

/// Marker type for accuracy snapshots.
pub struct MetricsSnapshot;

// ============================================================================
// Type aliases - the primary API
// ============================================================================

pub type BatchId = Id<Batch>;

pub type JobId = Id<ExtractionJob>;

pub type ExecutionId = Id<Execution>;

pub type EventId = Id<Event>;

pub type SnapshotId = Id<MetricsSnapshot>;
