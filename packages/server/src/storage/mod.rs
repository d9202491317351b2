//! Persistence for batches, jobs, executions, events and snapshots.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use traits::{
    BatchStore, BulkWrite, EventStore, ExecutionStore, JobFilter, JobStore, SnapshotStore, Store,
};
