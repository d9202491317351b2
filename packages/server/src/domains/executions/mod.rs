//! Executions: controlled, concurrency-bounded runs over a batch's jobs.

pub mod controller;
pub mod manager;
pub mod models;
pub mod stats;

pub use manager::{ExecutionManager, LaunchRequest};
pub use stats::{ExecutionStats, DEFAULT_RUNNING_LIMIT};
