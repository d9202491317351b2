//! Extraction jobs: one task per uploaded row.

pub mod actions;
pub mod models;
pub mod runner;

pub use runner::{JobOutcome, JobRunner, RetryPolicy};
