// Batch Extraction Orchestrator - Core
//
// Runs uploaded rows through an external browser-automation agent as
// controlled, concurrency-bounded executions, scoring results against ground
// truth and classifying failures.
//
// Domain logic lives in domains/*; infrastructure in kernel/ and storage/.

pub mod common;
pub mod config;
pub mod domains;
pub mod error;
pub mod kernel;
pub mod server;
pub mod storage;

pub use config::*;
pub use error::{OrchestratorError, Result};
