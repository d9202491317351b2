//! Batches domain actions - entry-point business logic

pub mod create_batch;

pub use create_batch::{create_batch, get_batch, list_batch_jobs, BatchRowInput, CreateBatchRequest};
