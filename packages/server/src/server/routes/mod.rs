pub mod batches;
pub mod events;
pub mod executions;
pub mod health;
pub mod jobs;
pub mod stream;

pub use health::health_handler;
