// Business domains
pub mod accuracy;
pub mod batches;
pub mod events;
pub mod executions;
pub mod failures;
pub mod jobs;
