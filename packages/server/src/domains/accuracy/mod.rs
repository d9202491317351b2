//! Ground-truth scoring and batch accuracy metrics.

pub mod aggregator;
pub mod metrics;
pub mod models;
pub mod scorer;

pub use aggregator::MetricsAggregator;
pub use scorer::{score_job, JobScore, MatchKind, PASS_THRESHOLD};
