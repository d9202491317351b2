//! Kernel module - server infrastructure and dependencies.

pub mod deps;
pub mod http_agent;
pub mod scheduled_tasks;
pub mod stream_hub;
pub mod test_dependencies;
pub mod traits;

pub use deps::{RuntimeSettings, ServerDeps};
pub use http_agent::HttpAgent;
pub use scheduled_tasks::start_scheduler;
pub use stream_hub::StreamHub;
pub use test_dependencies::{MockAgent, MockReply, TestDependencies};
pub use traits::*;
