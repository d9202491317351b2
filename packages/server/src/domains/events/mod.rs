//! Event log domain: the ordered record of everything that happened.

pub mod models;
pub mod publisher;

pub use publisher::{EventPublisher, EventSubscription, StreamItem};
