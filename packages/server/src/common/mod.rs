// Common types and utilities shared across the application

pub mod entity_ids;
pub mod id;
pub mod pagination;
pub mod types;

pub use entity_ids::*;
pub use id::Id;
pub use pagination::{Cursor, PageRequest, ValidatedPage};
pub use types::*;
