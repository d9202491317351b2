//! Jobs domain actions - entry-point business logic

pub mod bulk;

pub use bulk::{delete_jobs, rerun_jobs, update_jobs};
