//! Batches: uploaded tables of target rows.

pub mod actions;
pub mod models;
