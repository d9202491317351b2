//! Batch model - a named collection of rows to process together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::column::ColumnDef;
use crate::common::BatchId;

/// A named collection of rows.
///
/// Immutable once its jobs exist, except for the accuracy fields which the
/// metrics aggregator refreshes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub total_rows: i32,
    pub columns: Vec<ColumnDef>,
    pub last_accuracy: Option<f64>,
    pub accuracy_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>, total_rows: i32) -> Self {
        Self {
            id: BatchId::new(),
            name: name.into(),
            total_rows,
            columns,
            last_accuracy: None,
            accuracy_updated_at: None,
            created_at: Utc::now(),
        }
    }

    /// Names of the columns flagged as ground truth, in schema order.
    pub fn ground_truth_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_ground_truth)
            .map(|c| c.name.clone())
            .collect()
    }
}
