//! Per-column accuracy figures.

use serde::{Deserialize, Serialize};

/// Accuracy counts for one ground-truth column, always produced by a full fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetric {
    pub column: String,
    pub exact_matches: i64,
    pub partial_matches: i64,
    pub mismatches: i64,
    pub missing_extractions: i64,
    pub total_fields: i64,
    pub accuracy_percentage: f64,
}

impl ColumnMetric {
    pub fn empty(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            exact_matches: 0,
            partial_matches: 0,
            mismatches: 0,
            missing_extractions: 0,
            total_fields: 0,
            accuracy_percentage: 0.0,
        }
    }
}

/// Column metrics plus the batch-wide figure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccuracyReport {
    pub column_metrics: Vec<ColumnMetric>,
    /// `None` when no field was scored.
    pub overall_accuracy: Option<f64>,
    pub jobs_scored: i64,
}
