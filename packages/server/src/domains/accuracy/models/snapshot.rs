//! Versioned accuracy snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::column_metric::ColumnMetric;
use crate::common::{BatchId, ExecutionId, SnapshotId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "snapshot_trigger", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Manual,
    ExecutionCompleted,
}

/// Immutable record of a batch's accuracy at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub id: SnapshotId,
    pub batch_id: BatchId,
    pub execution_id: Option<ExecutionId>,
    pub trigger: SnapshotTrigger,
    pub column_metrics: Vec<ColumnMetric>,
    pub overall_accuracy: Option<f64>,
    pub jobs_scored: i64,
    pub created_at: DateTime<Utc>,
}

/// Direction of change between the two newest snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnTrend {
    pub column: String,
    pub current: f64,
    pub previous: Option<f64>,
    pub delta: Option<f64>,
    pub trend: Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendReport {
    pub batch_id: BatchId,
    pub overall: Trend,
    pub overall_delta: Option<f64>,
    pub columns: Vec<ColumnTrend>,
    pub current_snapshot_id: Option<SnapshotId>,
    pub previous_snapshot_id: Option<SnapshotId>,
}
