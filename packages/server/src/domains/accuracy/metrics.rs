//! Full-fold accuracy metrics and snapshot trends.

use std::collections::BTreeSet;

use super::models::{AccuracyReport, ColumnMetric, ColumnTrend, MetricsSnapshot, Trend, TrendReport};
use super::scorer::{compare_field, MatchKind, PARTIAL_MATCH_WEIGHT};
use crate::common::{field_text, BatchId};
use crate::domains::batches::models::{kind_of, Batch};
use crate::domains::failures::ended_by_orchestrator;
use crate::domains::jobs::models::Job;

/// Accuracy moves of more than this many points count as a trend.
pub const TREND_DELTA: f64 = 2.0;

fn percentage(exact: i64, partial: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (exact as f64 + PARTIAL_MATCH_WEIGHT * partial as f64) / total as f64 * 100.0
}

/// Ground-truth column names: the schema's flagged columns, or the union of
/// the rows' expected fields when the schema flags none.
fn ground_truth_columns(batch: &Batch, jobs: &[&Job]) -> Vec<String> {
    let flagged = batch.ground_truth_columns();
    if !flagged.is_empty() {
        return flagged;
    }
    jobs.iter()
        .filter_map(|j| j.ground_truth.as_ref())
        .flat_map(|gt| gt.keys().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Recompute every column metric from scratch over the terminal jobs that
/// carry ground truth. Jobs cut short by a stop or a restart are skipped.
pub fn compute_accuracy(batch: &Batch, jobs: &[Job]) -> AccuracyReport {
    let scored: Vec<&Job> = jobs
        .iter()
        .filter(|j| j.status.is_terminal() && j.has_ground_truth())
        .filter(|j| !ended_by_orchestrator(j))
        .collect();
    let columns = ground_truth_columns(batch, &scored);

    let mut metrics: Vec<ColumnMetric> = columns.iter().map(ColumnMetric::empty).collect();
    for metric in metrics.iter_mut() {
        let kind = kind_of(&batch.columns, &metric.column);
        for job in &scored {
            let Some(expected) = job
                .ground_truth
                .as_ref()
                .and_then(|gt| gt.get(&metric.column))
                .and_then(field_text)
            else {
                continue;
            };
            let extracted = job
                .extracted_data
                .as_ref()
                .and_then(|data| data.get(&metric.column))
                .and_then(field_text);

            metric.total_fields += 1;
            match compare_field(&expected, extracted.as_deref(), kind).0 {
                MatchKind::Exact => metric.exact_matches += 1,
                MatchKind::Partial => metric.partial_matches += 1,
                MatchKind::Mismatch => metric.mismatches += 1,
                MatchKind::Missing => metric.missing_extractions += 1,
            }
        }
        metric.accuracy_percentage = percentage(
            metric.exact_matches,
            metric.partial_matches,
            metric.total_fields,
        );
    }

    let exact: i64 = metrics.iter().map(|m| m.exact_matches).sum();
    let partial: i64 = metrics.iter().map(|m| m.partial_matches).sum();
    let total: i64 = metrics.iter().map(|m| m.total_fields).sum();
    let overall_accuracy = (total > 0).then(|| percentage(exact, partial, total));

    AccuracyReport {
        column_metrics: metrics,
        overall_accuracy,
        jobs_scored: scored.len() as i64,
    }
}

pub fn trend_of(delta: f64) -> Trend {
    if delta > TREND_DELTA {
        Trend::Improving
    } else if delta < -TREND_DELTA {
        Trend::Declining
    } else {
        Trend::Stable
    }
}

/// Compare the two newest snapshots. `snapshots` must be newest first.
pub fn compute_trend(batch_id: BatchId, snapshots: &[MetricsSnapshot]) -> TrendReport {
    let current = snapshots.first();
    let previous = snapshots.get(1);

    let overall_delta = match (
        current.and_then(|s| s.overall_accuracy),
        previous.and_then(|s| s.overall_accuracy),
    ) {
        (Some(now), Some(before)) => Some(now - before),
        _ => None,
    };

    let columns = current
        .map(|snapshot| {
            snapshot
                .column_metrics
                .iter()
                .map(|metric| {
                    let before = previous.and_then(|p| {
                        p.column_metrics
                            .iter()
                            .find(|m| m.column == metric.column)
                            .map(|m| m.accuracy_percentage)
                    });
                    let delta = before.map(|b| metric.accuracy_percentage - b);
                    ColumnTrend {
                        column: metric.column.clone(),
                        current: metric.accuracy_percentage,
                        previous: before,
                        delta,
                        trend: delta.map(trend_of).unwrap_or(Trend::Stable),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    TrendReport {
        batch_id,
        overall: overall_delta.map(trend_of).unwrap_or(Trend::Stable),
        overall_delta,
        columns,
        current_snapshot_id: current.map(|s| s.id),
        previous_snapshot_id: previous.map(|s| s.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{FieldMap, SnapshotId};
    use crate::domains::accuracy::models::SnapshotTrigger;
    use crate::domains::batches::models::{ColumnDef, ColumnKind};
    use crate::domains::jobs::models::JobStatus;
    use chrono::Utc;
    use serde_json::json;

    fn job(batch: &Batch, status: JobStatus, expected: &str, extracted: Option<&str>) -> Job {
        let mut job = Job::builder()
            .batch_id(batch.id)
            .url("https://site.test")
            .goal("extract")
            .build();
        job.status = status;
        job.ground_truth = Some(FieldMap::from([("price".to_string(), json!(expected))]));
        job.extracted_data =
            extracted.map(|v| FieldMap::from([("price".to_string(), json!(v))]));
        job
    }

    fn snapshot(batch_id: BatchId, overall: f64, price: f64) -> MetricsSnapshot {
        let mut metric = ColumnMetric::empty("price");
        metric.accuracy_percentage = price;
        MetricsSnapshot {
            id: SnapshotId::new(),
            batch_id,
            execution_id: None,
            trigger: SnapshotTrigger::Manual,
            column_metrics: vec![metric],
            overall_accuracy: Some(overall),
            jobs_scored: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn folds_terminal_jobs_only() {
        let batch = Batch::new("b", vec![ColumnDef::ground_truth("price", ColumnKind::Text)], 4);
        let jobs = vec![
            job(&batch, JobStatus::Completed, "$20", Some("$20")),
            job(&batch, JobStatus::Completed, "$20.00", Some("$20")),
            job(&batch, JobStatus::Error, "$5", None),
            job(&batch, JobStatus::Queued, "$7", Some("$7")),
        ];

        let report = compute_accuracy(&batch, &jobs);
        assert_eq!(report.jobs_scored, 3);
        let price = &report.column_metrics[0];
        assert_eq!(price.total_fields, 3);
        assert_eq!(price.exact_matches, 1);
        assert_eq!(price.mismatches, 1);
        assert_eq!(price.missing_extractions, 1);
        let overall = report.overall_accuracy.unwrap();
        assert!((overall - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn stopped_and_interrupted_jobs_are_not_scored() {
        use crate::domains::failures::{CANCELLED_BY_STOP, INTERRUPTED_BY_RESTART};

        let batch = Batch::new("b", vec![ColumnDef::ground_truth("price", ColumnKind::Text)], 4);
        let mut cancelled = job(&batch, JobStatus::Error, "$5", None);
        cancelled.error_message = Some(CANCELLED_BY_STOP.to_string());
        let mut interrupted = job(&batch, JobStatus::Error, "$6", None);
        interrupted.error_message = Some(INTERRUPTED_BY_RESTART.to_string());
        let mut timed_out = job(&batch, JobStatus::Error, "$7", None);
        timed_out.error_message = Some("Connection timed out after 30000ms".to_string());
        let jobs = vec![
            job(&batch, JobStatus::Completed, "$20", Some("$20")),
            cancelled,
            interrupted,
            timed_out,
        ];

        let report = compute_accuracy(&batch, &jobs);
        assert_eq!(report.jobs_scored, 2);
        let price = &report.column_metrics[0];
        assert_eq!(price.total_fields, 2);
        assert_eq!(price.exact_matches, 1);
        assert_eq!(price.missing_extractions, 1);
        assert_eq!(report.overall_accuracy, Some(50.0));
    }

    #[test]
    fn falls_back_to_row_fields_when_schema_flags_none() {
        let batch = Batch::new("b", vec![], 1);
        let jobs = vec![job(&batch, JobStatus::Completed, "x", Some("x"))];
        let report = compute_accuracy(&batch, &jobs);
        assert_eq!(report.column_metrics[0].column, "price");
        assert_eq!(report.overall_accuracy, Some(100.0));
    }

    #[test]
    fn no_scored_jobs_has_no_overall() {
        let batch = Batch::new("b", vec![ColumnDef::ground_truth("price", ColumnKind::Text)], 0);
        let report = compute_accuracy(&batch, &[]);
        assert_eq!(report.overall_accuracy, None);
        assert_eq!(report.column_metrics[0].total_fields, 0);
    }

    #[test]
    fn trend_thresholds() {
        assert_eq!(trend_of(2.5), Trend::Improving);
        assert_eq!(trend_of(2.0), Trend::Stable);
        assert_eq!(trend_of(-2.0), Trend::Stable);
        assert_eq!(trend_of(-2.1), Trend::Declining);
    }

    #[test]
    fn trend_compares_two_newest() {
        let batch_id = BatchId::new();
        let snapshots = vec![snapshot(batch_id, 80.0, 70.0), snapshot(batch_id, 90.0, 71.0)];

        let report = compute_trend(batch_id, &snapshots);
        assert_eq!(report.overall, Trend::Declining);
        assert_eq!(report.columns[0].trend, Trend::Stable);
        assert_eq!(report.previous_snapshot_id, Some(snapshots[1].id));
    }

    #[test]
    fn single_snapshot_is_stable() {
        let batch_id = BatchId::new();
        let report = compute_trend(batch_id, &[snapshot(batch_id, 50.0, 50.0)]);
        assert_eq!(report.overall, Trend::Stable);
        assert_eq!(report.overall_delta, None);
    }
}
