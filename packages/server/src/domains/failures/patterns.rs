//! Aggregates failed jobs of a batch into a ranked failure-pattern report.

use std::collections::BTreeMap;

use serde::Serialize;

use super::classifier::{classify, FailureCategory};
use super::ended_by_orchestrator;
use crate::common::{BatchId, JobId};
use crate::domains::jobs::models::{Job, JobStatus};

/// How many representative failures each pattern carries.
const MAX_EXAMPLES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureExample {
    pub job_id: JobId,
    pub url: String,
    pub error_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailurePattern {
    pub category: FailureCategory,
    pub count: i64,
    pub percentage: f64,
    pub examples: Vec<FailureExample>,
    pub suggested_fix: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub batch_id: BatchId,
    pub total_failures: i64,
    pub patterns: Vec<FailurePattern>,
    pub summary: String,
}

fn category_of(job: &Job) -> FailureCategory {
    job.failure_category
        .as_deref()
        .and_then(FailureCategory::from_label)
        .unwrap_or_else(|| classify(job.error_message.as_deref().unwrap_or_default()).category)
}

/// Build the report from a batch's jobs. Jobs cancelled by a stop are not failures.
pub fn analyze_failures(batch_id: BatchId, jobs: &[Job]) -> FailureReport {
    let mut failed: Vec<&Job> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Error)
        .filter(|j| !ended_by_orchestrator(j))
        .collect();
    failed.sort_by_key(|j| j.row_index);

    let mut grouped: BTreeMap<FailureCategory, Vec<&Job>> = BTreeMap::new();
    for job in &failed {
        grouped.entry(category_of(job)).or_default().push(job);
    }

    let total = failed.len() as i64;
    let mut patterns: Vec<FailurePattern> = grouped
        .into_iter()
        .map(|(category, jobs)| FailurePattern {
            category,
            count: jobs.len() as i64,
            percentage: jobs.len() as f64 / total as f64 * 100.0,
            examples: jobs
                .iter()
                .take(MAX_EXAMPLES)
                .map(|j| FailureExample {
                    job_id: j.id,
                    url: j.url.clone(),
                    error_message: j.error_message.clone().unwrap_or_default(),
                })
                .collect(),
            suggested_fix: category.suggested_fix(),
        })
        .collect();
    // Stable sort keeps rule order among equal counts
    patterns.sort_by(|a, b| b.count.cmp(&a.count));

    let summary = match patterns.first() {
        None => "No failures recorded for this batch.".to_string(),
        Some(top) => format!(
            "{} is the most common failure: {} of {} failed jobs ({:.0}%). {}",
            top.category, top.count, total, top.percentage, top.suggested_fix
        ),
    };

    FailureReport {
        batch_id,
        total_failures: total,
        patterns,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed_job(batch_id: BatchId, row: i32, message: &str) -> Job {
        let mut job = Job::builder()
            .batch_id(batch_id)
            .row_index(row)
            .url(format!("https://site.test/{row}"))
            .goal("extract")
            .build();
        job.status = JobStatus::Error;
        job.error_message = Some(message.to_string());
        job
    }

    #[test]
    fn ranks_categories_by_count() {
        let batch_id = BatchId::new();
        let jobs = vec![
            failed_job(batch_id, 0, "Navigation timeout of 30000 ms exceeded"),
            failed_job(batch_id, 1, "403 Forbidden"),
            failed_job(batch_id, 2, "Request timed out"),
            failed_job(batch_id, 3, "timeout waiting for page"),
            failed_job(batch_id, 4, "timeout again"),
        ];

        let report = analyze_failures(batch_id, &jobs);
        assert_eq!(report.total_failures, 5);
        assert_eq!(report.patterns[0].category, FailureCategory::Timeout);
        assert_eq!(report.patterns[0].count, 4);
        assert_eq!(report.patterns[0].examples.len(), MAX_EXAMPLES);
        assert!((report.patterns[0].percentage - 80.0).abs() < 1e-9);
        assert_eq!(report.patterns[1].category, FailureCategory::AuthorizationError);
        assert!(report.summary.starts_with("Timeout"));
    }

    #[test]
    fn stored_category_takes_precedence() {
        let batch_id = BatchId::new();
        let mut job = failed_job(batch_id, 0, "weird");
        job.failure_category = Some("Rate Limited".to_string());

        let report = analyze_failures(batch_id, &[job]);
        assert_eq!(report.patterns[0].category, FailureCategory::RateLimited);
    }

    #[test]
    fn stopped_and_interrupted_jobs_are_not_failures() {
        use crate::domains::failures::{CANCELLED_BY_STOP, INTERRUPTED_BY_RESTART};

        let batch_id = BatchId::new();
        let jobs = vec![
            failed_job(batch_id, 0, CANCELLED_BY_STOP),
            failed_job(batch_id, 1, INTERRUPTED_BY_RESTART),
        ];

        let report = analyze_failures(batch_id, &jobs);
        assert_eq!(report.total_failures, 0);
        assert!(report.patterns.is_empty());
        assert_eq!(report.summary, "No failures recorded for this batch.");
    }
}
