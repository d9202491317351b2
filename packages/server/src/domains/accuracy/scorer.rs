//! Field-by-field comparison of extracted values against ground truth.
//!
//! Pure and deterministic: the same inputs always produce the same score.

use serde::Serialize;

use crate::common::{field_text, FieldMap};
use crate::domains::batches::models::{kind_of, ColumnDef, ColumnKind};
use crate::domains::jobs::models::EvaluationResult;

/// Similarity above this (and below 1.0) counts as a partial match.
pub const PARTIAL_MATCH_THRESHOLD: f64 = 0.8;

/// Weight of a partial match in the accuracy figure.
pub const PARTIAL_MATCH_WEIGHT: f64 = 0.5;

/// Job accuracy at or above this percentage passes.
pub const PASS_THRESHOLD: f64 = 90.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Partial,
    Mismatch,
    /// The agent returned nothing for a field that has an expected value.
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldScore {
    pub field: String,
    pub expected: String,
    pub extracted: Option<String>,
    pub similarity: f64,
    pub kind: MatchKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobScore {
    pub fields: Vec<FieldScore>,
    /// `None` when the row has no expected values.
    pub accuracy: Option<f64>,
    pub verdict: EvaluationResult,
}

impl JobScore {
    pub fn count(&self, kind: MatchKind) -> usize {
        self.fields.iter().filter(|f| f.kind == kind).count()
    }
}

/// Trim, lowercase and collapse whitespace runs. URLs also lose one trailing `/`.
pub fn normalize(value: &str, kind: ColumnKind) -> String {
    let collapsed = value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    match kind {
        ColumnKind::Url => match collapsed.strip_suffix('/') {
            Some(stripped) => stripped.to_string(),
            None => collapsed,
        },
        ColumnKind::Text | ColumnKind::Number => collapsed,
    }
}

/// Edit distance over Unicode scalar values.
fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut costs: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut prev = costs[0];
        costs[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = costs[j + 1];
            let substitution = prev + usize::from(ca != cb);
            costs[j + 1] = substitution.min(costs[j] + 1).min(above + 1);
            prev = above;
        }
    }
    costs[b.len()]
}

/// `(max_len - distance) / max_len`, or 1.0 when both strings are empty.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    let distance = levenshtein(&a, &b);
    (max_len - distance) as f64 / max_len as f64
}

/// Compare one expected value with what the agent extracted.
pub fn compare_field(expected: &str, extracted: Option<&str>, kind: ColumnKind) -> (MatchKind, f64) {
    let Some(extracted) = extracted.filter(|v| !v.trim().is_empty()) else {
        return (MatchKind::Missing, 0.0);
    };

    let expected = normalize(expected, kind);
    let extracted = normalize(extracted, kind);
    if expected == extracted {
        return (MatchKind::Exact, 1.0);
    }

    let score = similarity(&expected, &extracted);
    let kind = if score >= 1.0 {
        MatchKind::Exact
    } else if score > PARTIAL_MATCH_THRESHOLD {
        MatchKind::Partial
    } else {
        MatchKind::Mismatch
    };
    (kind, score)
}

/// Score every expected field of a row.
///
/// Expected values that are null or blank are not ground truth and are skipped.
pub fn score_job(expected: &FieldMap, extracted: Option<&FieldMap>, columns: &[ColumnDef]) -> JobScore {
    let fields: Vec<FieldScore> = expected
        .iter()
        .filter_map(|(field, value)| {
            let expected = field_text(value)?;
            let extracted = extracted
                .and_then(|data| data.get(field))
                .and_then(field_text);
            let (kind, similarity) =
                compare_field(&expected, extracted.as_deref(), kind_of(columns, field));
            Some(FieldScore {
                field: field.clone(),
                expected,
                extracted,
                similarity,
                kind,
            })
        })
        .collect();

    if fields.is_empty() {
        return JobScore {
            fields,
            accuracy: None,
            verdict: EvaluationResult::Unset,
        };
    }

    let exact = fields.iter().filter(|f| f.kind == MatchKind::Exact).count() as f64;
    let partial = fields.iter().filter(|f| f.kind == MatchKind::Partial).count() as f64;
    let accuracy = (exact + PARTIAL_MATCH_WEIGHT * partial) / fields.len() as f64 * 100.0;
    let verdict = if accuracy >= PASS_THRESHOLD {
        EvaluationResult::Pass
    } else {
        EvaluationResult::Fail
    };

    JobScore {
        fields,
        accuracy: Some(accuracy),
        verdict,
    }
}
