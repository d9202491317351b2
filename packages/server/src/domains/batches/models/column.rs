//! Column schema for uploaded batches.

use serde::{Deserialize, Serialize};

/// What kind of value a column holds.
///
/// The kind decides how the accuracy scorer normalizes values before comparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    #[default]
    Text,
    Number,
    Url,
}

/// One column of a batch's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    #[serde(default)]
    pub kind: ColumnKind,
    /// Whether rows carry an expected value for this column.
    #[serde(default)]
    pub is_ground_truth: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
            is_ground_truth: false,
        }
    }

    pub fn ground_truth(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            is_ground_truth: true,
            ..Self::new(name, kind)
        }
    }

    pub fn is_url(&self) -> bool {
        self.kind == ColumnKind::Url
    }
}

/// Look up a column's kind, defaulting to text for unknown fields.
pub fn kind_of(columns: &[ColumnDef], field: &str) -> ColumnKind {
    columns
        .iter()
        .find(|c| c.name == field)
        .map(|c| c.kind)
        .unwrap_or_default()
}
