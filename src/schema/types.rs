// src/schema/types.rs

use serde::{Deserialize, Serialize};

/// One `source → target` column mapping. `target` defaults to `source`,
/// so a bare entry simply retains the column.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Eq, Hash)]
pub struct ColumnMapping {
    pub source: String,
    #[serde(default)]
    pub target: Option<String>,
}

impl ColumnMapping {
    pub fn rename(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: Some(target.into()),
        }
    }

    pub fn keep(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: None,
        }
    }

    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

/// Rename/select specification; output columns follow `columns` order.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Default)]
pub struct RenameSpec {
    pub columns: Vec<ColumnMapping>,
}

impl RenameSpec {
    pub fn new(columns: Vec<ColumnMapping>) -> Self {
        Self { columns }
    }

    /// Convenience for the common all-rename case.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            columns: pairs
                .iter()
                .map(|(s, t)| ColumnMapping::rename(*s, *t))
                .collect(),
        }
    }
}

/// Numeric type a sanitized column is parsed into.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum NumericType {
    #[default]
    Float64,
    Int64,
}

impl NumericType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumericType::Float64 => "float64",
            NumericType::Int64 => "int64",
        }
    }
}
