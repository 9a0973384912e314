// src/error.rs

use arrow::error::ArrowError;
use thiserror::Error;

/// Every failure the core can surface. Variants carry the offending
/// column, key, row or iteration state so a run can abort with a clear message.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("schema error on column `{column}`: {reason}")]
    Schema { column: String, reason: String },

    #[error("cannot reconcile key `{key}`: {reason}")]
    Reconciliation { key: String, reason: String },

    #[error("join on `{column}` failed: {reason}")]
    Join { column: String, reason: String },

    #[error("ambiguous join on `{column}`: key `{key}` occurs {count} times on the {side} side")]
    Ambiguity {
        column: String,
        key: String,
        side: &'static str,
        count: usize,
    },

    #[error("column `{column}` row {row}: cannot parse `{value}` as {expected}")]
    TypeCoercion {
        column: String,
        row: usize,
        value: String,
        expected: &'static str,
    },

    #[error("cannot standardize `{column}`: {reason}")]
    Standardization { column: String, reason: String },

    #[error("outcome row {row} has invalid value {value} (must be finite and >= 0)")]
    InvalidResponse { row: usize, value: f64 },

    #[error("design matrix is rank deficient at column `{column}`")]
    SingularDesign { column: String },

    #[error("{stage} did not converge after {iterations} iterations (last deviance {last_deviance})")]
    Convergence {
        stage: &'static str,
        iterations: usize,
        last_deviance: f64,
    },

    #[error("unknown group `{0}`")]
    UnknownGroup(String),

    #[error(transparent)]
    Arrow(#[from] ArrowError),
}

impl PipelineError {
    /// Coarse category used in logs and the driver's exit message.
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Schema { .. } | PipelineError::Arrow(_) => "schema",
            PipelineError::Reconciliation { .. }
            | PipelineError::Join { .. }
            | PipelineError::Ambiguity { .. }
            | PipelineError::UnknownGroup(_) => "key",
            PipelineError::TypeCoercion { .. }
            | PipelineError::Standardization { .. }
            | PipelineError::InvalidResponse { .. } => "data-quality",
            PipelineError::SingularDesign { .. } | PipelineError::Convergence { .. } => "numerical",
        }
    }

    pub(crate) fn schema(column: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::Schema {
            column: column.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn reconciliation(key: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::Reconciliation {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_group_variants() {
        assert_eq!(PipelineError::schema("x", "missing").category(), "schema");
        assert_eq!(PipelineError::UnknownGroup("ZZ".into()).category(), "key");
        let err = PipelineError::Convergence {
            stage: "glm",
            iterations: 25,
            last_deviance: 1.5,
        };
        assert_eq!(err.category(), "numerical");
        assert!(err.to_string().contains("25 iterations"));
    }
}
