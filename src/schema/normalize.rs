// src/schema/normalize.rs

use std::collections::HashSet;
use tracing::debug;

use super::types::RenameSpec;
use crate::error::{PipelineError, Result};
use crate::table::Dataset;

/// Rename and select columns per `spec`. Rows are untouched; columns not
/// named in `spec` are dropped.
#[tracing::instrument(level = "debug", skip_all, fields(columns = spec.columns.len()))]
pub fn normalize(raw: &Dataset, spec: &RenameSpec) -> Result<Dataset> {
    let mut targets = HashSet::with_capacity(spec.columns.len());
    let mut out = Vec::with_capacity(spec.columns.len());

    for mapping in &spec.columns {
        let arr = raw.column(&mapping.source).map_err(|_| {
            PipelineError::schema(
                &mapping.source,
                format!(
                    "source column absent (available: {})",
                    raw.column_names().join(", ")
                ),
            )
        })?;
        let target = mapping.target_name();
        if !targets.insert(target.to_string()) {
            return Err(PipelineError::schema(target, "mapped to more than once"));
        }
        debug!(source = %mapping.source, target, "map column");
        out.push((target.to_string(), arr.clone()));
    }

    Dataset::new(out)
}
