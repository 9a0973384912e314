// src/model/design.rs
//! Explicit design-matrix construction: an intercept column plus named
//! predictor columns, restricted to complete cases.

use ndarray::{Array1, Array2};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::table::Dataset;

pub const INTERCEPT: &str = "(Intercept)";

/// Row → group assignment for random-intercept models.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupIndex {
    pub column: String,
    /// Sorted distinct labels.
    pub names: Vec<String>,
    /// Position in `names` for each design row.
    pub assignment: Vec<usize>,
}

impl GroupIndex {
    pub fn from_labels(column: &str, labels: &[String]) -> Self {
        let mut positions: BTreeMap<&str, usize> = BTreeMap::new();
        for l in labels {
            positions.entry(l.as_str()).or_insert(0);
        }
        for (i, (_, pos)) in positions.iter_mut().enumerate() {
            *pos = i;
        }
        let names = positions.keys().map(|s| s.to_string()).collect();
        let assignment = labels.iter().map(|l| positions[l.as_str()]).collect();
        Self {
            column: column.to_string(),
            names,
            assignment,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Rows per group, in `names` order.
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.names.len()];
        for &g in &self.assignment {
            sizes[g] += 1;
        }
        sizes
    }
}

#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    /// Column names of `x`, intercept first.
    pub names: Vec<String>,
    /// Source row of each design row.
    pub rows: Vec<usize>,
    pub groups: Option<GroupIndex>,
}

impl DesignMatrix {
    /// `outcome ~ 1 + predictors`, dropping rows with any missing value.
    pub fn from_dataset(ds: &Dataset, outcome: &str, predictors: &[&str]) -> Result<Self> {
        Self::build(ds, outcome, predictors, None)
    }

    /// As `from_dataset`, plus a random-intercept grouping column.
    pub fn grouped(
        ds: &Dataset,
        outcome: &str,
        predictors: &[&str],
        group_col: &str,
    ) -> Result<Self> {
        Self::build(ds, outcome, predictors, Some(group_col))
    }

    /// Assemble from raw parts; `x` must already contain the intercept.
    pub fn from_parts(x: Array2<f64>, y: Array1<f64>, names: Vec<String>) -> Result<Self> {
        if x.nrows() != y.len() {
            return Err(PipelineError::schema(
                "<design>",
                format!("{} design rows but {} outcomes", x.nrows(), y.len()),
            ));
        }
        if x.ncols() != names.len() {
            return Err(PipelineError::schema(
                "<design>",
                format!("{} columns but {} names", x.ncols(), names.len()),
            ));
        }
        let rows = (0..y.len()).collect();
        Ok(Self {
            x,
            y,
            names,
            rows,
            groups: None,
        })
    }

    pub fn with_groups(mut self, groups: GroupIndex) -> Result<Self> {
        if groups.assignment.len() != self.n_obs() {
            return Err(PipelineError::schema(
                &groups.column,
                "group assignment length differs from design rows",
            ));
        }
        self.groups = Some(groups);
        Ok(self)
    }

    pub fn n_obs(&self) -> usize {
        self.y.len()
    }

    pub fn n_coef(&self) -> usize {
        self.x.ncols()
    }

    fn build(
        ds: &Dataset,
        outcome: &str,
        predictors: &[&str],
        group_col: Option<&str>,
    ) -> Result<Self> {
        let y_all = ds.f64_values(outcome)?;
        let preds = predictors
            .iter()
            .map(|p| ds.f64_values(p))
            .collect::<Result<Vec<_>>>()?;
        let labels_all = group_col.map(|g| ds.str_values(g)).transpose()?;

        let mut rows = Vec::with_capacity(ds.num_rows());
        let mut labels = Vec::new();
        for i in 0..ds.num_rows() {
            if y_all[i].is_none() || preds.iter().any(|p| p[i].is_none()) {
                continue;
            }
            if let Some(l) = &labels_all {
                match &l[i] {
                    Some(label) => labels.push(label.clone()),
                    None => continue,
                }
            }
            rows.push(i);
        }

        let dropped = ds.num_rows() - rows.len();
        info!(rows = rows.len(), dropped, outcome, "design matrix");
        if rows.is_empty() {
            return Err(PipelineError::schema(outcome, "no complete rows to fit"));
        }

        let p = predictors.len() + 1;
        let mut x = Array2::<f64>::ones((rows.len(), p));
        for (r, &i) in rows.iter().enumerate() {
            for (k, col) in preds.iter().enumerate() {
                // complete cases only
                x[[r, k + 1]] = col[i].unwrap_or_default();
            }
        }
        let y: Array1<f64> = rows.iter().map(|&i| y_all[i].unwrap_or_default()).collect();

        let mut names = Vec::with_capacity(p);
        names.push(INTERCEPT.to_string());
        names.extend(predictors.iter().map(|p| p.to_string()));

        let groups = group_col.map(|g| GroupIndex::from_labels(g, &labels));
        if let Some(g) = &groups {
            debug!(groups = g.len(), column = %g.column, "grouping");
        }

        Ok(Self {
            x,
            y,
            names,
            rows,
            groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{float_column, str_column};

    fn table() -> Dataset {
        Dataset::new(vec![
            ("y".into(), float_column(vec![Some(1.0), None, Some(3.0), Some(4.0)])),
            ("x".into(), float_column(vec![Some(0.5), Some(1.0), None, Some(2.0)])),
            ("g".into(), str_column(&[Some("b"), Some("a"), Some("a"), None])),
        ])
        .unwrap()
    }

    #[test]
    fn drops_incomplete_rows() {
        let d = DesignMatrix::from_dataset(&table(), "y", &["x"]).unwrap();
        assert_eq!(d.rows, vec![0, 3]);
        assert_eq!(d.names, vec![INTERCEPT, "x"]);
        assert_eq!(d.x[[1, 0]], 1.0);
        assert_eq!(d.x[[1, 1]], 2.0);
        assert_eq!(d.y.to_vec(), vec![1.0, 4.0]);
    }

    #[test]
    fn grouped_design_drops_missing_labels() {
        let d = DesignMatrix::grouped(&table(), "y", &[], "g").unwrap();
        assert_eq!(d.rows, vec![0, 2]);
        let g = d.groups.unwrap();
        assert_eq!(g.names, vec!["a", "b"]);
        assert_eq!(g.assignment, vec![1, 0]);
        assert_eq!(g.sizes(), vec![1, 1]);
    }

    #[test]
    fn unknown_predictor_is_schema_error() {
        assert!(DesignMatrix::from_dataset(&table(), "y", &["nope"]).is_err());
    }
}
