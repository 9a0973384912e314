// src/process/aggregate.rs

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::{cmp::Ordering, collections::BTreeMap};
use tracing::{info, warn};

use crate::error::Result;
use crate::table::{float_column, int_column, str_column, Dataset};

pub const DEFAULT_MIN_GROUP_SIZE: usize = 5;

/// Per-group count and outcome/predictor correlation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group: String,
    pub count: usize,
    /// Rows where both outcome and predictor are present.
    pub complete_pairs: usize,
    pub correlation: Option<f64>,
    /// `count <= min_group_size`
    pub excluded: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupSummaries {
    groups: Vec<GroupSummary>,
}

impl GroupSummaries {
    /// All groups, sorted by name.
    pub fn all(&self) -> &[GroupSummary] {
        &self.groups
    }

    pub fn get(&self, group: &str) -> Option<&GroupSummary> {
        self.groups.iter().find(|g| g.group == group)
    }

    pub fn included(&self) -> impl Iterator<Item = &GroupSummary> {
        self.groups.iter().filter(|g| !g.excluded)
    }

    /// Included groups by ascending correlation; undefined correlations last.
    pub fn ordered(&self) -> Vec<&GroupSummary> {
        let mut out: Vec<&GroupSummary> = self.included().collect();
        out.sort_by(|a, b| match (a.correlation, b.correlation) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| a.group.cmp(&b.group)));
        out
    }

    pub fn to_dataset(&self) -> Result<Dataset> {
        let g = &self.groups;
        Dataset::new(vec![
            (
                "group".into(),
                str_column(&g.iter().map(|s| Some(s.group.as_str())).collect::<Vec<_>>()),
            ),
            (
                "count".into(),
                int_column(g.iter().map(|s| Some(s.count as i64)).collect()),
            ),
            (
                "complete_pairs".into(),
                int_column(g.iter().map(|s| Some(s.complete_pairs as i64)).collect()),
            ),
            (
                "correlation".into(),
                float_column(g.iter().map(|s| s.correlation).collect()),
            ),
            (
                "excluded".into(),
                int_column(g.iter().map(|s| Some(s.excluded as i64)).collect()),
            ),
        ])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GroupAggregator {
    pub min_group_size: usize,
}

impl Default for GroupAggregator {
    fn default() -> Self {
        Self {
            min_group_size: DEFAULT_MIN_GROUP_SIZE,
        }
    }
}

impl GroupAggregator {
    pub fn new(min_group_size: usize) -> Self {
        Self { min_group_size }
    }

    /// Summarize `outcome` vs `predictor` within each value of `group_col`.
    #[tracing::instrument(level = "info", skip(self, ds), fields(rows = ds.num_rows()))]
    pub fn summarize(
        &self,
        ds: &Dataset,
        group_col: &str,
        outcome: &str,
        predictor: &str,
    ) -> Result<GroupSummaries> {
        let groups = ds.str_values(group_col)?;
        let ys = ds.f64_values(outcome)?;
        let xs = ds.f64_values(predictor)?;

        let mut members: BTreeMap<String, Vec<(Option<f64>, Option<f64>)>> = BTreeMap::new();
        let mut unlabeled = 0usize;
        for ((g, y), x) in groups.into_iter().zip(ys).zip(xs) {
            match g {
                Some(g) => members.entry(g).or_default().push((x, y)),
                None => unlabeled += 1,
            }
        }
        if unlabeled > 0 {
            warn!(unlabeled, "rows without a group label skipped");
        }

        let min = self.min_group_size;
        let mut summaries: Vec<GroupSummary> = members
            .into_par_iter()
            .map(|(group, rows)| {
                let pairs: Vec<(f64, f64)> = rows
                    .iter()
                    .filter_map(|(x, y)| Some(((*x)?, (*y)?)))
                    .collect();
                GroupSummary {
                    count: rows.len(),
                    complete_pairs: pairs.len(),
                    correlation: pearson(&pairs),
                    excluded: rows.len() <= min,
                    group,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.group.cmp(&b.group));

        let excluded = summaries.iter().filter(|s| s.excluded).count();
        info!(groups = summaries.len(), excluded, "group summaries");
        Ok(GroupSummaries { groups: summaries })
    }
}

/// Pearson correlation; `None` with fewer than two pairs or zero variance.
pub fn pearson(pairs: &[(f64, f64)]) -> Option<f64> {
    if pairs.len() < 2 {
        return None;
    }
    let (xs, ys): (Vec<f64>, Vec<f64>) = pairs.iter().copied().unzip();
    let (sx, sy) = ((&xs).std_dev(), (&ys).std_dev());
    if !(sx > 0.0) || !(sy > 0.0) {
        return None;
    }
    Some((&xs).covariance(&ys) / (sx * sy))
}
