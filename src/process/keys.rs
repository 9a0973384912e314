// src/process/keys.rs
//! Canonical join keys.
//!
//! Numeric county codes are already canonical. Free-text labels such as
//! `"Autauga County, AL"` become `"autauga, AL"`: administrative suffix
//! tokens are removed on word boundaries, whitespace is collapsed, the
//! name is lower-cased and the state abbreviation upper-cased. Known
//! spelling mismatches go through an explicit [`CorrectionTable`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::utils::{clean_str, collapse_whitespace};
use crate::error::{PipelineError, Result};
use crate::table::{str_column, Dataset};

pub const DEFAULT_SUFFIXES: &[&str] = &["county", "parish", "city"];

static LABEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>.+?)\s*,\s*(?P<state>[A-Za-z]{2})$").expect("static label regex")
});

/// Manually curated label corrections, `from → to`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrectionTable {
    entries: BTreeMap<String, String>,
}

impl CorrectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.entries.insert(from.into(), to.into());
        self
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.entries.get(label).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Load from two string columns of a Dataset. Rows with a null side are skipped.
    pub fn from_dataset(ds: &Dataset, from_col: &str, to_col: &str) -> Result<Self> {
        let mut table = Self::new();
        for (from, to) in ds.str_values(from_col)?.into_iter().zip(ds.str_values(to_col)?) {
            if let (Some(from), Some(to)) = (from, to) {
                table.insert(clean_str(&from), clean_str(&to));
            }
        }
        Ok(table)
    }
}

/// Numeric state code ↔ two-letter abbreviation.
#[derive(Debug, Clone, Default)]
pub struct StateConcordance {
    by_code: BTreeMap<i64, String>,
    by_abbr: BTreeMap<String, i64>,
}

impl StateConcordance {
    pub fn new<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (i64, S)>,
        S: AsRef<str>,
    {
        let mut out = Self::default();
        for (code, abbr) in pairs {
            let abbr = abbr.as_ref().trim().to_ascii_uppercase();
            out.by_abbr.insert(abbr.clone(), code);
            out.by_code.insert(code, abbr);
        }
        out
    }

    pub fn from_dataset(ds: &Dataset, code_col: &str, abbr_col: &str) -> Result<Self> {
        let pairs: Vec<(i64, String)> = ds
            .i64_values(code_col)?
            .into_iter()
            .zip(ds.str_values(abbr_col)?)
            .filter_map(|(c, a)| Some((c?, a?)))
            .collect();
        Ok(Self::new(pairs))
    }

    pub fn abbreviation(&self, code: i64) -> Result<&str> {
        self.by_code
            .get(&code)
            .map(String::as_str)
            .ok_or_else(|| PipelineError::reconciliation(code.to_string(), "unknown state code"))
    }

    pub fn code(&self, abbr: &str) -> Option<i64> {
        self.by_abbr.get(&abbr.trim().to_ascii_uppercase()).copied()
    }

    /// County FIPS codes carry the state code in their thousands.
    pub fn state_of_fips(&self, fips: i64) -> Result<&str> {
        self.abbreviation(fips / 1000)
    }

    /// Attach `out_col` with the state abbreviation of each `fips_col` value.
    #[tracing::instrument(level = "debug", skip(self, ds))]
    pub fn attach_state(&self, ds: &Dataset, fips_col: &str, out_col: &str) -> Result<Dataset> {
        let states = ds
            .i64_values(fips_col)?
            .into_iter()
            .map(|f| f.map(|f| self.state_of_fips(f)).transpose())
            .collect::<Result<Vec<Option<&str>>>>()?;
        ds.with_column(out_col, str_column(&states))
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

/// Maps raw labels onto the shared composite key space.
#[derive(Debug, Clone)]
pub struct KeyReconciler {
    suffix_re: Option<Regex>,
    corrections: CorrectionTable,
}

impl Default for KeyReconciler {
    fn default() -> Self {
        let suffixes: Vec<String> = DEFAULT_SUFFIXES.iter().map(|s| s.to_string()).collect();
        Self {
            suffix_re: build_suffix_regex(&suffixes),
            corrections: CorrectionTable::new(),
        }
    }
}

impl KeyReconciler {
    pub fn new(suffixes: &[String], corrections: CorrectionTable) -> Self {
        Self {
            suffix_re: build_suffix_regex(suffixes),
            corrections,
        }
    }

    /// Strip suffix tokens, collapse whitespace and lower-case.
    pub fn clean_name(&self, name: &str) -> String {
        let cleaned = clean_str(name);
        let stripped = match &self.suffix_re {
            Some(re) => re.replace_all(&cleaned, " ").into_owned(),
            None => cleaned,
        };
        collapse_whitespace(&stripped).to_lowercase()
    }

    /// `"<name>, <ST>"` from separate parts; no corrections applied.
    pub fn compose_key(&self, name: &str, state: &str) -> Result<String> {
        let state = clean_str(state);
        if state.len() != 2 || !state.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(PipelineError::reconciliation(
                format!("{}, {}", name, state),
                "state is not a two-letter abbreviation",
            ));
        }
        let cleaned = self.clean_name(name);
        if cleaned.is_empty() {
            return Err(PipelineError::reconciliation(
                name,
                "name is empty after removing suffixes",
            ));
        }
        Ok(format!("{}, {}", cleaned, state.to_ascii_uppercase()))
    }

    /// Canonical key of a `"<name>, <ST>"` label, corrections applied.
    pub fn normalize_label(&self, raw: &str) -> Result<String> {
        let label = clean_str(raw);
        if let Some(target) = self.corrections.get(&label) {
            debug!(raw = %label, target, "correction on raw label");
            return self.canonical(target);
        }
        let key = self.canonical(&label)?;
        match self.corrections.get(&key) {
            Some(target) => {
                debug!(key = %key, target, "correction on normalized key");
                self.canonical(target)
            }
            None => Ok(key),
        }
    }

    /// Canonical key of a `(name, state)` pair, corrections applied.
    ///
    /// The pair is first looked up as the raw `"<name>, <ST>"` label, before
    /// suffix stripping, so names that differ only in a suffix token
    /// (`Baltimore City` vs `Baltimore County`) can still be told apart.
    pub fn normalize_parts(&self, name: &str, state: &str) -> Result<String> {
        let raw = format!("{}, {}", clean_str(name), clean_str(state));
        if let Some(target) = self.corrections.get(&raw) {
            debug!(raw = %raw, target, "correction on raw parts");
            return self.canonical(target);
        }
        let key = self.compose_key(name, state)?;
        match self.corrections.get(&key) {
            Some(target) => {
                debug!(key = %key, target, "correction on normalized key");
                self.canonical(target)
            }
            None => Ok(key),
        }
    }

    fn canonical(&self, label: &str) -> Result<String> {
        let caps = LABEL_RE
            .captures(label)
            .ok_or_else(|| PipelineError::reconciliation(label, "no `, <ST>` state suffix"))?;
        self.compose_key(&caps["name"], &caps["state"])
    }

    /// Add `out_col` holding the canonical key of each label in `label_col`.
    #[tracing::instrument(level = "info", skip(self, ds), fields(rows = ds.num_rows()))]
    pub fn reconcile_labels(&self, ds: &Dataset, label_col: &str, out_col: &str) -> Result<Dataset> {
        let keys = ds
            .str_values(label_col)?
            .into_iter()
            .enumerate()
            .map(|(row, v)| match v {
                Some(v) => self.normalize_label(&v).map(Some),
                None => Err(PipelineError::reconciliation(
                    format!("{}[{}]", label_col, row),
                    "missing label",
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        info!(keys = keys.len(), "reconciled labels");
        ds.with_column(out_col, str_column(&keys))
    }

    /// Add `out_col` from separate name and state columns.
    #[tracing::instrument(level = "info", skip(self, ds), fields(rows = ds.num_rows()))]
    pub fn reconcile_parts(
        &self,
        ds: &Dataset,
        name_col: &str,
        state_col: &str,
        out_col: &str,
    ) -> Result<Dataset> {
        let names = ds.str_values(name_col)?;
        let states = ds.str_values(state_col)?;
        let keys = names
            .into_iter()
            .zip(states)
            .enumerate()
            .map(|(row, pair)| match pair {
                (Some(n), Some(s)) => self.normalize_parts(&n, &s).map(Some),
                _ => Err(PipelineError::reconciliation(
                    format!("{}/{}[{}]", name_col, state_col, row),
                    "missing name or state",
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        ds.with_column(out_col, str_column(&keys))
    }
}

/// Two-letter state abbreviation at the end of a label.
pub fn state_from_label(raw: &str) -> Result<String> {
    let label = clean_str(raw);
    LABEL_RE
        .captures(&label)
        .map(|c| c["state"].to_ascii_uppercase())
        .ok_or_else(|| PipelineError::reconciliation(label.as_str(), "no `, <ST>` state suffix"))
}

fn build_suffix_regex(suffixes: &[String]) -> Option<Regex> {
    let alternatives: Vec<String> = suffixes
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
    // escaped literals always compile
    Regex::new(&pattern).ok()
}
