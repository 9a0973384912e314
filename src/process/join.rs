// src/process/join.rs
//! Equality joins between two Datasets on a shared key column.

use arrow::array::{Array, ArrayRef, Int64Array, StringArray, UInt32Array};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::schema::is_key_type;
use crate::table::Dataset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    #[default]
    Inner,
    /// Every left row survives; right columns are missing where unmatched.
    Left,
}

/// Which side may repeat a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    #[default]
    OneToOne,
    ManyToOne,
    OneToMany,
}

impl Cardinality {
    fn left_is_one(self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::OneToMany)
    }

    fn right_is_one(self) -> bool {
        matches!(self, Cardinality::OneToOne | Cardinality::ManyToOne)
    }
}

/// What to do when a right-side column name already exists on the left.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collision {
    #[default]
    Error,
    Suffix(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOptions {
    #[serde(default)]
    pub kind: JoinKind,
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Fan a repeated "one"-side key out across all of its matches. A key
    /// repeated on both sides is still rejected.
    #[serde(default)]
    pub allow_duplicate_geometries: bool,
    #[serde(default)]
    pub collision: Collision,
}

impl JoinOptions {
    pub fn inner() -> Self {
        Self::default()
    }

    pub fn left() -> Self {
        Self {
            kind: JoinKind::Left,
            ..Self::default()
        }
    }

    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn allowing_duplicates(mut self) -> Self {
        self.allow_duplicate_geometries = true;
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.collision = Collision::Suffix(suffix.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyValue {
    Int(i64),
    Str(String),
}

impl std::fmt::Display for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Str(v) => write!(f, "{}", v),
        }
    }
}

fn key_values(ds: &Dataset, key: &str, side: &str) -> Result<Vec<Option<KeyValue>>> {
    let arr: &ArrayRef = ds.column(key).map_err(|_| PipelineError::Join {
        column: key.to_string(),
        reason: format!("key column missing on the {} side", side),
    })?;
    if let Some(a) = arr.as_any().downcast_ref::<Int64Array>() {
        return Ok(a.iter().map(|v| v.map(KeyValue::Int)).collect());
    }
    if let Some(a) = arr.as_any().downcast_ref::<StringArray>() {
        return Ok(a
            .iter()
            .map(|v| v.map(|s| KeyValue::Str(s.to_string())))
            .collect());
    }
    Err(PipelineError::Join {
        column: key.to_string(),
        reason: format!("unsupported key type {:?} on the {} side", arr.data_type(), side),
    })
}

/// First key that occurs more than once, with its count.
fn first_duplicate(keys: &[Option<KeyValue>]) -> Option<(KeyValue, usize)> {
    let mut counts: HashMap<&KeyValue, usize> = HashMap::new();
    for k in keys.iter().flatten() {
        *counts.entry(k).or_default() += 1;
    }
    keys.iter()
        .flatten()
        .find(|k| counts[k] > 1)
        .map(|k| (k.clone(), counts[k]))
}

/// First left key that also repeats on the right, with its total
/// occurrences across both sides.
fn first_shared_duplicate(
    lkeys: &[Option<KeyValue>],
    rkeys: &[Option<KeyValue>],
) -> Option<(KeyValue, usize)> {
    let count = |keys: &[Option<KeyValue>]| {
        let mut counts: HashMap<KeyValue, usize> = HashMap::new();
        for k in keys.iter().flatten() {
            *counts.entry(k.clone()).or_default() += 1;
        }
        counts
    };
    let (lc, rc) = (count(lkeys), count(rkeys));
    lkeys.iter().flatten().find_map(|k| match (lc[k], rc.get(k)) {
        (l, Some(&r)) if l > 1 && r > 1 => Some((k.clone(), l + r)),
        _ => None,
    })
}

/// Join `left` and `right` on `key`.
///
/// Output holds every left column followed by the right columns minus
/// the key. Matched rows come first in left order (each left row's matches
/// in right order); in left mode the unmatched left rows follow in their
/// original order. Null keys never match.
#[tracing::instrument(level = "info", skip(left, right, opts), fields(left = left.num_rows(), right = right.num_rows()))]
pub fn join(left: &Dataset, right: &Dataset, key: &str, opts: &JoinOptions) -> Result<Dataset> {
    let ldt = left.data_type(key).map_err(|_| PipelineError::Join {
        column: key.to_string(),
        reason: "key column missing on the left side".into(),
    })?;
    let rdt = right.data_type(key).map_err(|_| PipelineError::Join {
        column: key.to_string(),
        reason: "key column missing on the right side".into(),
    })?;
    if ldt != rdt || !is_key_type(&ldt) {
        return Err(PipelineError::Join {
            column: key.to_string(),
            reason: format!("key type mismatch: left {:?}, right {:?}", ldt, rdt),
        });
    }

    let lkeys = key_values(left, key, "left")?;
    let rkeys = key_values(right, key, "right")?;

    if opts.allow_duplicate_geometries {
        // fan-out is one-sided; a key repeated on both sides is many-to-many
        if let Some((dup, count)) = first_shared_duplicate(&lkeys, &rkeys) {
            warn!(column = key, key = %dup, count, "key repeats on both sides");
            return Err(PipelineError::Ambiguity {
                column: key.to_string(),
                key: dup.to_string(),
                side: "left and right",
                count,
            });
        }
    } else {
        let checks = [
            (opts.cardinality.left_is_one(), &lkeys, "left"),
            (opts.cardinality.right_is_one(), &rkeys, "right"),
        ];
        for (is_one, keys, side) in checks {
            if !is_one {
                continue;
            }
            if let Some((dup, count)) = first_duplicate(keys) {
                return Err(PipelineError::Ambiguity {
                    column: key.to_string(),
                    key: dup.to_string(),
                    side,
                    count,
                });
            }
        }
    }

    // right key → row indices, in right order
    let mut index: HashMap<&KeyValue, Vec<u32>> = HashMap::with_capacity(rkeys.len());
    for (j, k) in rkeys.iter().enumerate() {
        if let Some(k) = k {
            index.entry(k).or_default().push(j as u32);
        }
    }

    let mut left_idx: Vec<u32> = Vec::with_capacity(lkeys.len());
    let mut right_idx: Vec<Option<u32>> = Vec::with_capacity(lkeys.len());
    let mut unmatched: Vec<u32> = Vec::new();
    for (i, k) in lkeys.iter().enumerate() {
        match k.as_ref().and_then(|k| index.get(k)) {
            Some(matches) => {
                for &j in matches {
                    left_idx.push(i as u32);
                    right_idx.push(Some(j));
                }
            }
            None => unmatched.push(i as u32),
        }
    }
    let matched = left_idx.len();
    if opts.kind == JoinKind::Left {
        for i in &unmatched {
            left_idx.push(*i);
            right_idx.push(None);
        }
    }
    info!(matched, unmatched = unmatched.len(), kind = ?opts.kind, "join");

    let left_out = left.take_rows(&UInt32Array::from(left_idx))?;
    let right_out = right.take_rows(&UInt32Array::from(right_idx))?;

    let left_names = left.column_names();
    let mut columns = left_out.columns();
    for (name, arr) in right_out.columns() {
        if name == key {
            continue;
        }
        let out_name = if left_names.contains(&name) {
            match &opts.collision {
                Collision::Error => {
                    return Err(PipelineError::schema(
                        name,
                        "present on both sides of the join",
                    ))
                }
                Collision::Suffix(s) => {
                    debug!(column = %name, suffix = %s, "renaming colliding column");
                    format!("{}{}", name, s)
                }
            }
        } else {
            name
        };
        columns.push((out_name, arr));
    }

    Dataset::new(columns)
}
