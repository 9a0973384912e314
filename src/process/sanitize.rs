// src/process/sanitize.rs

use arrow::{
    array::{Array, ArrayRef, Float64Array, Int64Array, StringArray},
    datatypes::DataType,
};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::{collections::BTreeSet, str::FromStr, sync::Arc};
use tracing::{debug, info};

use super::utils::clean_str;
use crate::error::{PipelineError, Result};
use crate::schema::{map_to_arrow_type, NumericType};
use crate::table::{float_column, Dataset};

/// Exact (trimmed) strings that mean "no usable value".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SentinelSet {
    values: BTreeSet<String>,
}

impl Default for SentinelSet {
    fn default() -> Self {
        Self::new(["Unreliable"])
    }
}

impl SentinelSet {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(|s| s.into().trim().to_string()).collect(),
        }
    }

    pub fn contains(&self, cleaned: &str) -> bool {
        self.values.contains(cleaned)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }
}

/// Cleaned cell text, or `None` for null, empty or sentinel cells.
fn present(raw: Option<&str>, sentinels: &SentinelSet) -> Option<String> {
    let cleaned = clean_str(raw?);
    if cleaned.is_empty() || sentinels.contains(&cleaned) {
        return None;
    }
    Some(cleaned)
}

/// Parse every present cell of `sarr` as `T`. A cell that fails to parse,
/// or that `accept` rejects, is a hard error.
fn parse_cells<T: FromStr>(
    sarr: &StringArray,
    ty: NumericType,
    sentinels: &SentinelSet,
    column: &str,
    accept: fn(&T) -> bool,
) -> Result<Vec<Option<T>>> {
    sarr.iter()
        .enumerate()
        .map(|(row, raw)| {
            let Some(cleaned) = present(raw, sentinels) else {
                return Ok(None);
            };
            match cleaned.parse::<T>() {
                Ok(v) if accept(&v) => Ok(Some(v)),
                _ => Err(PipelineError::TypeCoercion {
                    column: column.to_string(),
                    row,
                    value: raw.unwrap_or_default().to_string(),
                    expected: ty.as_str(),
                }),
            }
        })
        .collect()
}

/// Replace `column` with its numeric parse. Sentinels and empty cells
/// become missing; any other unparseable cell is a hard error.
#[tracing::instrument(level = "info", skip(ds, sentinels), fields(rows = ds.num_rows()))]
pub fn coerce_numeric(
    ds: &Dataset,
    column: &str,
    ty: NumericType,
    sentinels: &SentinelSet,
) -> Result<Dataset> {
    let arr = ds.column(column)?;
    let target = map_to_arrow_type(ty);

    let out: ArrayRef = match arr.data_type() {
        DataType::Utf8 => {
            let sarr = arr
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| PipelineError::schema(column, "Utf8 column is not a StringArray"))?;
            let out: ArrayRef = match ty {
                NumericType::Float64 => {
                    let parsed = parse_cells::<f64>(sarr, ty, sentinels, column, |v| v.is_finite())?;
                    Arc::new(Float64Array::from(parsed))
                }
                NumericType::Int64 => {
                    let parsed = parse_cells::<i64>(sarr, ty, sentinels, column, |_| true)?;
                    Arc::new(Int64Array::from(parsed))
                }
            };
            info!(missing = out.null_count(), "coerced to {}", ty.as_str());
            out
        }
        dt if *dt == target => arr.clone(),
        DataType::Int64 if ty == NumericType::Float64 => {
            let iarr = arr
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| PipelineError::schema(column, "Int64 column is not an Int64Array"))?;
            debug!("widening Int64 to Float64");
            let widened: Float64Array = iarr.iter().map(|v| v.map(|x| x as f64)).collect();
            Arc::new(widened)
        }
        DataType::Float64 => {
            let farr = arr
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| PipelineError::schema(column, "Float64 column is not a Float64Array"))?;
            let mut values = Vec::with_capacity(farr.len());
            for (row, v) in farr.iter().enumerate() {
                match v {
                    Some(x) if x.fract() != 0.0 || !x.is_finite() => {
                        return Err(PipelineError::TypeCoercion {
                            column: column.to_string(),
                            row,
                            value: x.to_string(),
                            expected: ty.as_str(),
                        })
                    }
                    other => values.push(other.map(|x| x as i64)),
                }
            }
            Arc::new(Int64Array::from(values))
        }
        other => {
            return Err(PipelineError::schema(
                column,
                format!("cannot coerce {:?} to {}", other, ty.as_str()),
            ))
        }
    };

    ds.with_column(column, out)
}

/// Apply `coerce_numeric` to several columns in turn.
pub fn coerce_columns(
    ds: &Dataset,
    columns: &[(&str, NumericType)],
    sentinels: &SentinelSet,
) -> Result<Dataset> {
    columns
        .iter()
        .try_fold(ds.clone(), |acc, (col, ty)| coerce_numeric(&acc, col, *ty, sentinels))
}

/// Sample mean and standard deviation used for a z-score column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub mean: f64,
    pub sd: f64,
}

impl Standardization {
    /// Fit over the non-missing values; needs two or more and sd > 0.
    pub fn fit(values: &[Option<f64>], column: &str) -> Result<Self> {
        let present: Vec<f64> = values.iter().flatten().copied().collect();
        let n = present.len();
        if n < 2 {
            return Err(PipelineError::Standardization {
                column: column.to_string(),
                reason: format!("{} non-missing values, need at least 2", n),
            });
        }
        let mean = (&present).mean();
        let sd = (&present).std_dev();
        if !(sd > 0.0) || !sd.is_finite() {
            return Err(PipelineError::Standardization {
                column: column.to_string(),
                reason: "standard deviation is zero".into(),
            });
        }
        Ok(Self { mean, sd })
    }

    pub fn apply(&self, x: f64) -> f64 {
        (x - self.mean) / self.sd
    }

    /// Back to raw units.
    pub fn invert(&self, z: f64) -> f64 {
        z * self.sd + self.mean
    }
}

/// Write the z-score of `column` into `out_column`; missing stays missing.
#[tracing::instrument(level = "info", skip(ds))]
pub fn standardize(
    ds: &Dataset,
    column: &str,
    out_column: &str,
) -> Result<(Dataset, Standardization)> {
    let values = ds.f64_values(column)?;
    let st = Standardization::fit(&values, column)?;
    info!(mean = st.mean, sd = st.sd, "standardized");
    let z: Vec<Option<f64>> = values.iter().map(|v| v.map(|x| st.apply(x))).collect();
    Ok((ds.with_column(out_column, float_column(z))?, st))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{int_column, str_column};

    fn raw() -> Dataset {
        Dataset::new(vec![(
            "mortality".into(),
            str_column(&[Some("12.5"), Some("Unreliable"), Some(" 3 "), Some(""), None]),
        )])
        .unwrap()
    }

    #[test]
    fn sentinels_become_missing() {
        let out = coerce_numeric(&raw(), "mortality", NumericType::Float64, &SentinelSet::default())
            .unwrap();
        assert_eq!(
            out.f64_values("mortality").unwrap(),
            vec![Some(12.5), None, Some(3.0), None, None]
        );
    }

    #[test]
    fn unknown_text_is_hard_error() {
        let ds = Dataset::new(vec![("x".into(), str_column(&[Some("1.0"), Some("n/a")]))]).unwrap();
        let err = coerce_numeric(&ds, "x", NumericType::Float64, &SentinelSet::default()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TypeCoercion { row: 1, ref value, .. } if value == "n/a"
        ));

        let custom = SentinelSet::new(["n/a", "Suppressed"]);
        let out = coerce_numeric(&ds, "x", NumericType::Float64, &custom).unwrap();
        assert_eq!(out.f64_values("x").unwrap(), vec![Some(1.0), None]);
    }

    #[test]
    fn int_targets_and_widening() {
        let ds = Dataset::new(vec![
            ("fips".into(), str_column(&[Some("01001"), Some("1003")])),
            ("n".into(), int_column(vec![Some(4), None])),
        ])
        .unwrap();
        let out = coerce_columns(
            &ds,
            &[("fips", NumericType::Int64), ("n", NumericType::Float64)],
            &SentinelSet::default(),
        )
        .unwrap();
        assert_eq!(out.i64_values("fips").unwrap(), vec![Some(1001), Some(1003)]);
        assert_eq!(out.data_type("n").unwrap(), DataType::Float64);
        assert!(coerce_numeric(&ds, "fips", NumericType::Float64, &SentinelSet::default()).is_ok());
    }

    #[test]
    fn non_sentinel_values_keep_their_value() {
        let values = ["0", "-1.25", "1e3", "42"];
        let ds = Dataset::new(vec![(
            "x".into(),
            str_column(&values.iter().map(|v| Some(*v)).collect::<Vec<_>>()),
        )])
        .unwrap();
        let out = coerce_numeric(&ds, "x", NumericType::Float64, &SentinelSet::default()).unwrap();
        let parsed: Vec<f64> = out.f64_values("x").unwrap().into_iter().flatten().collect();
        let expected: Vec<f64> = values.iter().map(|v| v.parse().unwrap()).collect();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn large_integers_parse_exactly() {
        // 2^53 + 1 has no f64 representation
        let ds = Dataset::new(vec![(
            "id".into(),
            str_column(&[Some("9007199254740993"), Some("Unreliable"), Some("-9223372036854775808")]),
        )])
        .unwrap();
        let out = coerce_numeric(&ds, "id", NumericType::Int64, &SentinelSet::default()).unwrap();
        assert_eq!(
            out.i64_values("id").unwrap(),
            vec![Some(9_007_199_254_740_993), None, Some(i64::MIN)]
        );

        let ds = Dataset::new(vec![("id".into(), str_column(&[Some("12.5")]))]).unwrap();
        assert!(matches!(
            coerce_numeric(&ds, "id", NumericType::Int64, &SentinelSet::default()),
            Err(PipelineError::TypeCoercion { row: 0, .. })
        ));
    }

    #[test]
    fn standardize_uses_sample_sd() {
        let ds = Dataset::new(vec![(
            "x".into(),
            float_column(vec![Some(1.0), Some(2.0), None, Some(3.0)]),
        )])
        .unwrap();
        let (out, st) = standardize(&ds, "x", "x_z").unwrap();
        assert_eq!(st.mean, 2.0);
        assert!((st.sd - 1.0).abs() < 1e-12);
        assert_eq!(
            out.f64_values("x_z").unwrap(),
            vec![Some(-1.0), Some(0.0), None, Some(1.0)]
        );
        assert!((st.invert(1.0) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn constant_column_cannot_be_standardized() {
        let ds = Dataset::new(vec![("x".into(), float_column(vec![Some(5.0); 4]))]).unwrap();
        assert!(matches!(
            standardize(&ds, "x", "x_z"),
            Err(PipelineError::Standardization { .. })
        ));
    }
}
