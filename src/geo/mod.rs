// src/geo/mod.rs
//! Attach analytic attributes to geometry records and hand the result to
//! an external renderer.
//!
//! Geometries stay opaque (`Binary` column); this module only joins and
//! validates. A county drawn as several polygons appears as several
//! geometry rows with the same key, so the geometry side is the "many"
//! side of the join.

use arrow::datatypes::DataType;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PipelineError, Result};
use crate::process::join::{join, Cardinality, JoinOptions};
use crate::table::Dataset;

/// Left join with geometries on the left. Shards sharing a key each get
/// the analytic attributes; geometries without data keep null attributes.
pub fn join_geometries(geoms: &Dataset, analytic: &Dataset, key: &str) -> Result<Dataset> {
    let opts = JoinOptions::left().with_cardinality(Cardinality::ManyToOne);
    let out = join(geoms, analytic, key, &opts)?;
    info!(geometries = geoms.num_rows(), rows = out.num_rows(), "geometries joined");
    Ok(out)
}

/// As [`join_geometries`], then drop rows whose `outcome_column` is missing.
pub fn join_geometries_dropping_missing(
    geoms: &Dataset,
    analytic: &Dataset,
    key: &str,
    outcome_column: &str,
) -> Result<Dataset> {
    let joined = join_geometries(geoms, analytic, key)?;
    let mask: Vec<bool> = joined
        .f64_values(outcome_column)?
        .iter()
        .map(Option::is_some)
        .collect();
    let kept = joined.filter_rows(&mask)?;
    info!(
        dropped = joined.num_rows() - kept.num_rows(),
        column = outcome_column,
        "dropped geometries without outcome"
    );
    Ok(kept)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderSpec {
    /// Numeric column mapped onto the palette.
    pub fill_column: String,
    /// Color stops, low to high.
    pub palette: Vec<String>,
    /// Fill opacity in `[0, 1]`.
    pub opacity: f64,
}

impl RenderSpec {
    pub fn new(fill_column: impl Into<String>, palette: Vec<String>, opacity: f64) -> Self {
        Self {
            fill_column: fill_column.into(),
            palette,
            opacity,
        }
    }

    pub fn validate(&self, data: &Dataset) -> Result<()> {
        if !(0.0..=1.0).contains(&self.opacity) {
            return Err(PipelineError::schema(
                "opacity",
                format!("{} is outside [0, 1]", self.opacity),
            ));
        }
        if self.palette.is_empty() {
            return Err(PipelineError::schema("palette", "no colors given"));
        }
        match data.data_type(&self.fill_column)? {
            DataType::Float64 | DataType::Int64 => Ok(()),
            other => Err(PipelineError::schema(
                &self.fill_column,
                format!("fill column must be numeric, found {:?}", other),
            )),
        }
    }
}

/// Implemented by whatever draws the map.
pub trait RenderSink {
    fn render(&mut self, data: &Dataset, spec: &RenderSpec) -> Result<()>;
}

/// Validate `spec` against `data`, then hand both to `sink`.
pub fn render_with<S: RenderSink + ?Sized>(sink: &mut S, data: &Dataset, spec: &RenderSpec) -> Result<()> {
    spec.validate(data)?;
    sink.render(data, spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{float_column, int_column};
    use arrow::array::{ArrayRef, BinaryArray};
    use std::sync::Arc;

    fn geoms() -> Dataset {
        let shapes: ArrayRef = Arc::new(BinaryArray::from_vec(vec![&b"p1"[..], &b"p2"[..], &b"p3"[..], &b"p4"[..]]));
        Dataset::new(vec![
            ("fips".into(), int_column(vec![Some(1001), Some(1001), Some(1003), Some(2013)])),
            ("geometry".into(), shapes),
        ])
        .unwrap()
    }

    fn analytic() -> Dataset {
        Dataset::new(vec![
            ("fips".into(), int_column(vec![Some(1001), Some(1003)])),
            ("mortality".into(), float_column(vec![Some(12.5), None])),
        ])
        .unwrap()
    }

    #[test]
    fn shards_all_receive_attributes() {
        let out = join_geometries(&geoms(), &analytic(), "fips").unwrap();
        assert_eq!(out.num_rows(), 4);
        assert_eq!(
            out.f64_values("mortality").unwrap(),
            vec![Some(12.5), Some(12.5), None, None]
        );
        assert_eq!(out.i64_values("fips").unwrap()[3], Some(2013));
    }

    #[test]
    fn dropping_variant_removes_missing_outcomes() {
        let out = join_geometries_dropping_missing(&geoms(), &analytic(), "fips", "mortality").unwrap();
        assert_eq!(out.num_rows(), 2);
        assert_eq!(out.i64_values("fips").unwrap(), vec![Some(1001), Some(1001)]);
    }

    struct Recorder(Vec<usize>);

    impl RenderSink for Recorder {
        fn render(&mut self, data: &Dataset, _spec: &RenderSpec) -> Result<()> {
            self.0.push(data.num_rows());
            Ok(())
        }
    }

    #[test]
    fn render_validates_before_handing_off() {
        let data = join_geometries(&geoms(), &analytic(), "fips").unwrap();
        let mut sink = Recorder(vec![]);
        let palette = vec!["#fee5d9".to_string(), "#a50f15".to_string()];

        render_with(&mut sink, &data, &RenderSpec::new("mortality", palette.clone(), 0.8)).unwrap();
        assert_eq!(sink.0, vec![4]);

        assert!(render_with(&mut sink, &data, &RenderSpec::new("mortality", palette.clone(), 1.5)).is_err());
        assert!(render_with(&mut sink, &data, &RenderSpec::new("missing", palette.clone(), 0.5)).is_err());
        assert!(render_with(&mut sink, &data, &RenderSpec::new("geometry", palette, 0.5)).is_err());
        assert_eq!(sink.0.len(), 1);
    }
}
