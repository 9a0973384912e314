// src/output/mod.rs
//! Persist run results: Datasets as Snappy Parquet, models as JSON.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::{fs, fs::File, path::Path};
use tracing::info;

use crate::table::Dataset;

/// Write `ds` as a single-row-group Parquet file, creating parent dirs.
pub fn write_parquet(ds: &Dataset, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating output directory {:?}", dir))?;
    }
    let batch = ds.batch();
    let file = File::create(path).with_context(|| format!("creating parquet file {:?}", path))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))
        .context("creating Arrow writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    info!(path = %path.display(), rows = ds.num_rows(), "wrote parquet");
    Ok(())
}

#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    generated_at: DateTime<Utc>,
    version: &'static str,
    #[serde(flatten)]
    body: &'a T,
}

/// Pretty JSON of `body`, stamped with the generation time and crate version.
pub fn write_report<T: Serialize>(body: &T, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating output directory {:?}", dir))?;
    }
    let envelope = Envelope {
        generated_at: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        body,
    };
    let json = serde_json::to_string_pretty(&envelope).context("serializing report")?;
    fs::write(path, json).with_context(|| format!("writing report {:?}", path))?;
    info!(path = %path.display(), "wrote report");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{float_column, str_column};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    #[test]
    fn parquet_round_trip_keeps_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("analytic.parquet");
        let ds = Dataset::new(vec![
            ("state".into(), str_column(&[Some("AL"), None])),
            ("mortality".into(), float_column(vec![Some(12.5), None])),
        ])
        .unwrap();
        write_parquet(&ds, &path).unwrap();

        let file = File::open(&path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<_> = reader.collect::<std::result::Result<_, _>>().unwrap();
        let back = Dataset::from_batch(batches[0].clone()).unwrap();
        assert_eq!(back.num_rows(), 2);
        assert_eq!(back.f64_values("mortality").unwrap(), vec![Some(12.5), None]);
        assert_eq!(back.str_values("state").unwrap()[1], None);
    }

    #[derive(Serialize)]
    struct Body {
        tau2: f64,
    }

    #[test]
    fn report_is_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        write_report(&Body { tau2: 0.04 }, &path).unwrap();
        let v: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["tau2"], 0.04);
        assert!(v["generated_at"].as_str().is_some());
        assert_eq!(v["version"], env!("CARGO_PKG_VERSION"));
    }
}
