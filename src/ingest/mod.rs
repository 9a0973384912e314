// src/ingest/mod.rs
//! CSV → `Dataset` for the driver. Every column arrives as `Utf8`; typing is
//! left to the sanitizer so sentinel handling lives in one place.

use anyhow::{Context, Result};
use arrow::array::{ArrayRef, BinaryBuilder};
use std::{fs::File, io::Read, path::Path, sync::Arc};
use tracing::info;

use crate::table::{str_column, Dataset};

#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    /// Column names from the header row, as the file spells them.
    pub headers: Vec<String>,
    /// Data rows, one string per field.
    pub rows: Vec<Vec<String>>,
    /// Where the table came from, for messages.
    pub source: String,
}

impl RawTable {
    pub fn from_reader<R: Read>(reader: R, source: &str) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr
            .headers()
            .with_context(|| format!("reading header of {}", source))?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();
        let mut rows = Vec::new();
        for (i, record) in rdr.records().enumerate() {
            let record = record.with_context(|| format!("{} row {}", source, i + 1))?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self {
            headers,
            rows,
            source: source.to_string(),
        })
    }

    pub fn read_csv(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
        let table = Self::from_reader(file, &path.display().to_string())?;
        info!(source = %table.source, rows = table.rows.len(), columns = table.headers.len(), "read csv");
        Ok(table)
    }

    /// All-`Utf8` Dataset; empty cells become null.
    pub fn into_dataset(self) -> crate::error::Result<Dataset> {
        let columns = self
            .headers
            .iter()
            .enumerate()
            .map(|(c, name)| {
                let cells: Vec<Option<&str>> = self
                    .rows
                    .iter()
                    .map(|row| row.get(c).map(String::as_str).filter(|s| !s.is_empty()))
                    .collect();
                (name.clone(), str_column(&cells))
            })
            .collect();
        Dataset::new(columns)
    }
}

/// Read a CSV file straight into a Dataset.
pub fn read_dataset(path: &Path) -> Result<Dataset> {
    let table = RawTable::read_csv(path)?;
    let source = table.source.clone();
    table
        .into_dataset()
        .with_context(|| format!("building dataset from {}", source))
}

/// Re-type a text column as opaque bytes, e.g. WKT or hex-encoded WKB
/// geometry read from CSV.
pub fn to_binary(ds: &Dataset, column: &str) -> crate::error::Result<Dataset> {
    let values = ds.str_values(column)?;
    let mut b = BinaryBuilder::new();
    for v in &values {
        match v {
            Some(s) => b.append_value(s.as_bytes()),
            None => b.append_null(),
        }
    }
    let arr: ArrayRef = Arc::new(b.finish());
    ds.with_column(column, arr)
}
