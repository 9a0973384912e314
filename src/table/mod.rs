// src/table/mod.rs
//! `Dataset`: the in-memory table every stage consumes and produces.
//!
//! A thin wrapper over an arrow `RecordBatch` that additionally refuses
//! duplicate column names and hands out typed, owned column values.

use arrow::{
    array::{Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt32Array},
    compute,
    datatypes::{DataType, Field, Schema},
    record_batch::{RecordBatch, RecordBatchOptions},
};
use std::{collections::HashSet, sync::Arc};

use crate::error::{PipelineError, Result};

/// Ordered, named, equal-length columns.
#[derive(Debug, Clone)]
pub struct Dataset {
    batch: RecordBatch,
}

impl Dataset {
    /// Build from `(name, array)` pairs. All fields are nullable.
    pub fn new(columns: Vec<(String, ArrayRef)>) -> Result<Self> {
        let num_rows = columns.first().map(|(_, a)| a.len()).unwrap_or(0);
        let mut seen = HashSet::with_capacity(columns.len());
        let mut fields = Vec::with_capacity(columns.len());
        let mut arrays = Vec::with_capacity(columns.len());

        for (name, arr) in columns {
            if !seen.insert(name.clone()) {
                return Err(PipelineError::schema(name, "duplicate column name"));
            }
            if arr.len() != num_rows {
                return Err(PipelineError::schema(
                    name,
                    format!("has {} rows, expected {}", arr.len(), num_rows),
                ));
            }
            fields.push(Field::new(&name, arr.data_type().clone(), true));
            arrays.push(arr);
        }

        let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
        let batch =
            RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), arrays, &options)?;
        Ok(Self { batch })
    }

    /// Wrap an existing batch, checking column names are unique.
    pub fn from_batch(batch: RecordBatch) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in batch.schema().fields() {
            if !seen.insert(field.name().clone()) {
                return Err(PipelineError::schema(field.name(), "duplicate column name"));
            }
        }
        Ok(Self { batch })
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn column_names(&self) -> Vec<String> {
        self.batch
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.batch.column_by_name(name).is_some()
    }

    /// `(name, array)` pairs in column order.
    pub fn columns(&self) -> Vec<(String, ArrayRef)> {
        self.column_names()
            .into_iter()
            .zip(self.batch.columns().iter().cloned())
            .collect()
    }

    pub fn column(&self, name: &str) -> Result<&ArrayRef> {
        self.batch
            .column_by_name(name)
            .ok_or_else(|| PipelineError::schema(name, "column not found"))
    }

    pub fn data_type(&self, name: &str) -> Result<DataType> {
        Ok(self.column(name)?.data_type().clone())
    }

    /// Float values; Int64 columns are widened.
    pub fn f64_values(&self, name: &str) -> Result<Vec<Option<f64>>> {
        let arr = self.column(name)?;
        if let Some(a) = arr.as_any().downcast_ref::<Float64Array>() {
            return Ok(a.iter().collect());
        }
        if let Some(a) = arr.as_any().downcast_ref::<Int64Array>() {
            return Ok(a.iter().map(|v| v.map(|x| x as f64)).collect());
        }
        Err(wrong_type(name, "Float64", arr.data_type()))
    }

    pub fn i64_values(&self, name: &str) -> Result<Vec<Option<i64>>> {
        let arr = self.column(name)?;
        arr.as_any()
            .downcast_ref::<Int64Array>()
            .map(|a| a.iter().collect())
            .ok_or_else(|| wrong_type(name, "Int64", arr.data_type()))
    }

    pub fn str_values(&self, name: &str) -> Result<Vec<Option<String>>> {
        let arr = self.column(name)?;
        arr.as_any()
            .downcast_ref::<StringArray>()
            .map(|a| a.iter().map(|v| v.map(str::to_string)).collect())
            .ok_or_else(|| wrong_type(name, "Utf8", arr.data_type()))
    }

    /// Append `name`, or replace it in place if it already exists.
    pub fn with_column(&self, name: &str, array: ArrayRef) -> Result<Self> {
        if array.len() != self.num_rows() {
            return Err(PipelineError::schema(
                name,
                format!("has {} rows, expected {}", array.len(), self.num_rows()),
            ));
        }
        let mut cols = self.columns();
        match cols.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = array,
            None => cols.push((name.to_string(), array)),
        }
        Self::new(cols)
    }

    /// Keep `names`, in the given order.
    pub fn select(&self, names: &[&str]) -> Result<Self> {
        let cols = names
            .iter()
            .map(|n| Ok((n.to_string(), self.column(n)?.clone())))
            .collect::<Result<Vec<_>>>()?;
        Self::new_sized(cols, self.num_rows())
    }

    /// Keep rows where `mask` is true.
    pub fn filter_rows(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.num_rows() {
            return Err(PipelineError::schema(
                "<mask>",
                format!("mask has {} rows, table has {}", mask.len(), self.num_rows()),
            ));
        }
        let predicate = BooleanArray::from(mask.to_vec());
        let batch = compute::filter_record_batch(&self.batch, &predicate)?;
        Ok(Self { batch })
    }

    /// Gather rows by index; a null index yields an all-null row.
    pub fn take_rows(&self, indices: &UInt32Array) -> Result<Self> {
        let cols = self
            .columns()
            .into_iter()
            .map(|(name, arr)| Ok((name, compute::take(arr.as_ref(), indices, None)?)))
            .collect::<Result<Vec<_>>>()?;
        Self::new_sized(cols, indices.len())
    }

    fn new_sized(columns: Vec<(String, ArrayRef)>, num_rows: usize) -> Result<Self> {
        if columns.is_empty() {
            let options = RecordBatchOptions::new().with_row_count(Some(num_rows));
            let batch = RecordBatch::try_new_with_options(
                Arc::new(Schema::empty()),
                Vec::new(),
                &options,
            )?;
            return Ok(Self { batch });
        }
        Self::new(columns)
    }
}

fn wrong_type(name: &str, expected: &str, actual: &DataType) -> PipelineError {
    PipelineError::schema(name, format!("expected {}, found {:?}", expected, actual))
}

pub fn float_column(values: Vec<Option<f64>>) -> ArrayRef {
    Arc::new(Float64Array::from(values))
}

pub fn int_column(values: Vec<Option<i64>>) -> ArrayRef {
    Arc::new(Int64Array::from(values))
}

pub fn str_column<S: AsRef<str>>(values: &[Option<S>]) -> ArrayRef {
    let arr: StringArray = values
        .iter()
        .map(|v| v.as_ref().map(|s| AsRef::<str>::as_ref(s)))
        .collect();
    Arc::new(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        Dataset::new(vec![
            ("fips".into(), int_column(vec![Some(1001), Some(1003), None])),
            ("rate".into(), float_column(vec![Some(1.5), None, Some(3.0)])),
            ("name".into(), str_column(&[Some("a"), Some("b"), None])),
        ])
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = Dataset::new(vec![
            ("x".into(), int_column(vec![Some(1)])),
            ("x".into(), int_column(vec![Some(2)])),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::Schema { ref column, .. } if column == "x"));
    }

    #[test]
    fn rejects_ragged_columns() {
        let err = Dataset::new(vec![
            ("x".into(), int_column(vec![Some(1), Some(2)])),
            ("y".into(), int_column(vec![Some(1)])),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::Schema { ref column, .. } if column == "y"));
    }

    #[test]
    fn typed_accessors() {
        let ds = sample();
        assert_eq!(ds.i64_values("fips").unwrap(), vec![Some(1001), Some(1003), None]);
        assert_eq!(ds.f64_values("fips").unwrap()[0], Some(1001.0));
        assert_eq!(ds.str_values("name").unwrap()[1].as_deref(), Some("b"));
        assert!(ds.str_values("rate").is_err());
        assert!(ds.column("missing").is_err());
    }

    #[test]
    fn with_column_replaces_in_place() {
        let ds = sample()
            .with_column("rate", float_column(vec![Some(0.0); 3]))
            .unwrap();
        assert_eq!(ds.column_names(), vec!["fips", "rate", "name"]);
        assert_eq!(ds.f64_values("rate").unwrap(), vec![Some(0.0); 3]);
    }

    #[test]
    fn filter_and_take() {
        let ds = sample();
        let kept = ds.filter_rows(&[true, false, true]).unwrap();
        assert_eq!(kept.num_rows(), 2);
        let taken = ds
            .take_rows(&UInt32Array::from(vec![Some(2), None]))
            .unwrap();
        assert_eq!(taken.f64_values("rate").unwrap(), vec![Some(3.0), None]);
    }
}
