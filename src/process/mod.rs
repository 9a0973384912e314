// src/process/mod.rs
//! Table-to-table stages: key reconciliation, joins, sanitizing and
//! per-group aggregation.

pub mod aggregate;
pub mod join;
pub mod keys;
pub mod sanitize;
pub mod utils;

pub use aggregate::{GroupAggregator, GroupSummaries, GroupSummary};
pub use join::{join, Cardinality, Collision, JoinKind, JoinOptions};
pub use keys::{CorrectionTable, KeyReconciler, StateConcordance};
pub use sanitize::{coerce_columns, coerce_numeric, standardize, SentinelSet, Standardization};
