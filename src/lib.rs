pub mod config;
pub mod error;
pub mod geo;
pub mod ingest;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod process;
pub mod schema;
pub mod table;

pub use error::{PipelineError, Result};
pub use pipeline::{AnalyticTable, CountyPipeline, ModelReport, PipelineInputs};
pub use table::Dataset;
