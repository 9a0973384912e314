// src/config.rs
//! Run configuration, read from YAML. Every field has a default so a
//! config file only needs to name what differs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::model::{GlmmControl, IrlsControl};
use crate::pipeline::{CountyPipeline, SourceSpecs};
use crate::process::aggregate::DEFAULT_MIN_GROUP_SIZE;
use crate::process::keys::DEFAULT_SUFFIXES;
use crate::process::sanitize::SentinelSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPaths {
    pub poverty: PathBuf,
    pub mortality: PathBuf,
    pub opioid: PathBuf,
    /// State code ↔ abbreviation table.
    pub concordance: PathBuf,
    pub concordance_code_column: String,
    pub concordance_abbr_column: String,
    /// Optional label corrections with `from`/`to` columns.
    pub corrections: Option<PathBuf>,
    /// Optional geometry table: key column plus an opaque `geometry` column.
    pub geometries: Option<PathBuf>,
}

impl Default for InputPaths {
    fn default() -> Self {
        Self {
            poverty: PathBuf::from("data/poverty.csv"),
            mortality: PathBuf::from("data/mortality.csv"),
            opioid: PathBuf::from("data/opioid.csv"),
            concordance: PathBuf::from("data/states.csv"),
            concordance_code_column: "code".into(),
            concordance_abbr_column: "abbr".into(),
            corrections: None,
            geometries: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub inputs: InputPaths,
    pub output_dir: PathBuf,
    pub columns: SourceSpecs,
    pub sentinels: SentinelSet,
    /// Administrative suffix tokens stripped from county names.
    pub suffixes: Vec<String>,
    pub min_group_size: usize,
    pub glm: IrlsControl,
    pub glmm: GlmmControl,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inputs: InputPaths::default(),
            output_dir: PathBuf::from("out"),
            columns: SourceSpecs::default(),
            sentinels: SentinelSet::default(),
            suffixes: DEFAULT_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            min_group_size: DEFAULT_MIN_GROUP_SIZE,
            glm: IrlsControl::default(),
            glmm: GlmmControl::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
        Self::from_yaml(&text).with_context(|| format!("parsing config {:?}", path))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn pipeline(&self) -> CountyPipeline {
        CountyPipeline {
            specs: self.columns.clone(),
            sentinels: self.sentinels.clone(),
            suffixes: self.suffixes.clone(),
            min_group_size: self.min_group_size,
            glm: self.glm,
            glmm: self.glmm,
        }
    }
}
