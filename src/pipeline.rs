// src/pipeline.rs
//! The county workflow: three raw sources in, one analytic table out, then
//! the GLM / GLMM fits on top of it.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::model::{
    effects::{group_effects, rate_ratio, GroupEffectRow, RateRatio},
    DesignMatrix, GlmFit, GlmSolver, GlmmControl, GlmmFit, GlmmSolver, IrlsControl,
};
use crate::process::{
    aggregate::{GroupAggregator, GroupSummaries, DEFAULT_MIN_GROUP_SIZE},
    join::{join, JoinOptions},
    keys::{CorrectionTable, KeyReconciler, StateConcordance, DEFAULT_SUFFIXES},
    sanitize::{coerce_columns, standardize, SentinelSet, Standardization},
};
use crate::schema::{normalize, ColumnMapping, NumericType, RenameSpec};
use crate::table::Dataset;

/// Canonical column names of the analytic table.
pub mod columns {
    pub const FIPS: &str = "fips";
    pub const POVERTY: &str = "poverty";
    pub const COUNTY: &str = "county";
    pub const MORTALITY: &str = "mortality";
    pub const STATE: &str = "state";
    pub const COUNTY_NAME: &str = "county_name";
    pub const OPIOID: &str = "opioid";
    pub const LABEL_KEY: &str = "label_key";
    pub const POVERTY_Z: &str = "poverty_z";
    pub const OPIOID_Z: &str = "opioid_z";
}

use columns::*;

/// Per-source rename/select specs into the canonical column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSpecs {
    pub poverty: RenameSpec,
    pub mortality: RenameSpec,
    pub opioid: RenameSpec,
}

impl Default for SourceSpecs {
    fn default() -> Self {
        let keep = |cols: &[&str]| RenameSpec::new(cols.iter().map(|c| ColumnMapping::keep(*c)).collect());
        Self {
            poverty: keep(&[FIPS, POVERTY]),
            mortality: keep(&[FIPS, COUNTY, MORTALITY]),
            opioid: keep(&[COUNTY_NAME, STATE, OPIOID]),
        }
    }
}

/// Fully materialized inputs for one run.
#[derive(Debug, Clone)]
pub struct PipelineInputs {
    pub poverty: Dataset,
    pub mortality: Dataset,
    pub opioid: Dataset,
    pub concordance: StateConcordance,
    pub corrections: CorrectionTable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageCount {
    pub stage: &'static str,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct AnalyticTable {
    pub data: Dataset,
    pub poverty_scale: Standardization,
    pub opioid_scale: Standardization,
    /// Row count after each stage, in run order.
    pub stages: Vec<StageCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelReport {
    pub glm: GlmFit,
    pub glmm: GlmmFit,
    pub group_summaries: GroupSummaries,
    pub group_effects: Vec<GroupEffectRow>,
    /// Per one-SD increase in each standardized predictor.
    pub rate_ratios: Vec<RateRatio>,
}

#[derive(Debug, Clone)]
pub struct CountyPipeline {
    pub specs: SourceSpecs,
    pub sentinels: SentinelSet,
    pub suffixes: Vec<String>,
    pub min_group_size: usize,
    pub glm: IrlsControl,
    pub glmm: GlmmControl,
}

impl Default for CountyPipeline {
    fn default() -> Self {
        Self {
            specs: SourceSpecs::default(),
            sentinels: SentinelSet::default(),
            suffixes: DEFAULT_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            min_group_size: DEFAULT_MIN_GROUP_SIZE,
            glm: IrlsControl::default(),
            glmm: GlmmControl::default(),
        }
    }
}

impl CountyPipeline {
    #[tracing::instrument(level = "info", skip_all)]
    pub fn run(&self, inputs: &PipelineInputs) -> Result<AnalyticTable> {
        let mut stages = Vec::new();
        let mut record = |stage: &'static str, ds: &Dataset| {
            info!(stage, rows = ds.num_rows(), "stage complete");
            stages.push(StageCount {
                stage,
                rows: ds.num_rows(),
            });
        };

        let (poverty, mortality, opioid) = self.normalize_sources(inputs)?;
        record("normalize", &mortality);

        let poverty = coerce_columns(
            &poverty,
            &[(FIPS, NumericType::Int64), (POVERTY, NumericType::Float64)],
            &self.sentinels,
        )?;
        let mortality = coerce_columns(
            &mortality,
            &[(FIPS, NumericType::Int64), (MORTALITY, NumericType::Float64)],
            &self.sentinels,
        )?;

        let by_fips = join(&poverty, &mortality, FIPS, &JoinOptions::inner())?;
        record("join_fips", &by_fips);

        let reconciler = KeyReconciler::new(&self.suffixes, inputs.corrections.clone());
        let keyed = self.attach_keys(&by_fips, &inputs.concordance, &reconciler)?;
        let opioid = reconciler
            .reconcile_parts(&opioid, COUNTY_NAME, STATE, LABEL_KEY)?
            .select(&[LABEL_KEY, OPIOID])?;

        let joined = join(&keyed, &opioid, LABEL_KEY, &JoinOptions::inner())?;
        let joined = coerce_columns(&joined, &[(OPIOID, NumericType::Float64)], &self.sentinels)?;
        record("join_label", &joined);

        let (data, poverty_scale) = standardize(&joined, POVERTY, POVERTY_Z)?;
        let (data, opioid_scale) = standardize(&data, OPIOID, OPIOID_Z)?;
        record("standardize", &data);

        Ok(AnalyticTable {
            data,
            poverty_scale,
            opioid_scale,
            stages,
        })
    }

    /// GLM and random-intercept GLMM of mortality on both standardized
    /// predictors, plus per-state summaries of mortality vs poverty.
    #[tracing::instrument(level = "info", skip_all, fields(rows = table.data.num_rows()))]
    pub fn fit_models(&self, table: &AnalyticTable) -> Result<ModelReport> {
        let predictors = [POVERTY_Z, OPIOID_Z];

        let design = DesignMatrix::from_dataset(&table.data, MORTALITY, &predictors)?;
        let glm = GlmSolver::new(self.glm).fit(&design)?;

        let grouped = DesignMatrix::grouped(&table.data, MORTALITY, &predictors, STATE)?;
        let glmm = GlmmSolver::new(self.glmm).fit(&grouped)?;

        let group_summaries =
            GroupAggregator::new(self.min_group_size).summarize(&table.data, STATE, MORTALITY, POVERTY)?;
        let rate_ratios = predictors
            .iter()
            .map(|p| rate_ratio(&glmm, p, 1.0))
            .collect::<Result<Vec<_>>>()?;

        Ok(ModelReport {
            group_effects: group_effects(&glmm)?,
            glm,
            glmm,
            group_summaries,
            rate_ratios,
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    fn normalize_sources(&self, inputs: &PipelineInputs) -> Result<(Dataset, Dataset, Dataset)> {
        Ok((
            normalize(&inputs.poverty, &self.specs.poverty)?,
            normalize(&inputs.mortality, &self.specs.mortality)?,
            normalize(&inputs.opioid, &self.specs.opioid)?,
        ))
    }

    /// Derive `state` from the county code and `label_key` from the label.
    #[tracing::instrument(level = "info", skip_all)]
    fn attach_keys(
        &self,
        ds: &Dataset,
        concordance: &StateConcordance,
        reconciler: &KeyReconciler,
    ) -> Result<Dataset> {
        let with_state = concordance.attach_state(ds, FIPS, STATE)?;
        reconciler.reconcile_labels(&with_state, COUNTY, LABEL_KEY)
    }
}
