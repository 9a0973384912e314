// src/model/effects.rs
//! Derived quantities from fitted models: per-group curves, contrasts and
//! rate ratios.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use super::design::INTERCEPT;
use super::glm::FittedModel;
use super::glmm::{GlmmFit, GroupEffect};
use crate::error::{PipelineError, Result};
use crate::table::{float_column, int_column, str_column, Dataset};

/// Coverage of the Wald intervals on rate ratios.
pub const INTERVAL_LEVEL: f64 = 0.95;

/// Two-sided standard normal critical value for `level` coverage.
fn critical_z(level: f64) -> f64 {
    Normal::standard().inverse_cdf(0.5 + level / 2.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEffectRow {
    pub group: String,
    pub n_obs: usize,
    pub offset: f64,
    pub std_error: f64,
    /// Population intercept plus the group offset.
    pub intercept: f64,
    /// `exp(intercept)`: expected outcome with predictors at zero.
    pub baseline: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRatio {
    pub predictor: String,
    pub delta: f64,
    pub ratio: f64,
    pub lower: f64,
    pub upper: f64,
}

fn estimate(model: &impl FittedModel, name: &str) -> Result<f64> {
    model
        .coefficient(name)
        .map(|c| c.estimate)
        .ok_or_else(|| PipelineError::schema(name, "not a coefficient of the fitted model"))
}

fn group<'a>(fit: &'a GlmmFit, name: &str) -> Result<&'a GroupEffect> {
    fit.group(name)
        .ok_or_else(|| PipelineError::UnknownGroup(name.to_string()))
}

/// `exp((β₀ + b_g) + β_k·v)` for each `v`, other predictors held at zero.
pub fn fitted_at(fit: &GlmmFit, group_name: &str, predictor: &str, values: &[f64]) -> Result<Vec<f64>> {
    let g = group(fit, group_name)?;
    let intercept = estimate(fit, INTERCEPT)? + g.offset;
    let slope = estimate(fit, predictor)?;
    Ok(values
        .iter()
        .map(|v| fit.family.inverse_link(intercept + slope * v))
        .collect())
}

/// Fitted values one SD below and above the mean of a standardized predictor.
pub fn low_high(fit: &GlmmFit, group_name: &str, predictor: &str) -> Result<(f64, f64)> {
    let v = fitted_at(fit, group_name, predictor, &[-1.0, 1.0])?;
    Ok((v[0], v[1]))
}

pub fn group_effects(fit: &GlmmFit) -> Result<Vec<GroupEffectRow>> {
    let beta0 = estimate(fit, INTERCEPT)?;
    Ok(fit
        .groups
        .iter()
        .map(|g| {
            let intercept = beta0 + g.offset;
            GroupEffectRow {
                group: g.group.clone(),
                n_obs: g.n_obs,
                offset: g.offset,
                std_error: g.std_error,
                intercept,
                baseline: fit.family.inverse_link(intercept),
            }
        })
        .collect())
}

/// Group effects as a Dataset, one row per group.
pub fn group_effects_table(fit: &GlmmFit) -> Result<Dataset> {
    let rows = group_effects(fit)?;
    let groups: Vec<Option<&str>> = rows.iter().map(|r| Some(r.group.as_str())).collect();
    let f = |get: fn(&GroupEffectRow) -> f64| float_column(rows.iter().map(|r| Some(get(r))).collect());
    Dataset::new(vec![
        (fit.group_column.clone(), str_column(&groups)),
        (
            "n_obs".into(),
            int_column(rows.iter().map(|r| Some(r.n_obs as i64)).collect()),
        ),
        ("offset".into(), f(|r| r.offset)),
        ("std_error".into(), f(|r| r.std_error)),
        ("intercept".into(), f(|r| r.intercept)),
        ("baseline".into(), f(|r| r.baseline)),
    ])
}

/// Multiplicative change in the expected outcome for a `delta` step in
/// `predictor`, with a 95% Wald interval.
pub fn rate_ratio(model: &impl FittedModel, predictor: &str, delta: f64) -> Result<RateRatio> {
    let c = model
        .coefficient(predictor)
        .ok_or_else(|| PipelineError::schema(predictor, "not a coefficient of the fitted model"))?;
    let half = critical_z(INTERVAL_LEVEL) * c.std_error * delta.abs();
    let center = c.estimate * delta;
    Ok(RateRatio {
        predictor: predictor.to_string(),
        delta,
        ratio: center.exp(),
        lower: (center - half).exp(),
        upper: (center + half).exp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::family::Family;
    use crate::model::glm::Coefficient;

    fn fit() -> GlmmFit {
        GlmmFit {
            family: Family::Poisson,
            group_column: "state".into(),
            coefficients: vec![
                Coefficient::new(INTERCEPT, 2.0, 0.1),
                Coefficient::new("poverty_z", 0.2, 0.05),
            ],
            tau2: 0.04,
            residual_variance: 1.0,
            groups: vec![
                GroupEffect {
                    group: "AL".into(),
                    n_obs: 60,
                    offset: 0.1,
                    std_error: 0.03,
                },
                GroupEffect {
                    group: "NV".into(),
                    n_obs: 12,
                    offset: -0.3,
                    std_error: 0.08,
                },
            ],
            deviance: 10.0,
            penalized_deviance: 12.0,
            outer_iterations: 4,
            inner_iterations: 20,
            singular: false,
            n_obs: 72,
            fitted: vec![],
        }
    }

    #[test]
    fn fitted_curve_uses_group_intercept() {
        let v = fitted_at(&fit(), "AL", "poverty_z", &[0.0, 1.0]).unwrap();
        assert!((v[0] - 2.1f64.exp()).abs() < 1e-12);
        assert!((v[1] - 2.3f64.exp()).abs() < 1e-12);
        let (lo, hi) = low_high(&fit(), "NV", "poverty_z").unwrap();
        assert!((lo - 1.5f64.exp()).abs() < 1e-12);
        assert!((hi - 1.9f64.exp()).abs() < 1e-12);
    }

    #[test]
    fn unknown_names_are_errors() {
        assert!(matches!(
            fitted_at(&fit(), "ZZ", "poverty_z", &[0.0]),
            Err(PipelineError::UnknownGroup(g)) if g == "ZZ"
        ));
        assert!(matches!(
            fitted_at(&fit(), "AL", "income", &[0.0]),
            Err(PipelineError::Schema { .. })
        ));
        assert!(rate_ratio(&fit(), "income", 1.0).is_err());
    }

    #[test]
    fn group_effect_rows() {
        let rows = group_effects(&fit()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!((rows[1].intercept - 1.7).abs() < 1e-12);
        assert!((rows[1].baseline - 1.7f64.exp()).abs() < 1e-12);
        let ds = group_effects_table(&fit()).unwrap();
        assert_eq!(ds.num_rows(), 2);
        assert_eq!(ds.str_values("state").unwrap()[0].as_deref(), Some("AL"));
        assert_eq!(ds.i64_values("n_obs").unwrap()[1], Some(12));
    }

    #[test]
    fn rate_ratio_interval_brackets_point() {
        let rr = rate_ratio(&fit(), "poverty_z", 1.0).unwrap();
        assert!((rr.ratio - 0.2f64.exp()).abs() < 1e-12);
        assert!(rr.lower < rr.ratio && rr.ratio < rr.upper);
        assert!((rr.upper.ln() - (0.2 + critical_z(INTERVAL_LEVEL) * 0.05)).abs() < 1e-12);
        assert!((rr.lower.ln() - (0.2 - 1.959_964 * 0.05)).abs() < 1e-7);
    }

    #[test]
    fn critical_values_match_normal_table() {
        assert!((critical_z(0.95) - 1.959_963_985).abs() < 1e-8);
        assert!((critical_z(0.90) - 1.644_853_627).abs() < 1e-8);
    }
}
