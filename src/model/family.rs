// src/model/family.rs

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use crate::error::{PipelineError, Result};

/// Response distribution + link. Only Poisson/log is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    Poisson,
}

impl Family {
    pub fn name(&self) -> &'static str {
        match self {
            Family::Poisson => "poisson(log)",
        }
    }

    pub fn link(&self, mu: f64) -> f64 {
        match self {
            Family::Poisson => mu.ln(),
        }
    }

    /// Mean from the linear predictor, floored at machine epsilon.
    pub fn inverse_link(&self, eta: f64) -> f64 {
        match self {
            Family::Poisson => eta.exp().max(f64::EPSILON),
        }
    }

    /// dμ/dη
    pub fn mu_eta(&self, eta: f64) -> f64 {
        match self {
            Family::Poisson => eta.exp().max(f64::EPSILON),
        }
    }

    pub fn variance(&self, mu: f64) -> f64 {
        match self {
            Family::Poisson => mu,
        }
    }

    /// Starting mean for IRLS.
    pub fn initial_mu(&self, y: f64) -> f64 {
        match self {
            Family::Poisson => y + 0.1,
        }
    }

    pub fn validate(&self, y: &Array1<f64>) -> Result<()> {
        match self {
            Family::Poisson => match y.iter().position(|v| !v.is_finite() || *v < 0.0) {
                Some(row) => Err(PipelineError::InvalidResponse { row, value: y[row] }),
                None => Ok(()),
            },
        }
    }

    /// `2·[y·ln(y/μ) − (y − μ)]`, with `y·ln(y/μ) = 0` at `y = 0`.
    pub fn unit_deviance(&self, y: f64, mu: f64) -> f64 {
        match self {
            Family::Poisson => {
                let ylog = if y > 0.0 { y * (y / mu).ln() } else { 0.0 };
                2.0 * (ylog - (y - mu))
            }
        }
    }

    pub fn deviance(&self, y: &Array1<f64>, mu: &Array1<f64>) -> f64 {
        y.iter()
            .zip(mu.iter())
            .map(|(&y, &m)| self.unit_deviance(y, m))
            .sum()
    }

    /// Log-likelihood; non-integer outcomes use the gamma continuation.
    pub fn log_likelihood(&self, y: &Array1<f64>, mu: &Array1<f64>) -> f64 {
        match self {
            Family::Poisson => y
                .iter()
                .zip(mu.iter())
                .map(|(&y, &m)| {
                    let ylog = if y > 0.0 { y * m.ln() } else { 0.0 };
                    ylog - m - ln_gamma(y + 1.0)
                })
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn deviance_handles_zero_counts() {
        let f = Family::Poisson;
        assert_eq!(f.unit_deviance(0.0, 2.0), 4.0);
        assert!(f.unit_deviance(3.0, 3.0).abs() < 1e-15);
        let d = f.deviance(&array![0.0, 1.0], &array![1.0, 1.0]);
        assert!((d - 2.0).abs() < 1e-15);
    }

    #[test]
    fn log_likelihood_matches_pmf() {
        // P(Y = 2 | μ = 3) = e^-3 · 9 / 2
        let ll = Family::Poisson.log_likelihood(&array![2.0], &array![3.0]);
        let expected = (-3.0f64).exp() * 9.0 / 2.0;
        assert!((ll - expected.ln()).abs() < 1e-10);
    }

    #[test]
    fn rejects_negative_outcomes() {
        let err = Family::Poisson.validate(&array![1.0, -2.0]).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidResponse { row: 1, .. }));
    }
}
