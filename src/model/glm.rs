// src/model/glm.rs
//! Poisson/log GLM fitted by iteratively reweighted least squares.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use tracing::{debug, info, warn};

use super::design::DesignMatrix;
use super::family::Family;
use super::linalg::{weighted_normal_equations, Cholesky};
use crate::error::{PipelineError, Result};

/// Stopping rule for IRLS loops.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrlsControl {
    /// Relative deviance change that counts as converged.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for IrlsControl {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 25,
        }
    }
}

impl IrlsControl {
    pub(crate) fn converged(&self, previous: f64, current: f64) -> bool {
        (current - previous).abs() / (current.abs() + 0.1) < self.tolerance
    }
}

/// One row of a coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub z_value: f64,
    /// Two-sided Wald p-value.
    pub p_value: f64,
}

impl Coefficient {
    pub fn new(name: &str, estimate: f64, std_error: f64) -> Self {
        let z_value = estimate / std_error;
        Self {
            name: name.to_string(),
            estimate,
            std_error,
            z_value,
            p_value: erfc(z_value.abs() / std::f64::consts::SQRT_2),
        }
    }
}

/// Read access shared by fitted GLMs and GLMMs.
pub trait FittedModel {
    fn coefficients(&self) -> &[Coefficient];

    fn coefficient(&self, name: &str) -> Option<&Coefficient> {
        self.coefficients().iter().find(|c| c.name == name)
    }

    fn estimates(&self) -> Vec<f64> {
        self.coefficients().iter().map(|c| c.estimate).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlmFit {
    pub family: Family,
    pub coefficients: Vec<Coefficient>,
    pub deviance: f64,
    pub null_deviance: f64,
    pub df_residual: usize,
    pub df_null: usize,
    pub aic: f64,
    pub iterations: usize,
    pub n_obs: usize,
    /// Fitted means, one per design row.
    #[serde(skip)]
    pub fitted: Vec<f64>,
}

impl FittedModel for GlmFit {
    fn coefficients(&self) -> &[Coefficient] {
        &self.coefficients
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GlmSolver {
    pub family: Family,
    pub control: IrlsControl,
}

impl GlmSolver {
    pub fn new(control: IrlsControl) -> Self {
        Self {
            family: Family::Poisson,
            control,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(n = design.n_obs(), p = design.n_coef()))]
    pub fn fit(&self, design: &DesignMatrix) -> Result<GlmFit> {
        let family = self.family;
        let (x, y) = (&design.x, &design.y);
        family.validate(y)?;
        if design.n_obs() < design.n_coef() {
            return Err(PipelineError::SingularDesign {
                column: design.names[design.n_obs().min(design.n_coef() - 1)].clone(),
            });
        }

        let mut eta: Array1<f64> = y.mapv(|v| family.link(family.initial_mu(v)));
        let mut mu: Array1<f64> = eta.mapv(|e| family.inverse_link(e));
        let mut dev = family.deviance(y, &mu);
        let mut beta = Array1::<f64>::zeros(design.n_coef());
        let mut converged_at = None;

        for iter in 1..=self.control.max_iterations {
            let (w, z) = working_response(family, &eta, &mu, y);
            let (xtwx, xtwz) = weighted_normal_equations(x, &w, &z);
            let chol = Cholesky::factor(&xtwx).map_err(|j| PipelineError::SingularDesign {
                column: design.names[j].clone(),
            })?;
            beta = chol.solve(&xtwz);
            eta = x.dot(&beta);
            mu = eta.mapv(|e| family.inverse_link(e));

            let new_dev = family.deviance(y, &mu);
            debug!(iter, deviance = new_dev, "irls step");
            if !new_dev.is_finite() {
                return Err(PipelineError::Convergence {
                    stage: "glm",
                    iterations: iter,
                    last_deviance: dev,
                });
            }
            let done = self.control.converged(dev, new_dev);
            dev = new_dev;
            if done {
                converged_at = Some(iter);
                break;
            }
        }

        let Some(iterations) = converged_at else {
            warn!(last_deviance = dev, "glm hit iteration cap");
            return Err(PipelineError::Convergence {
                stage: "glm",
                iterations: self.control.max_iterations,
                last_deviance: dev,
            });
        };

        // information matrix at the converged mean
        let (w, _) = working_response(family, &eta, &mu, y);
        let (info_mat, _) = weighted_normal_equations(x, &w, &Array1::zeros(y.len()));
        let cov = Cholesky::factor(&info_mat)
            .map_err(|j| PipelineError::SingularDesign {
                column: design.names[j].clone(),
            })?
            .inverse();

        let coefficients = design
            .names
            .iter()
            .enumerate()
            .map(|(k, name)| Coefficient::new(name, beta[k], cov[[k, k]].sqrt()))
            .collect();

        let n = design.n_obs();
        let p = design.n_coef();
        let null_deviance = null_deviance(family, y);
        let aic = -2.0 * family.log_likelihood(y, &mu) + 2.0 * p as f64;
        info!(iterations, deviance = dev, null_deviance, "glm converged");

        Ok(GlmFit {
            family,
            coefficients,
            deviance: dev,
            null_deviance,
            df_residual: n - p,
            df_null: n - 1,
            aic,
            iterations,
            n_obs: n,
            fitted: mu.to_vec(),
        })
    }
}

/// IRLS weights and working response at the current `eta`/`mu`.
pub(crate) fn working_response(
    family: Family,
    eta: &Array1<f64>,
    mu: &Array1<f64>,
    y: &Array1<f64>,
) -> (Array1<f64>, Array1<f64>) {
    let n = y.len();
    let mut w = Array1::<f64>::zeros(n);
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let d = family.mu_eta(eta[i]);
        w[i] = d * d / family.variance(mu[i]);
        z[i] = eta[i] + (y[i] - mu[i]) / d;
    }
    (w, z)
}

/// Deviance of the intercept-only model, whose MLE mean is ȳ.
pub fn null_deviance(family: Family, y: &Array1<f64>) -> f64 {
    let ybar = y.mean().unwrap_or(0.0);
    let mu = Array1::from_elem(y.len(), ybar);
    family.deviance(y, &mu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::design::INTERCEPT;
    use ndarray::Array2;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn design(xs: &[f64], ys: &[f64]) -> DesignMatrix {
        let mut x = Array2::<f64>::ones((xs.len(), 2));
        for (i, v) in xs.iter().enumerate() {
            x[[i, 1]] = *v;
        }
        DesignMatrix::from_parts(
            x,
            Array1::from(ys.to_vec()),
            vec![INTERCEPT.to_string(), "x".to_string()],
        )
        .unwrap()
    }

    /// Knuth's multiplication method; fine for the small means used here.
    fn poisson_draw(rng: &mut StdRng, mean: f64) -> f64 {
        let limit = (-mean).exp();
        let mut k = 0.0;
        let mut p = rng.gen::<f64>();
        while p > limit {
            k += 1.0;
            p *= rng.gen::<f64>();
        }
        k
    }

    #[test]
    fn recovers_noise_free_coefficients() {
        let xs: Vec<f64> = (0..40).map(|i| -2.0 + i as f64 * 0.1).collect();
        let ys: Vec<f64> = xs.iter().map(|x| (0.7 + 0.4 * x).exp()).collect();
        let fit = GlmSolver::default().fit(&design(&xs, &ys)).unwrap();
        assert!((fit.coefficients[0].estimate - 0.7).abs() < 1e-6);
        assert!((fit.coefficients[1].estimate - 0.4).abs() < 1e-6);
        assert!(fit.deviance < 1e-8);
        assert_eq!(fit.df_residual, 38);
        assert_eq!(fit.df_null, 39);
    }

    #[test]
    fn recovers_simulated_coefficients() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 5_000;
        let xs: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|x| poisson_draw(&mut rng, (1.0 + 0.5 * x).exp()))
            .collect();
        let fit = GlmSolver::default().fit(&design(&xs, &ys)).unwrap();
        let est = fit.estimates();
        assert!((est[0] - 1.0).abs() < 0.05, "intercept {}", est[0]);
        assert!((est[1] - 0.5).abs() < 0.05, "slope {}", est[1]);
        assert!(fit.deviance <= fit.null_deviance);
        assert!(fit.coefficients[1].p_value < 1e-6);
        assert!(fit.coefficients.iter().all(|c| c.std_error > 0.0));
    }

    #[test]
    fn residual_deviance_not_above_null() {
        let xs = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = [2.0, 0.0, 3.0, 1.0, 6.0, 4.0];
        let fit = GlmSolver::default().fit(&design(&xs, &ys)).unwrap();
        assert!(fit.deviance <= fit.null_deviance);
        assert!(fit.aic.is_finite());
    }

    #[test]
    fn collinear_predictor_is_singular() {
        let n = 6;
        let mut x = Array2::<f64>::ones((n, 3));
        for i in 0..n {
            x[[i, 1]] = i as f64;
            x[[i, 2]] = 2.0 * i as f64;
        }
        let d = DesignMatrix::from_parts(
            x,
            Array1::from(vec![1.0, 2.0, 2.0, 4.0, 5.0, 7.0]),
            vec![INTERCEPT.into(), "a".into(), "b".into()],
        )
        .unwrap();
        let err = GlmSolver::default().fit(&d).unwrap_err();
        assert!(matches!(err, PipelineError::SingularDesign { ref column } if column == "b"));
    }

    #[test]
    fn iteration_cap_is_an_error() {
        let xs = [0.0, 1.0, 2.0, 3.0];
        let ys = [1.0, 3.0, 2.0, 8.0];
        let solver = GlmSolver::new(IrlsControl {
            tolerance: 1e-8,
            max_iterations: 1,
        });
        let err = solver.fit(&design(&xs, &ys)).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Convergence { iterations: 1, last_deviance, .. } if last_deviance.is_finite()
        ));
    }

    #[test]
    fn coefficient_wald_statistics() {
        let c = Coefficient::new("x", 1.96, 1.0);
        assert!((c.p_value - 0.05).abs() < 1e-3);
    }
}
