// src/model/glmm.rs
//! Poisson/log GLMM with one random intercept per group, fitted by
//! penalized quasi-likelihood.
//!
//! Group intercepts `b` are extra coefficients carrying a ridge penalty
//! `Σ b²/τ²` (a N(0, τ²) prior). For fixed τ² the penalized IRLS inner loop
//! solves the augmented normal equations
//!
//! ```text
//! [ XᵀWX   XᵀWZ        ] [β]   [XᵀWz]
//! [ ZᵀWX   ZᵀWZ + I/τ² ] [b] = [ZᵀWz]
//! ```
//!
//! and the outer loop re-estimates τ² from the fitted intercepts and their
//! conditional variances until it settles. Groups with little information
//! have small `ZᵀWZ` entries relative to `1/τ²`, so their intercepts are
//! pulled harder toward zero.

use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::design::{DesignMatrix, GroupIndex};
use super::family::Family;
use super::glm::{working_response, Coefficient, FittedModel, GlmSolver, IrlsControl};
use super::linalg::Cholesky;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlmmControl {
    pub inner: IrlsControl,
    /// Relative change in τ² that counts as converged.
    pub outer_tolerance: f64,
    pub max_outer_iterations: usize,
    pub initial_tau2: f64,
    /// Below this τ² the fit is reported as singular (τ² = 0).
    pub tau2_floor: f64,
}

impl Default for GlmmControl {
    fn default() -> Self {
        Self {
            inner: IrlsControl {
                tolerance: 1e-8,
                max_iterations: 50,
            },
            outer_tolerance: 1e-6,
            max_outer_iterations: 500,
            initial_tau2: 1.0,
            tau2_floor: 1e-8,
        }
    }
}

/// Random-intercept estimate for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupEffect {
    pub group: String,
    pub n_obs: usize,
    /// Offset from the population intercept.
    pub offset: f64,
    /// Conditional standard error of `offset`.
    pub std_error: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlmmFit {
    pub family: Family,
    pub group_column: String,
    pub coefficients: Vec<Coefficient>,
    /// Between-group variance of the random intercept.
    pub tau2: f64,
    /// Fixed at 1 for the Poisson family.
    pub residual_variance: f64,
    pub groups: Vec<GroupEffect>,
    pub deviance: f64,
    pub penalized_deviance: f64,
    pub outer_iterations: usize,
    pub inner_iterations: usize,
    /// τ² collapsed onto the boundary.
    pub singular: bool,
    pub n_obs: usize,
    #[serde(skip)]
    pub fitted: Vec<f64>,
}

impl GlmmFit {
    pub fn group(&self, name: &str) -> Option<&GroupEffect> {
        self.groups.iter().find(|g| g.group == name)
    }
}

impl FittedModel for GlmmFit {
    fn coefficients(&self) -> &[Coefficient] {
        &self.coefficients
    }
}

struct PenalizedFit {
    theta: Array1<f64>,
    cov: Array2<f64>,
    mu: Array1<f64>,
    deviance: f64,
    penalized: f64,
    iterations: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GlmmSolver {
    pub family: Family,
    pub control: GlmmControl,
}

impl GlmmSolver {
    pub fn new(control: GlmmControl) -> Self {
        Self {
            family: Family::Poisson,
            control,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(n = design.n_obs(), p = design.n_coef()))]
    pub fn fit(&self, design: &DesignMatrix) -> Result<GlmmFit> {
        let groups = design
            .groups
            .as_ref()
            .filter(|g| !g.is_empty())
            .ok_or_else(|| PipelineError::schema("<groups>", "GLMM needs a grouping column"))?;
        self.family.validate(&design.y)?;

        let p = design.n_coef();
        let q = groups.len();

        // warm start: fixed effects from the plain GLM, offsets at zero
        let glm = GlmSolver {
            family: self.family,
            control: self.control.inner,
        }
        .fit(design)?;
        let mut theta = Array1::<f64>::zeros(p + q);
        theta
            .slice_mut(s![..p])
            .assign(&Array1::from(glm.estimates()));

        let mut tau2 = self.control.initial_tau2;
        let mut inner_total = 0usize;
        let mut singular = false;
        let mut outer_done = None;
        let mut last_deviance = glm.deviance;

        for outer in 1..=self.control.max_outer_iterations {
            let fit = self.penalized_irls(design, groups, &theta, tau2)?;
            inner_total += fit.iterations;
            last_deviance = fit.penalized;
            theta = fit.theta;

            let b = theta.slice(s![p..]);
            let sum_sq = b.dot(&b);
            let trace: f64 = (0..q).map(|g| fit.cov[[p + g, p + g]]).sum();
            let new_tau2 = update_tau2(sum_sq, trace, tau2, q);
            debug!(outer, tau2 = new_tau2, penalized = fit.penalized, "outer step");

            if new_tau2 < self.control.tau2_floor {
                warn!(outer, "random-intercept variance collapsed to zero");
                singular = true;
                tau2 = self.control.tau2_floor;
                outer_done = Some(outer);
                break;
            }
            let done = (new_tau2 - tau2).abs() < self.control.outer_tolerance * tau2.max(1e-4);
            tau2 = new_tau2;
            if done {
                outer_done = Some(outer);
                break;
            }
        }

        let Some(outer_iterations) = outer_done else {
            return Err(PipelineError::Convergence {
                stage: "glmm outer",
                iterations: self.control.max_outer_iterations,
                last_deviance,
            });
        };

        let fit = self.penalized_irls(design, groups, &theta, tau2)?;
        inner_total += fit.iterations;

        let coefficients = design
            .names
            .iter()
            .enumerate()
            .map(|(k, name)| Coefficient::new(name, fit.theta[k], fit.cov[[k, k]].sqrt()))
            .collect();
        let sizes = groups.sizes();
        let group_effects = groups
            .names
            .iter()
            .enumerate()
            .map(|(g, name)| GroupEffect {
                group: name.clone(),
                n_obs: sizes[g],
                offset: fit.theta[p + g],
                std_error: fit.cov[[p + g, p + g]].sqrt(),
            })
            .collect();

        let tau2 = if singular { 0.0 } else { tau2 };
        info!(
            tau2,
            outer_iterations,
            inner_iterations = inner_total,
            deviance = fit.deviance,
            "glmm converged"
        );

        Ok(GlmmFit {
            family: self.family,
            group_column: groups.column.clone(),
            coefficients,
            tau2,
            residual_variance: 1.0,
            groups: group_effects,
            deviance: fit.deviance,
            penalized_deviance: fit.penalized,
            outer_iterations,
            inner_iterations: inner_total,
            singular,
            n_obs: design.n_obs(),
            fitted: fit.mu.to_vec(),
        })
    }

    /// Penalized IRLS for fixed τ², warm-started at `start = [β; b]`.
    fn penalized_irls(
        &self,
        design: &DesignMatrix,
        groups: &GroupIndex,
        start: &Array1<f64>,
        tau2: f64,
    ) -> Result<PenalizedFit> {
        let family = self.family;
        let p = design.n_coef();
        let lambda = 1.0 / tau2;
        let y = &design.y;

        let mut theta = start.clone();
        let mut eta = linear_predictor(design, groups, &theta);
        let mut mu = eta.mapv(|e| family.inverse_link(e));
        let mut pen = penalized_deviance(family, y, &mu, &theta, p, lambda);

        for iter in 1..=self.control.inner.max_iterations {
            let (w, z) = working_response(family, &eta, &mu, y);
            let (a, rhs) = augmented_system(design, groups, &w, &z, lambda);
            let chol = Cholesky::factor(&a).map_err(|j| singular_column(design, groups, j))?;
            theta = chol.solve(&rhs);
            eta = linear_predictor(design, groups, &theta);
            mu = eta.mapv(|e| family.inverse_link(e));

            let new_pen = penalized_deviance(family, y, &mu, &theta, p, lambda);
            if !new_pen.is_finite() {
                return Err(PipelineError::Convergence {
                    stage: "glmm inner",
                    iterations: iter,
                    last_deviance: pen,
                });
            }
            let done = self.control.inner.converged(pen, new_pen);
            pen = new_pen;
            if done {
                let (w, z) = working_response(family, &eta, &mu, y);
                let (a, _) = augmented_system(design, groups, &w, &z, lambda);
                let cov = Cholesky::factor(&a)
                    .map_err(|j| singular_column(design, groups, j))?
                    .inverse();
                return Ok(PenalizedFit {
                    deviance: family.deviance(y, &mu),
                    theta,
                    cov,
                    mu,
                    penalized: pen,
                    iterations: iter,
                });
            }
        }

        Err(PipelineError::Convergence {
            stage: "glmm inner",
            iterations: self.control.inner.max_iterations,
            last_deviance: pen,
        })
    }
}

/// Fellner–Schall step `τ² ← Σb² / (q − tr(C_bb)/τ²)`; falls back to the
/// EM step `(Σb² + tr(C_bb)) / q` if the denominator degenerates. Both share
/// the same fixed point.
fn update_tau2(sum_sq: f64, trace: f64, tau2: f64, q: usize) -> f64 {
    let denom = q as f64 - trace / tau2;
    if denom > 1e-12 {
        sum_sq / denom
    } else {
        (sum_sq + trace) / q as f64
    }
}

fn linear_predictor(design: &DesignMatrix, groups: &GroupIndex, theta: &Array1<f64>) -> Array1<f64> {
    let p = design.n_coef();
    let mut eta = design.x.dot(&theta.slice(s![..p]));
    for (i, &g) in groups.assignment.iter().enumerate() {
        eta[i] += theta[p + g];
    }
    eta
}

fn penalized_deviance(
    family: Family,
    y: &Array1<f64>,
    mu: &Array1<f64>,
    theta: &Array1<f64>,
    p: usize,
    lambda: f64,
) -> f64 {
    let b = theta.slice(s![p..]);
    family.deviance(y, mu) + lambda * b.dot(&b)
}

/// Augmented (p+q)×(p+q) normal equations and right-hand side.
fn augmented_system(
    design: &DesignMatrix,
    groups: &GroupIndex,
    w: &Array1<f64>,
    z: &Array1<f64>,
    lambda: f64,
) -> (Array2<f64>, Array1<f64>) {
    let x = &design.x;
    let p = design.n_coef();
    let q = groups.len();
    let mut a = Array2::<f64>::zeros((p + q, p + q));
    let mut rhs = Array1::<f64>::zeros(p + q);

    for (i, &g) in groups.assignment.iter().enumerate() {
        let (wi, zi) = (w[i], z[i]);
        let row = x.row(i);
        for k in 0..p {
            let wx = wi * row[k];
            for l in k..p {
                a[[k, l]] += wx * row[l];
            }
            a[[k, p + g]] += wx;
            rhs[k] += wx * zi;
        }
        a[[p + g, p + g]] += wi;
        rhs[p + g] += wi * zi;
    }
    for g in 0..q {
        a[[p + g, p + g]] += lambda;
    }
    // mirror the upper triangle
    for k in 0..(p + q) {
        for l in (k + 1)..(p + q) {
            a[[l, k]] = a[[k, l]];
        }
    }
    (a, rhs)
}

fn singular_column(design: &DesignMatrix, groups: &GroupIndex, j: usize) -> PipelineError {
    let p = design.n_coef();
    let column = if j < p {
        design.names[j].clone()
    } else {
        format!("{}[{}]", groups.column, groups.names[j - p])
    };
    PipelineError::SingularDesign { column }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::design::INTERCEPT;
    use ndarray::Array2;

    /// Intercept-only design with the given (group, size, outcome) blocks.
    fn blocks(spec: &[(&str, usize, f64)]) -> DesignMatrix {
        let mut ys = Vec::new();
        let mut labels = Vec::new();
        for (g, n, y) in spec {
            for _ in 0..*n {
                ys.push(*y);
                labels.push(g.to_string());
            }
        }
        let n = ys.len();
        DesignMatrix::from_parts(
            Array2::ones((n, 1)),
            Array1::from(ys),
            vec![INTERCEPT.to_string()],
        )
        .unwrap()
        .with_groups(GroupIndex::from_labels("state", &labels))
        .unwrap()
    }

    #[test]
    fn small_groups_shrink_more() {
        let hi = 2.5f64.exp();
        let lo = 1.5f64.exp();
        let design = blocks(&[("A", 5, hi), ("B", 500, hi), ("C", 500, lo), ("D", 5, lo)]);
        let fit = GlmmSolver::default().fit(&design).unwrap();

        let a = fit.group("A").unwrap();
        let b = fit.group("B").unwrap();
        let c = fit.group("C").unwrap();
        let d = fit.group("D").unwrap();
        assert!(a.offset > 0.0 && b.offset > 0.0);
        assert!(a.offset.abs() < b.offset.abs());
        assert!(d.offset < 0.0 && c.offset < 0.0);
        assert!(d.offset.abs() < c.offset.abs());
        assert!(a.std_error > b.std_error);
        assert!(fit.tau2 > 0.0);
        assert!(!fit.singular);
        assert_eq!(fit.residual_variance, 1.0);
        assert_eq!((a.n_obs, b.n_obs), (5, 500));
    }

    #[test]
    fn recovers_fixed_slope_with_group_offsets() {
        // log μ = 1 + 0.3·x + u_g with exact outcomes
        let offsets = [("AL", -0.4), ("GA", 0.1), ("MS", 0.3), ("TN", 0.0)];
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        let mut labels = Vec::new();
        for (g, u) in offsets {
            for i in 0..40 {
                let x = -1.0 + i as f64 * 0.05;
                xs.push(x);
                ys.push((1.0 + 0.3 * x + u).exp());
                labels.push(g.to_string());
            }
        }
        let n = xs.len();
        let mut x = Array2::<f64>::ones((n, 2));
        for (i, v) in xs.iter().enumerate() {
            x[[i, 1]] = *v;
        }
        let design = DesignMatrix::from_parts(
            x,
            Array1::from(ys),
            vec![INTERCEPT.to_string(), "x".to_string()],
        )
        .unwrap()
        .with_groups(GroupIndex::from_labels("state", &labels))
        .unwrap();

        let fit = GlmmSolver::default().fit(&design).unwrap();
        let slope = fit.coefficient("x").unwrap().estimate;
        assert!((slope - 0.3).abs() < 1e-2, "slope {}", slope);
        // offsets keep their ordering after shrinkage
        let al = fit.group("AL").unwrap().offset;
        let ms = fit.group("MS").unwrap().offset;
        assert!(al < fit.group("TN").unwrap().offset);
        assert!(ms > fit.group("GA").unwrap().offset);
        assert!(fit.deviance >= 0.0);
    }

    #[test]
    fn identical_groups_collapse_to_zero_variance() {
        let design = blocks(&[("AL", 10, 7.0), ("GA", 10, 7.0), ("MS", 10, 7.0), ("TN", 10, 7.0)]);
        let fit = GlmmSolver::default().fit(&design).unwrap();

        assert!(fit.singular);
        assert_eq!(fit.tau2, 0.0);
        assert_eq!(fit.outer_iterations, 1);
        assert_eq!(fit.groups.len(), 4);
        for g in &fit.groups {
            assert!(g.offset.abs() < 1e-8, "{} offset {}", g.group, g.offset);
        }
        let b0 = fit.coefficient(INTERCEPT).unwrap().estimate;
        assert!((b0 - 7f64.ln()).abs() < 1e-6, "intercept {}", b0);
    }

    #[test]
    fn requires_groups() {
        let d = DesignMatrix::from_parts(
            Array2::ones((3, 1)),
            Array1::from(vec![1.0, 2.0, 3.0]),
            vec![INTERCEPT.to_string()],
        )
        .unwrap();
        assert!(matches!(
            GlmmSolver::default().fit(&d),
            Err(PipelineError::Schema { .. })
        ));
    }

    #[test]
    fn outer_cap_is_an_error() {
        let hi = 2.5f64.exp();
        let design = blocks(&[("A", 10, hi), ("B", 10, 1.0), ("C", 10, 3.0)]);
        let solver = GlmmSolver::new(GlmmControl {
            max_outer_iterations: 1,
            ..GlmmControl::default()
        });
        assert!(matches!(
            solver.fit(&design),
            Err(PipelineError::Convergence { stage: "glmm outer", iterations: 1, .. })
        ));
    }

    #[test]
    fn tau2_update_fixed_point() {
        // at the fixed point both steps return the current value
        let (sum_sq, trace, q) = (0.3, 0.1, 4);
        let tau2 = (sum_sq + trace) / q as f64;
        assert!((update_tau2(sum_sq, trace, tau2, q) - tau2).abs() < 1e-12);
    }
}
