// src/model/linalg.rs
//! Dense symmetric positive-definite solves for the normal equations,
//! factored with faer's LLᵀ. The rest of the model code stays in ndarray.

use faer::{
    linalg::solvers::{Llt, LltError},
    prelude::*,
    Side,
};
use ndarray::{Array1, Array2, Axis};

/// Pivots below this fraction of their original diagonal are treated as zero.
const RANK_TOLERANCE: f64 = 1e-10;

/// Cholesky factor `A = L Lᵀ` of a normal-equations matrix.
#[derive(Debug)]
pub struct Cholesky {
    llt: Llt<f64>,
    n: usize,
}

impl Cholesky {
    /// Factor `a`. On rank deficiency returns the index of the first
    /// column whose pivot vanished.
    pub fn factor(a: &Array2<f64>) -> Result<Self, usize> {
        let n = a.nrows();
        debug_assert_eq!(n, a.ncols());
        if let Some(j) = (0..n).find(|&j| !a[[j, j]].is_finite() || a[[j, j]] == 0.0) {
            return Err(j);
        }

        let m = Mat::<f64>::from_fn(n, n, |i, j| a[[i, j]]);
        let llt = m.llt(Side::Lower).map_err(|e| match e {
            LltError::NonPositivePivot { index } => index,
            #[allow(unreachable_patterns)]
            _ => 0,
        })?;

        // faer only rejects non-positive pivots; collinear columns usually
        // leave a tiny positive one behind from rounding.
        let l = llt.L();
        for j in 0..n {
            let d = l[(j, j)] * l[(j, j)];
            if !(d > RANK_TOLERANCE * a[[j, j]].abs()) || !d.is_finite() {
                return Err(j);
            }
        }
        Ok(Self { llt, n })
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    /// Solve `A x = b`.
    pub fn solve(&self, b: &Array1<f64>) -> Array1<f64> {
        let rhs = Mat::<f64>::from_fn(self.n, 1, |i, _| b[i]);
        let x = self.llt.solve(&rhs);
        Array1::from_shape_fn(self.n, |i| x[(i, 0)])
    }

    /// `A⁻¹`.
    pub fn inverse(&self) -> Array2<f64> {
        let eye = Mat::<f64>::identity(self.n, self.n);
        let inv = self.llt.solve(&eye);
        Array2::from_shape_fn((self.n, self.n), |(i, j)| inv[(i, j)])
    }
}

/// `(XᵀWX, XᵀWz)` for diagonal weights `w`.
pub fn weighted_normal_equations(
    x: &Array2<f64>,
    w: &Array1<f64>,
    z: &Array1<f64>,
) -> (Array2<f64>, Array1<f64>) {
    let xw = x * &w.view().insert_axis(Axis(1));
    (xw.t().dot(x), xw.t().dot(z))
}
