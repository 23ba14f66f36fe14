//! Fisher scoring, `FI · δ = g`. When the objective supplies a
//! materialized Fisher information matrix (currently the dense-Gaussian
//! closed form from [`crate::gradient::fisher_information_dense`]), this
//! solves the linear system directly via Cholesky, ridged for numerical
//! safety the way a near-singular normal-equations solve would be
//! anywhere else in this engine. When no matrix is available — every
//! other structural path/likelihood combination — it falls back to the
//! standard diagonal empirical-Fisher approximation `FI_kk ≈ E[g_k²]`,
//! tracked as an exponential moving average across outer iterations.
//! Unlike gradient descent, a rejected step never persists a shrunk rate:
//! every call takes a fresh full step from the current curvature
//! estimate, and the caller's rollback handles a bad step by reverting
//! the parameters, not the optimizer's internal state.

use ndarray::{Array1, Array2};

use crate::linalg::chol_lower;

pub struct FisherState {
    ema_sq_grad: Vec<f64>,
    decay: f64,
}

impl FisherState {
    pub fn new(n: usize) -> Self {
        Self { ema_sq_grad: vec![0.0; n], decay: 0.9 }
    }

    /// `fisher`, when present, must be the same length/order as `grad`.
    /// Ridges the matrix by a small multiple of its average diagonal
    /// before the Cholesky solve; if that still fails to factor (e.g. a
    /// transient non-PSD estimate early in the outer loop), falls back to
    /// the diagonal approximation for this call only.
    pub fn step(&mut self, grad: &[f64], fisher: Option<&Array2<f64>>) -> Vec<f64> {
        if let Some(fi) = fisher {
            if let Some(delta) = self.try_fisher_solve(grad, fi) {
                return delta;
            }
        }
        self.diagonal_step(grad)
    }

    fn try_fisher_solve(&self, grad: &[f64], fi: &Array2<f64>) -> Option<Vec<f64>> {
        let n = grad.len();
        if fi.nrows() != n || fi.ncols() != n {
            return None;
        }
        let mean_diag = fi.diag().sum() / n as f64;
        let ridge = (mean_diag.abs() * 1e-8).max(1e-10);
        let mut ridged = fi.clone();
        for i in 0..n {
            ridged[[i, i]] += ridge;
        }
        let chol = chol_lower(&ridged).ok()?;
        let g = Array1::from_vec(grad.to_vec());
        let delta = crate::linalg::chol_solve(&chol, &g);
        Some(delta.to_vec())
    }

    fn diagonal_step(&mut self, grad: &[f64]) -> Vec<f64> {
        let n = grad.len();
        if self.ema_sq_grad.len() != n {
            self.ema_sq_grad = vec![0.0; n];
        }
        let mut delta = vec![0.0; n];
        for i in 0..n {
            self.ema_sq_grad[i] = self.decay * self.ema_sq_grad[i] + (1.0 - self.decay) * grad[i] * grad[i];
            let fi = self.ema_sq_grad[i].max(1e-8);
            delta[i] = grad[i] / fi;
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagonal_fallback_scales_by_inverse_curvature_estimate() {
        let mut fs = FisherState::new(1);
        let d1 = fs.step(&[2.0], None);
        assert!(d1[0] > 0.0);
        let d2 = fs.step(&[2.0], None);
        assert!(d2[0] >= d1[0]);
    }

    #[test]
    fn zero_gradient_gives_zero_step() {
        let mut fs = FisherState::new(2);
        let d = fs.step(&[0.0, 0.0], None);
        assert_eq!(d, vec![0.0, 0.0]);
    }

    #[test]
    fn materialized_fisher_matrix_solves_exactly() {
        let mut fs = FisherState::new(2);
        let fi = Array2::from_shape_vec((2, 2), vec![4.0, 1.0, 1.0, 3.0]).unwrap();
        let grad = vec![1.0, 2.0];
        let delta = fs.step(&grad, Some(&fi));
        let reconstructed = [fi[[0, 0]] * delta[0] + fi[[0, 1]] * delta[1], fi[[1, 0]] * delta[0] + fi[[1, 1]] * delta[1]];
        assert!((reconstructed[0] - grad[0]).abs() < 1e-6);
        assert!((reconstructed[1] - grad[1]).abs() < 1e-6);
    }

    #[test]
    fn non_psd_fisher_matrix_falls_back_to_diagonal() {
        let mut fs = FisherState::new(2);
        let not_psd = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 2.0, 1.0]).unwrap();
        let delta = fs.step(&[1.0, 1.0], Some(&not_psd));
        assert!(delta.iter().all(|d| d.is_finite()));
    }
}
