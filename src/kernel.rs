//! Concrete covariance-kernel catalog: given parameters and a pairwise
//! distance, returns the kernel value and its parameter-wise derivatives.
//! Grouped components use [`Kernel::Identity`], which ignores coordinates
//! entirely and only ever appears with a scalar variance.

use ndarray::{Array1, Array2};

/// Identifies which covariance function a GP component uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// Degenerate kernel for grouped (non-spatial) components: `Σ_j = σ² I`
    /// on the random-effect scale.
    Identity,
    Exponential,
    /// Matérn with smoothness fixed at 1.5 (the common default when
    /// smoothness is not estimated).
    Matern15,
    /// Matérn with smoothness fixed at 2.5.
    Matern25,
    WendlandTaper,
}

/// Parameters of a GP covariance function, on the natural (untransformed)
/// scale. `smoothness` is only meaningful for kernels that estimate it;
/// `taper_range` is only meaningful for [`Kernel::WendlandTaper`].
#[derive(Debug, Clone, Copy)]
pub struct KernelParams {
    pub variance: f64,
    pub range: f64,
}

impl Kernel {
    /// Number of free covariance parameters this kernel exposes (variance
    /// + range; smoothness and taper radius are fixed hyperparameters in
    /// this catalog).
    pub fn num_cov_par(self) -> usize {
        match self {
            Kernel::Identity => 1,
            _ => 2,
        }
    }

    fn correlation(self, dist: f64, range: f64) -> f64 {
        if range <= 0.0 {
            return if dist == 0.0 { 1.0 } else { 0.0 };
        }
        let h = dist / range;
        match self {
            Kernel::Identity => {
                if dist == 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Kernel::Exponential => (-h).exp(),
            Kernel::Matern15 => (1.0 + (3.0_f64).sqrt() * h) * (-(3.0_f64).sqrt() * h).exp(),
            Kernel::Matern25 => {
                let sqrt5_h = (5.0_f64).sqrt() * h;
                (1.0 + sqrt5_h + 5.0 * h * h / 3.0) * (-sqrt5_h).exp()
            }
            Kernel::WendlandTaper => {
                if h >= 1.0 {
                    0.0
                } else {
                    (1.0 - h).powi(4) * (1.0 + 4.0 * h)
                }
            }
        }
    }

    /// Derivative of the correlation function w.r.t. `range`, holding
    /// `dist` fixed.
    fn correlation_d_range(self, dist: f64, range: f64) -> f64 {
        if range <= 0.0 || dist == 0.0 {
            return 0.0;
        }
        let h = dist / range;
        // d(h)/d(range) = -dist/range^2 = -h/range
        let dh_drange = -h / range;
        let d_corr_dh: f64 = match self {
            Kernel::Identity => 0.0,
            Kernel::Exponential => -(-h).exp(),
            Kernel::Matern15 => {
                let s3 = (3.0_f64).sqrt();
                // d/dh[(1+s3 h) exp(-s3 h)] = s3 exp(-s3 h) - s3(1+s3 h) exp(-s3 h)
                s3 * (-s3 * h).exp() * (1.0 - (1.0 + s3 * h))
            }
            Kernel::Matern25 => {
                let s5 = (5.0_f64).sqrt();
                let poly = 1.0 + s5 * h + 5.0 * h * h / 3.0;
                let dpoly = s5 + 10.0 * h / 3.0;
                (-s5 * h).exp() * (dpoly - s5 * poly)
            }
            Kernel::WendlandTaper => {
                if h >= 1.0 {
                    0.0
                } else {
                    // d/dh[(1-h)^4 (1+4h)] = -4(1-h)^3(1+4h) + 4(1-h)^4
                    -4.0 * (1.0 - h).powi(3) * (1.0 + 4.0 * h) + 4.0 * (1.0 - h).powi(4)
                }
            }
        };
        d_corr_dh * dh_drange
    }

    /// Build the `n x n` component covariance matrix `Σ_j` from a pairwise
    /// distance matrix.
    pub fn build_sigma(self, dist: &Array2<f64>, params: KernelParams) -> Array2<f64> {
        dist.mapv(|d| params.variance * self.correlation(d, params.range))
    }

    /// `∂Σ_j/∂θ` for each of this kernel's parameters, on the natural
    /// (not log) scale, in the order `[variance, range]` (or just
    /// `[variance]` for [`Kernel::Identity`]).
    pub fn sigma_grad(self, dist: &Array2<f64>, params: KernelParams) -> Vec<Array2<f64>> {
        let d_variance = dist.mapv(|d| self.correlation(d, params.range));
        if self.num_cov_par() == 1 {
            return vec![d_variance];
        }
        let d_range = dist.mapv(|d| params.variance * self.correlation_d_range(d, params.range));
        vec![d_variance, d_range]
    }

    /// Cross-covariance vector between one new location (distance `dist`
    /// to each training point) and the training set, used by the
    /// predictor.
    pub fn cross_cov(self, dist: &Array1<f64>, params: KernelParams) -> Array1<f64> {
        dist.mapv(|d| params.variance * self.correlation(d, params.range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn exponential_at_zero_distance_is_variance() {
        let dist = arr2(&[[0.0]]);
        let sigma = Kernel::Exponential.build_sigma(&dist, KernelParams { variance: 2.0, range: 1.0 });
        assert!((sigma[[0, 0]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn identity_kernel_ignores_range() {
        let dist = arr2(&[[0.0, 1.0], [1.0, 0.0]]);
        let sigma = Kernel::Identity.build_sigma(&dist, KernelParams { variance: 3.0, range: 1.0 });
        assert!((sigma[[0, 0]] - 3.0).abs() < 1e-12);
        assert!(sigma[[0, 1]].abs() < 1e-12);
    }

    #[test]
    fn range_gradient_matches_finite_difference() {
        let dist = arr2(&[[0.0, 0.7], [0.7, 0.0]]);
        let params = KernelParams { variance: 1.3, range: 0.9 };
        let eps = 1e-6;
        for kernel in [Kernel::Exponential, Kernel::Matern15, Kernel::Matern25] {
            let grads = kernel.sigma_grad(&dist, params);
            let analytic = grads[1][[0, 1]];
            let plus = kernel.build_sigma(&dist, KernelParams { variance: params.variance, range: params.range + eps });
            let minus = kernel.build_sigma(&dist, KernelParams { variance: params.variance, range: params.range - eps });
            let fd = (plus[[0, 1]] - minus[[0, 1]]) / (2.0 * eps);
            assert!((analytic - fd).abs() < 1e-4, "{:?}: analytic={analytic} fd={fd}", kernel);
        }
    }
}
