//! Component registry. Each cluster owns a list of [`Component`]s; a
//! component is one additive term of the latent covariance structure
//! (grouped variance, grouped coefficient, GP, GP coefficient).

use crate::error::{GpremError, Result};
use crate::kernel::{Kernel, KernelParams};
use ndarray::{Array1, Array2};

/// Which of the four additive term kinds a component is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    GroupedIntercept,
    GroupedCoef,
    GpIntercept,
    GpCoef,
}

impl ComponentKind {
    pub fn is_grouped(self) -> bool {
        matches!(self, ComponentKind::GroupedIntercept | ComponentKind::GroupedCoef)
    }

    pub fn is_gp(self) -> bool {
        matches!(self, ComponentKind::GpIntercept | ComponentKind::GpCoef)
    }
}

/// Maps a component's random-effect vector `b` (length `num_re`, the
/// "latent scale") to the data scale `Zb` (length `num_data`). Grouped
/// components map each observation to its group's level; GP components map
/// each observation to its (possibly repeated) unique location. `scale`
/// multiplies the incidence entry and is the covariate for `*Coef` kinds,
/// all-ones for `*Intercept` kinds.
#[derive(Debug, Clone)]
pub struct Incidence {
    pub level_of: Vec<usize>,
    pub num_re: usize,
    pub scale: Array1<f64>,
}

impl Incidence {
    pub fn new_intercept(level_of: Vec<usize>, num_re: usize) -> Self {
        let n = level_of.len();
        Self { level_of, num_re, scale: Array1::ones(n) }
    }

    pub fn new_coef(level_of: Vec<usize>, num_re: usize, covariate: Array1<f64>) -> Self {
        Self { level_of, num_re, scale: covariate }
    }

    /// Apply `Z`: expand a latent-scale vector `b` (length `num_re`) to the
    /// data scale (length `num_data`).
    pub fn apply(&self, b: &Array1<f64>) -> Array1<f64> {
        Array1::from_iter(
            self.level_of
                .iter()
                .zip(self.scale.iter())
                .map(|(&lvl, &s)| s * b[lvl]),
        )
    }

    /// Apply `Zᵀ`: collapse a data-scale vector onto the latent scale,
    /// summing contributions that share a level.
    pub fn apply_transpose(&self, v: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::<f64>::zeros(self.num_re);
        for (i, &lvl) in self.level_of.iter().enumerate() {
            out[lvl] += self.scale[i] * v[i];
        }
        out
    }

    /// Diagonal of `ZᵀZ` on the latent scale (sum of squared incidence
    /// entries falling into each level). Used by the grouped-Woodbury path.
    pub fn zt_z_diag(&self) -> Array1<f64> {
        let mut out = Array1::<f64>::zeros(self.num_re);
        for (&lvl, &s) in self.level_of.iter().zip(self.scale.iter()) {
            out[lvl] += s * s;
        }
        out
    }

    pub fn num_data(&self) -> usize {
        self.level_of.len()
    }
}

/// One additive term of the latent covariance.
#[derive(Debug, Clone)]
pub struct Component {
    pub kind: ComponentKind,
    pub kernel: Kernel,
    /// Covariance parameters on the natural scale: `[variance]` for grouped
    /// kinds, `[variance, range]` for GP kinds.
    pub cov_pars: Vec<f64>,
    pub incidence: Incidence,
    /// Pairwise distance matrix between the `num_re` unique GP locations
    /// (`None` for grouped components, whose `Σ_j` never depends on
    /// coordinates).
    pub dist: Option<Array2<f64>>,
}

impl Component {
    pub fn new_grouped(kind: ComponentKind, incidence: Incidence, variance: f64) -> Result<Self> {
        if !kind.is_grouped() {
            return Err(GpremError::IncompatibleStructure(
                "new_grouped called with a GP kind".into(),
            ));
        }
        Ok(Self { kind, kernel: Kernel::Identity, cov_pars: vec![variance], incidence, dist: None })
    }

    pub fn new_gp(
        kind: ComponentKind,
        incidence: Incidence,
        kernel: Kernel,
        dist: Array2<f64>,
        variance: f64,
        range: f64,
    ) -> Result<Self> {
        if !kind.is_gp() {
            return Err(GpremError::IncompatibleStructure(
                "new_gp called with a grouped kind".into(),
            ));
        }
        if dist.nrows() != incidence.num_re || dist.ncols() != incidence.num_re {
            return Err(GpremError::ShapeMismatch(
                "distance matrix must be num_re x num_re".into(),
            ));
        }
        Ok(Self { kind, kernel, cov_pars: vec![variance, range], incidence, dist: Some(dist) })
    }

    pub fn num_cov_par(&self) -> usize {
        self.kernel.num_cov_par()
    }

    pub fn num_re(&self) -> usize {
        self.incidence.num_re
    }

    pub fn set_cov_pars(&mut self, pars: &[f64]) -> Result<()> {
        if pars.len() != self.num_cov_par() {
            return Err(GpremError::ShapeMismatch(format!(
                "component expects {} covariance parameters, got {}",
                self.num_cov_par(),
                pars.len()
            )));
        }
        if pars.iter().any(|&p| !(p > 0.0)) {
            return Err(GpremError::BadInput(
                "covariance parameters must be strictly positive".into(),
            ));
        }
        self.cov_pars = pars.to_vec();
        Ok(())
    }

    pub fn kernel_params(&self) -> KernelParams {
        KernelParams {
            variance: self.cov_pars[0],
            range: if self.cov_pars.len() > 1 { self.cov_pars[1] } else { 1.0 },
        }
    }

    /// `Σ_j` on the latent (`num_re x num_re`) scale.
    pub fn build_sigma(&self) -> Array2<f64> {
        match &self.dist {
            Some(dist) => self.kernel.build_sigma(dist, self.kernel_params()),
            None => Array2::eye(self.num_re()) * self.cov_pars[0],
        }
    }

    /// `∂Σ_j/∂θ_k` for parameter index `k`, on the natural scale.
    pub fn sigma_grad(&self, k: usize) -> Array2<f64> {
        match &self.dist {
            Some(dist) => {
                let grads = self.kernel.sigma_grad(dist, self.kernel_params());
                grads[k].clone()
            }
            None => {
                debug_assert_eq!(k, 0);
                Array2::eye(self.num_re())
            }
        }
    }
}

/// A registry of components for one cluster, append-only after
/// construction.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    pub components: Vec<Component>,
}

impl ComponentRegistry {
    pub fn new(components: Vec<Component>) -> Self {
        Self { components }
    }

    pub fn total_cov_pars(&self) -> usize {
        self.components.iter().map(Component::num_cov_par).sum()
    }

    pub fn only_grouped(&self) -> bool {
        !self.components.is_empty() && self.components.iter().all(|c| c.kind.is_grouped())
    }

    pub fn only_gp(&self) -> bool {
        !self.components.is_empty() && self.components.iter().all(|c| c.kind.is_gp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouped_incidence_zt_z_diag_counts_group_sizes() {
        let inc = Incidence::new_intercept(vec![0, 0, 1, 1, 1], 2);
        let diag = inc.zt_z_diag();
        assert_eq!(diag[0], 2.0);
        assert_eq!(diag[1], 3.0);
    }

    #[test]
    fn apply_then_apply_transpose_round_trips_on_identity_groups() {
        let inc = Incidence::new_intercept(vec![0, 1, 2], 3);
        let b = Array1::from(vec![1.0, 2.0, 3.0]);
        let zb = inc.apply(&b);
        assert_eq!(zb, b);
        let back = inc.apply_transpose(&zb);
        assert_eq!(back, b);
    }

    #[test]
    fn rejects_non_positive_cov_pars() {
        let inc = Incidence::new_intercept(vec![0, 1], 2);
        let mut c = Component::new_grouped(ComponentKind::GroupedIntercept, inc, 1.0).unwrap();
        assert!(c.set_cov_pars(&[-1.0]).is_err());
    }
}
