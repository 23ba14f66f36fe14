//! Per-cluster data and mutable state. A cluster is one independent
//! realization of the latent process; all factorizations are per cluster
//! and cross-cluster blocks are zero by construction.

use ndarray::Array1;

use crate::component::ComponentRegistry;
use crate::covariance::FactorizationCache;

/// Static data for one cluster: which data-row indices it owns and its
/// component registry.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub indices: Vec<usize>,
    pub components: ComponentRegistry,
}

impl Cluster {
    pub fn n_i(&self) -> usize {
        self.indices.len()
    }
}

/// Mutable per-cluster state that persists across outer iterations to
/// warm-start the Laplace inner solver, plus a rollback snapshot used for
/// recovery when an outer step produces NaN/Inf.
#[derive(Debug, Clone)]
pub struct ClusterState {
    /// Posterior mode `m`, on whatever scale the active structure tag
    /// keeps it on (data scale or RE scale).
    pub mode: Array1<f64>,
    pub mode_snapshot: Array1<f64>,
    /// `a = Σ⁻¹ m`, used by the numerically stable Laplace path.
    pub a_vec: Array1<f64>,
    pub first_deriv_log_lik: Array1<f64>,
    pub diag_information_log_lik: Array1<f64>,
    pub approx_marginal_ll: f64,
    pub factorization: Option<FactorizationCache>,
    /// Set when the last mode-finding call exhausted backtracking without
    /// converging; cleared on the next accepted step.
    pub na_or_inf: bool,
}

impl ClusterState {
    pub fn new(n_re: usize) -> Self {
        Self {
            mode: Array1::zeros(n_re),
            mode_snapshot: Array1::zeros(n_re),
            a_vec: Array1::zeros(n_re),
            first_deriv_log_lik: Array1::zeros(n_re),
            diag_information_log_lik: Array1::zeros(n_re),
            approx_marginal_ll: f64::NEG_INFINITY,
            factorization: None,
            na_or_inf: false,
        }
    }

    /// Snapshot the mode before an outer-optimizer step, for rollback on
    /// NaN/Inf.
    pub fn snapshot(&mut self) {
        self.mode_snapshot = self.mode.clone();
    }

    /// Restore the mode from the last snapshot.
    pub fn rollback(&mut self) {
        self.mode = self.mode_snapshot.clone();
        self.na_or_inf = false;
    }
}
