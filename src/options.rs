//! Enumerated configuration for fitting and prediction. This is the
//! engine's entire "configuration" layer: plain structs with literal
//! defaults, no file format, no environment variables.

use crate::error::{GpremError, Result};

/// Whether the Laplace inner loop uses the observed Hessian (`laplace`) or
/// the expected Fisher information (`fisher_laplace`) as the curvature in
/// Newton's method and in the log-determinant term of the approximate
/// marginal likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproximationType {
    Laplace,
    FisherLaplace,
}

impl ApproximationType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "laplace" => Ok(Self::Laplace),
            "fisher_laplace" => Ok(Self::FisherLaplace),
            other => Err(GpremError::InvalidOption(format!(
                "approximation_type '{other}'"
            ))),
        }
    }
}

/// Dense/sparse-Cholesky factorization vs. an iterative (CG) solve. The
/// iterative path is only valid in combination with Vecchia.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixInversionMethod {
    Cholesky,
    Iterative,
}

impl MatrixInversionMethod {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cholesky" => Ok(Self::Cholesky),
            "iterative" => Ok(Self::Iterative),
            other => Err(GpremError::InvalidOption(format!(
                "matrix_inversion_method '{other}'"
            ))),
        }
    }
}

/// Preconditioner used by the conjugate-gradient solver on the Vecchia
/// iterative path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgPreconditioner {
    Vadu,
    IncompleteCholesky,
    PivotedCholesky,
    Fitc,
}

impl CgPreconditioner {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "vadu" => Ok(Self::Vadu),
            "incomplete_cholesky" => Ok(Self::IncompleteCholesky),
            "pivoted_cholesky" => Ok(Self::PivotedCholesky),
            "fitc" => Ok(Self::Fitc),
            other => Err(GpremError::InvalidOption(format!(
                "cg_preconditioner '{other}'"
            ))),
        }
    }
}

/// Joint-ordering strategy used when predicting with Vecchia.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecchiaPredType {
    OrderObsFirstCondObsOnly,
    OrderObsFirstCondAll,
    OrderPredFirst,
    LatentOrderObsFirstCondObsOnly,
    LatentOrderObsFirstCondAll,
}

impl VecchiaPredType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "order_obs_first_cond_obs_only" => Ok(Self::OrderObsFirstCondObsOnly),
            "order_obs_first_cond_all" => Ok(Self::OrderObsFirstCondAll),
            "order_pred_first" => Ok(Self::OrderPredFirst),
            "latent_order_obs_first_cond_obs_only" => Ok(Self::LatentOrderObsFirstCondObsOnly),
            "latent_order_obs_first_cond_all" => Ok(Self::LatentOrderObsFirstCondAll),
            other => Err(GpremError::InvalidOption(format!(
                "vecchia_pred_type '{other}'"
            ))),
        }
    }
}

/// Ordering of data indices used to build the Vecchia neighbor sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VecchiaOrdering {
    None,
    Random,
}

impl VecchiaOrdering {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "random" => Ok(Self::Random),
            other => Err(GpremError::InvalidOption(format!(
                "vecchia_ordering '{other}'"
            ))),
        }
    }
}

/// Outer-optimizer family. Selectable independently for covariance
/// parameters and for fixed-effect coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    GradientDescent,
    FisherScoring,
    NelderMead,
    Bfgs,
}

impl OptimizerKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "gradient_descent" => Ok(Self::GradientDescent),
            "fisher_scoring" => Ok(Self::FisherScoring),
            "nelder_mead" => Ok(Self::NelderMead),
            "bfgs" => Ok(Self::Bfgs),
            other => Err(GpremError::InvalidOption(format!("optimizer '{other}'"))),
        }
    }
}

/// Which quantity's relative change is tested for outer-loop convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceCriterion {
    Params,
    LogLik,
}

/// Version of the Nesterov momentum schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NesterovScheduleVersion {
    /// Constant momentum rate `acc_rate` once past `momentum_offset`.
    Constant = 0,
    /// Nesterov's `1 - 3/(6+t)` schedule once past `momentum_offset`.
    Adaptive = 1,
}

/// Options controlling `Engine::fit`.
#[derive(Debug, Clone)]
pub struct FitOptions {
    pub optimizer_cov: OptimizerKind,
    pub optimizer_coef: OptimizerKind,
    pub max_iter: usize,
    pub delta_rel_conv: f64,
    pub convergence_criterion: ConvergenceCriterion,
    pub use_nesterov: bool,
    pub nesterov_schedule_version: NesterovScheduleVersion,
    pub momentum_offset: usize,
    pub acc_rate_cov: f64,
    pub acc_rate_coef: f64,
    pub lr_cov: f64,
    pub lr_coef: f64,
    pub calc_std_dev: bool,
    pub approximation_type: ApproximationType,
    pub matrix_inversion_method: MatrixInversionMethod,
    pub cg_preconditioner: CgPreconditioner,
    pub cg_max_iter: usize,
    pub cg_delta_conv: f64,
    /// Number of independent random vectors used by the stochastic
    /// log-determinant trace estimator on the iterative Vecchia path.
    pub num_rand_vec_trace: usize,
    /// Maximum number of backtracking halvings in the Laplace Newton loop.
    pub max_lr_shrinkage_steps_newton: usize,
    /// Maximum number of step halvings the outer gradient-descent loop
    /// will attempt before giving up on an iteration.
    pub max_number_lr_shrinkage_steps: usize,
    /// Profile `σ²` out of the optimization vector, substituting the
    /// closed-form maximizer `yᵀΨ⁻¹y/n` at every evaluation instead of
    /// stepping it directly. Only takes effect for a Gaussian likelihood
    /// with no fixed-effect covariates; ignored otherwise. Works across
    /// every structural path.
    pub profile_out_sigma2: bool,
    pub seed: u64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            optimizer_cov: OptimizerKind::GradientDescent,
            optimizer_coef: OptimizerKind::GradientDescent,
            max_iter: 1000,
            delta_rel_conv: 1e-8,
            convergence_criterion: ConvergenceCriterion::LogLik,
            use_nesterov: true,
            nesterov_schedule_version: NesterovScheduleVersion::Adaptive,
            momentum_offset: 2,
            acc_rate_cov: 0.5,
            acc_rate_coef: 0.5,
            lr_cov: 0.1,
            lr_coef: 0.1,
            calc_std_dev: true,
            approximation_type: ApproximationType::Laplace,
            matrix_inversion_method: MatrixInversionMethod::Cholesky,
            cg_preconditioner: CgPreconditioner::Vadu,
            cg_max_iter: 1000,
            cg_delta_conv: 1e-3,
            num_rand_vec_trace: 50,
            max_lr_shrinkage_steps_newton: 10,
            max_number_lr_shrinkage_steps: 30,
            profile_out_sigma2: false,
            seed: 0x5EED,
        }
    }
}

/// Options controlling `Engine::predict`.
#[derive(Debug, Clone)]
pub struct PredictOptions {
    pub predict_cov_mat: bool,
    pub predict_var: bool,
    pub predict_response: bool,
    pub vecchia_pred_type: VecchiaPredType,
    pub num_neighbors_pred: usize,
    /// Number of simulation draws used to average predictive variance on
    /// the iterative Vecchia path (the sparse precision factor has no
    /// cheap closed-form quadratic-form variance, so it's estimated from
    /// posterior draws instead). 1000 matches the order of magnitude used
    /// for CG-based simulation variance estimators elsewhere in this
    /// domain. Unused on the dense/FITC/grouped-Woodbury paths, which
    /// compute the exact quadratic form directly.
    pub nsim_var_pred: usize,
    /// Number of adaptive Gauss-Hermite quadrature nodes used for
    /// response-scale prediction.
    pub num_gh_nodes: usize,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            predict_cov_mat: false,
            predict_var: true,
            predict_response: false,
            vecchia_pred_type: VecchiaPredType::OrderObsFirstCondObsOnly,
            num_neighbors_pred: 30,
            nsim_var_pred: 1000,
            num_gh_nodes: 30,
        }
    }
}
