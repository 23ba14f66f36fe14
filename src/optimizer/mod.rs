//! Outer optimizer driving covariance parameters, likelihood auxiliary
//! parameters, and fixed-effect coefficients. Four interchangeable
//! families (gradient descent w/ Nesterov, Fisher scoring, Nelder-Mead,
//! BFGS) are selectable independently for the covariance/auxiliary block
//! and the coefficient block. When either block selects Nelder-Mead or
//! BFGS, that family drives *both* blocks jointly in one run; otherwise
//! the two blocks are updated by one step each, alternately, every outer
//! iteration (block coordinate descent).

pub mod bfgs;
pub mod fisher_scoring;
pub mod gradient_descent;
pub mod nelder_mead;

use ndarray::Array2;

use crate::error::Result;
use crate::options::{ConvergenceCriterion, FitOptions, OptimizerKind};

/// Flattened parameter vector the outer loop optimizes: log-covariance
/// parameters, log-auxiliary parameters, and fixed-effect coefficients
/// (coefficients are never log-transformed).
#[derive(Debug, Clone)]
pub struct Params {
    pub log_cov: Vec<f64>,
    pub log_aux: Vec<f64>,
    pub beta: Vec<f64>,
}

impl Params {
    pub fn total_len(&self) -> usize {
        self.log_cov.len() + self.log_aux.len() + self.beta.len()
    }

    pub fn to_flat(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(self.total_len());
        v.extend_from_slice(&self.log_cov);
        v.extend_from_slice(&self.log_aux);
        v.extend_from_slice(&self.beta);
        v
    }

    pub fn from_flat(&self, flat: &[f64]) -> Params {
        let (nc, na) = (self.log_cov.len(), self.log_aux.len());
        Params {
            log_cov: flat[0..nc].to_vec(),
            log_aux: flat[nc..nc + na].to_vec(),
            beta: flat[nc + na..].to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Gradient {
    pub d_log_cov: Vec<f64>,
    pub d_log_aux: Vec<f64>,
    pub d_beta: Vec<f64>,
}

impl Gradient {
    pub fn to_flat(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(self.d_log_cov.len() + self.d_log_aux.len() + self.d_beta.len());
        v.extend_from_slice(&self.d_log_cov);
        v.extend_from_slice(&self.d_log_aux);
        v.extend_from_slice(&self.d_beta);
        v
    }
}

/// What one objective evaluation at a trial [`Params`] returns.
pub struct Evaluation {
    pub neg_ll: f64,
    pub grad: Gradient,
    /// Expected Fisher information for the `[log_cov, log_aux]` block,
    /// when the objective can produce one in closed form (currently the
    /// dense-Gaussian case — see [`crate::gradient::fisher_information_dense`]).
    /// `None` elsewhere; [`fisher_scoring::FisherState`] then falls back
    /// to its diagonal empirical-Fisher approximation.
    pub fisher_cov_aux: Option<Array2<f64>>,
    /// Expected Fisher information for the fixed-effect block, `XᵀWX`
    /// summed across clusters — available whenever covariates are
    /// present, for any likelihood or structural path.
    pub fisher_beta: Option<Array2<f64>>,
}

/// Supplies `neg_log_likelihood`/gradient evaluations at arbitrary trial
/// parameters. Implemented by [`crate::engine::Engine`], which re-solves
/// the Laplace mode for every cluster on each call.
pub trait Objective {
    fn evaluate(&mut self, params: &Params) -> Result<Evaluation>;
}

/// Outcome of a full `fit` run.
pub struct FitOutcome {
    pub params: Params,
    pub neg_ll: f64,
    pub iterations: usize,
    /// `max_iter` was reached without meeting `delta_rel_conv` (`optim_stall`
    /// metadata, not an error).
    pub stalled: bool,
}

fn rel_change(prev: f64, cur: f64) -> f64 {
    (cur - prev).abs() / cur.abs().max(1.0)
}

fn converged(criterion: ConvergenceCriterion, prev_flat: &[f64], flat: &[f64], prev_ll: f64, ll: f64, tol: f64) -> bool {
    match criterion {
        ConvergenceCriterion::LogLik => rel_change(prev_ll, ll) < tol,
        ConvergenceCriterion::Params => {
            let num: f64 = prev_flat.iter().zip(flat.iter()).map(|(a, b)| (a - b).powi(2)).sum::<f64>().sqrt();
            let den: f64 = prev_flat.iter().map(|x| x * x).sum::<f64>().sqrt().max(1.0);
            num / den < tol
        }
    }
}

enum BlockState {
    Gd(gradient_descent::GdState),
    Fisher(fisher_scoring::FisherState),
}

impl BlockState {
    fn new(kind: OptimizerKind, n: usize) -> Self {
        match kind {
            OptimizerKind::FisherScoring => BlockState::Fisher(fisher_scoring::FisherState::new(n)),
            _ => BlockState::Gd(gradient_descent::GdState::new(n)),
        }
    }

    fn step(&mut self, grad: &[f64], lr: f64, acc_rate: f64, opts: &FitOptions, iter: usize, fisher: Option<&Array2<f64>>) -> Vec<f64> {
        match self {
            BlockState::Gd(s) => s.step(grad, lr, acc_rate, opts, iter),
            BlockState::Fisher(s) => s.step(grad, fisher),
        }
    }

    fn shrink_permanently(&mut self) {
        if let BlockState::Gd(s) = self {
            s.shrink_permanently();
        }
    }
}

/// Drive the outer loop to convergence or `max_iter`.
pub fn fit(objective: &mut dyn Objective, init: Params, opts: &FitOptions) -> Result<FitOutcome> {
    if matches!(opts.optimizer_cov, OptimizerKind::NelderMead) {
        return nelder_mead::run(objective, init, opts);
    }
    if matches!(opts.optimizer_cov, OptimizerKind::Bfgs) {
        return bfgs::run(objective, init, opts);
    }

    let original_init = init.clone();
    let mut params = init;
    let mut eval = objective.evaluate(&params)?;
    let mut block_cov = BlockState::new(opts.optimizer_cov, params.log_cov.len() + params.log_aux.len());
    let mut block_coef = BlockState::new(opts.optimizer_coef, params.beta.len());
    let mut retried = false;
    let mut stalled = true;
    let mut iterations_used = 0usize;

    for iter in 0..opts.max_iter {
        iterations_used = iter + 1;
        let prev_flat = params.to_flat();
        let prev_ll = eval.neg_ll;

        let mut cov_aux: Vec<f64> = params.log_cov.iter().chain(params.log_aux.iter()).cloned().collect();
        let grad_cov_aux: Vec<f64> = eval.grad.d_log_cov.iter().chain(eval.grad.d_log_aux.iter()).cloned().collect();
        let delta_cov =
            block_cov.step(&grad_cov_aux, opts.lr_cov, opts.acc_rate_cov, opts, iter, eval.fisher_cov_aux.as_ref());
        for (p, d) in cov_aux.iter_mut().zip(delta_cov.iter()) {
            *p -= d;
        }
        let nc = params.log_cov.len();
        let mut trial = params.clone();
        trial.log_cov = cov_aux[..nc].to_vec();
        trial.log_aux = cov_aux[nc..].to_vec();

        let delta_coef =
            block_coef.step(&eval.grad.d_beta, opts.lr_coef, opts.acc_rate_coef, opts, iter, eval.fisher_beta.as_ref());
        for (p, d) in trial.beta.iter_mut().zip(delta_coef.iter()) {
            *p -= d;
        }

        let trial_eval = objective.evaluate(&trial).ok().filter(|e| e.neg_ll.is_finite());

        match trial_eval {
            Some(trial_eval) if trial_eval.neg_ll <= prev_ll + 1e-10 => {
                let trial_flat = trial.to_flat();
                let done = iter > 0
                    && converged(opts.convergence_criterion, &prev_flat, &trial_flat, prev_ll, trial_eval.neg_ll, opts.delta_rel_conv);
                params = trial;
                eval = trial_eval;
                if done {
                    stalled = false;
                    break;
                }
            }
            non_finite_or_worse => {
                block_cov.shrink_permanently();
                block_coef.shrink_permanently();
                if non_finite_or_worse.is_none() && !retried {
                    retried = true;
                    log::warn!(
                        "outer iteration {iter} produced a non-finite objective; retrying once with Nelder-Mead from the original initial values"
                    );
                    return nelder_mead::run(objective, original_init, opts);
                }
                eval = objective.evaluate(&params)?;
            }
        }
    }

    Ok(FitOutcome { params, neg_ll: eval.neg_ll, iterations: iterations_used, stalled })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::FitOptions;

    /// Minimizes `0.5 * (x - target)^2` summed across the cov block, a
    /// quadratic bowl whose gradient/Hessian any of these families should
    /// descend without issue.
    struct Quadratic {
        target: Vec<f64>,
    }

    impl Objective for Quadratic {
        fn evaluate(&mut self, params: &Params) -> Result<Evaluation> {
            let neg_ll = params
                .log_cov
                .iter()
                .zip(self.target.iter())
                .map(|(x, t)| 0.5 * (x - t).powi(2))
                .sum();
            let grad = params.log_cov.iter().zip(self.target.iter()).map(|(x, t)| x - t).collect();
            Ok(Evaluation {
                neg_ll,
                grad: Gradient { d_log_cov: grad, d_log_aux: vec![], d_beta: vec![] },
                fisher_cov_aux: None,
                fisher_beta: None,
            })
        }
    }

    #[test]
    fn gradient_descent_converges_to_target() {
        let mut obj = Quadratic { target: vec![2.0, -1.0] };
        let init = Params { log_cov: vec![0.0, 0.0], log_aux: vec![], beta: vec![] };
        let opts = FitOptions { max_iter: 500, lr_cov: 0.2, use_nesterov: false, ..FitOptions::default() };
        let outcome = fit(&mut obj, init, &opts).unwrap();
        assert!((outcome.params.log_cov[0] - 2.0).abs() < 1e-2);
        assert!((outcome.params.log_cov[1] - (-1.0)).abs() < 1e-2);
    }

    #[test]
    fn fisher_scoring_converges_to_target() {
        let mut obj = Quadratic { target: vec![1.5] };
        let init = Params { log_cov: vec![0.0], log_aux: vec![], beta: vec![] };
        let opts = FitOptions {
            max_iter: 2000,
            optimizer_cov: OptimizerKind::FisherScoring,
            optimizer_coef: OptimizerKind::FisherScoring,
            ..FitOptions::default()
        };
        let outcome = fit(&mut obj, init, &opts).unwrap();
        assert!((outcome.params.log_cov[0] - 1.5).abs() < 5e-2);
    }
}
