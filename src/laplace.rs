//! Laplace / Fisher-Laplace inner solver. Finds the posterior mode `m`
//! maximizing `log p(y | Zm+f) - ½ mᵀ Σ⁻¹ m` by Newton's method, using
//! whichever structure-specific linear solve the active
//! [`crate::structure::StructureTag`] calls for, with shared backtracking,
//! cap-change safeguarding, and convergence logic.

use ndarray::Array1;

use crate::cluster::ClusterState;
use crate::component::ComponentRegistry;
use crate::covariance::{self, FactorizationCache};
use crate::error::{GpremError, Result};
use crate::likelihood::Likelihood;
use crate::linalg::{chol_solve, log_det_from_chol};
use crate::options::{ApproximationType, FitOptions};
use crate::structure::{StructureFlags, StructureTag};

const CAP_CHANGE: f64 = 4.605170185988091; // ln(100)

fn uses_exponential_inverse_link(likelihood: &Likelihood) -> bool {
    matches!(
        likelihood.kind,
        crate::likelihood::LikelihoodKind::Poisson
            | crate::likelihood::LikelihoodKind::Gamma
            | crate::likelihood::LikelihoodKind::NegativeBinomial
    )
}

/// Expand the RE-scale mode `b` (length = total random-effect count) to
/// the data scale `Zb`, summing each component's contribution.
pub(crate) fn mode_to_latent(mode: &Array1<f64>, registry: &ComponentRegistry, num_data: usize) -> Array1<f64> {
    let mut f = Array1::<f64>::zeros(num_data);
    let mut offset = 0usize;
    for comp in &registry.components {
        let n = comp.num_re();
        let b_j = mode.slice(ndarray::s![offset..offset + n]).to_owned();
        f = f + comp.incidence.apply(&b_j);
        offset += n;
    }
    f
}

pub(crate) fn total_re(registry: &ComponentRegistry) -> usize {
    registry.components.iter().map(|c| c.num_re()).sum()
}

/// Result of one converged (or exhausted) Newton run.
pub struct LaplaceResult {
    pub mode: Array1<f64>,
    pub a_vec: Array1<f64>,
    pub approx_marginal_ll: f64,
    pub first_deriv_log_lik: Array1<f64>,
    pub diag_information_log_lik: Array1<f64>,
    pub cache: FactorizationCache,
    pub na_or_inf: bool,
    pub iterations: usize,
}

/// Solve for the posterior mode of one cluster. `fixed_offset` is `f`
/// in `log p(y | Zm+f)` (the fixed-effect linear predictor, all-zeros if
/// there are no covariates).
#[allow(clippy::too_many_arguments)]
pub fn solve_mode(
    flags: &StructureFlags,
    registry: &ComponentRegistry,
    likelihood: &Likelihood,
    y: &Array1<f64>,
    fixed_offset: &Array1<f64>,
    state: &mut ClusterState,
    approximation_type: ApproximationType,
    opts: &FitOptions,
) -> Result<LaplaceResult> {
    let num_data = y.len();
    let is_woodbury = matches!(
        flags.tag,
        StructureTag::GroupedWoodbury | StructureTag::SingleGroupedOnReScale
    );
    let nugget = if flags.gauss_likelihood { Some(likelihood.aux_pars[0]) } else { None };
    let re_len = total_re(registry);

    let mut mode = if is_woodbury {
        if state.mode.len() == re_len { state.mode.clone() } else { Array1::zeros(re_len) }
    } else if state.mode.len() == num_data {
        state.mode.clone()
    } else {
        Array1::zeros(num_data)
    };

    let mut warned_indefinite = false;
    let mut prev_obj = f64::NEG_INFINITY;
    let mut na_or_inf = false;
    let mut last_cache: Option<FactorizationCache> = None;
    let mut last_grad = Array1::<f64>::zeros(num_data);
    let mut last_w = Array1::<f64>::zeros(num_data);
    let mut last_a_vec = mode.clone();
    let mut iterations = 0usize;

    for iter in 0..opts.max_iter.min(200) {
        iterations = iter + 1;
        let f_latent = if is_woodbury { mode_to_latent(&mode, registry, num_data) } else { mode.clone() };
        let eta = &f_latent + fixed_offset;

        let mut grad = Array1::<f64>::zeros(num_data);
        let mut w = Array1::<f64>::zeros(num_data);
        for i in 0..num_data {
            grad[i] = likelihood.d_log_lik_d_eta(y[i], eta[i]);
            let use_expected = approximation_type == ApproximationType::FisherLaplace;
            let mut wi = if use_expected {
                likelihood.expected_diag_info(y[i], eta[i])
            } else {
                likelihood.observed_diag_info(y[i], eta[i])
            };
            if !use_expected && wi <= 0.0 && !likelihood.observed_info_always_psd() {
                if !warned_indefinite {
                    log::warn!("Laplace W indefinite for Student-t likelihood; falling back to Fisher-Laplace information for this step");
                    warned_indefinite = true;
                }
                wi = likelihood.expected_diag_info(y[i], eta[i]);
            }
            w[i] = wi.max(1e-10);
        }

        let cache = covariance::factorize(
            flags,
            registry,
            num_data,
            nugget,
            Some(&w),
            crate::covariance::vecchia::DEFAULT_NUM_NEIGHBORS,
            opts.cg_preconditioner,
        )?;

        let rhs = &w * &f_latent + &grad;
        let mut proposed = solve_newton_system(&cache, registry, &rhs, &w, opts.cg_max_iter, opts.cg_delta_conv)?;

        let base = if is_woodbury { mode.clone() } else { f_latent.clone() };
        if uses_exponential_inverse_link(likelihood) {
            for i in 0..proposed.len() {
                let delta = proposed[i] - base[i];
                if delta.abs() > CAP_CHANGE {
                    proposed[i] = base[i] + delta.signum() * CAP_CHANGE;
                }
            }
        }

        let mut lr = 1.0f64;
        let mut accepted = false;
        let mut trial_mode = mode.clone();
        let mut obj = f64::NAN;
        let mut a_vec_trial = Array1::<f64>::zeros(proposed.len());

        for _ in 0..=opts.max_lr_shrinkage_steps_newton {
            trial_mode = &base + &((&proposed - &base) * lr);
            let f_trial = if is_woodbury { mode_to_latent(&trial_mode, registry, num_data) } else { trial_mode.clone() };
            let eta_trial = &f_trial + fixed_offset;
            let sum_ll: f64 = (0..num_data).map(|i| likelihood.log_lik(y[i], eta_trial[i])).sum();
            a_vec_trial = &rhs - &(&w * &f_trial);
            let quad = a_vec_trial.dot(&f_trial);
            let log_det = log_det_for(&cache, &w);
            obj = -0.5 * quad + sum_ll - 0.5 * log_det;

            if obj.is_finite() && (iter == 0 || obj >= prev_obj - 1e-12) {
                accepted = true;
                break;
            }
            lr *= 0.5;
        }

        if !accepted {
            na_or_inf = true;
            log::warn!("Laplace Newton backtracking exhausted for one cluster; rolling back mode");
            break;
        }

        mode = trial_mode;
        last_cache = Some(cache);
        last_grad = grad;
        last_w = w;
        last_a_vec = a_vec_trial;

        let rel_change = (obj - prev_obj).abs() / obj.abs().max(1.0);
        prev_obj = obj;
        if iter > 0 && rel_change < opts.delta_rel_conv {
            break;
        }
    }

    let cache = last_cache.ok_or_else(|| GpremError::InnerDiverged("Newton loop produced no accepted step".into()))?;

    Ok(LaplaceResult {
        mode,
        a_vec: last_a_vec,
        approx_marginal_ll: prev_obj,
        first_deriv_log_lik: last_grad,
        diag_information_log_lik: last_w,
        cache,
        na_or_inf,
        iterations,
    })
}

/// `log|I + Ψ W|`, the log-determinant term of the approximate marginal
/// log-likelihood. The dense path's cached Cholesky factor already *is*
/// `chol(I + W^½ Ψ W^½)`, so its log-determinant is the answer directly.
/// The RE-scale Woodbury and FITC paths factor a smaller reduced system, so
/// their log-determinants need the Sylvester-identity correction that maps
/// the reduced factor's determinant back onto `|I + ΨW|`.
pub(crate) fn log_det_for(cache: &FactorizationCache, w: &Array1<f64>) -> f64 {
    match cache {
        FactorizationCache::Dense { chol, .. } => log_det_from_chol(chol),
        FactorizationCache::GroupedWoodbury { chol_m, sigma_inv_diag, .. } => {
            // |I + ΨW| = |Σ_re| |M| = |M| / |Σ_re⁻¹|.
            log_det_from_chol(chol_m) - sigma_inv_diag.iter().map(|v| v.ln()).sum::<f64>()
        }
        FactorizationCache::Fitc { chol_m, chol_uu, d_plus_w_inv, .. } => {
            let sum_ln_w: f64 = w.iter().map(|v| v.ln()).sum();
            let sum_ln_d_plus_w_inv: f64 = d_plus_w_inv.iter().map(|v| v.ln()).sum();
            sum_ln_w + sum_ln_d_plus_w_inv - log_det_from_chol(chol_uu) + log_det_from_chol(chol_m)
        }
        FactorizationCache::Vecchia { d, .. } => d.iter().map(|v| v.ln()).sum(),
    }
}

/// Solve `(Σ⁻¹ + W) x = rhs` (or, for the Woodbury path, its RE-scale
/// analogue) using whichever structural cache [`covariance::factorize`]
/// produced. For the `Dense`/`Vecchia`/`Fitc` caches this is exactly the
/// posterior-covariance operator `Σ_post = (K⁻¹+W)⁻¹` applied to `rhs`;
/// reused by the gradient engine for the same reason the Newton loop needs
/// it.
pub(crate) fn solve_newton_system(
    cache: &FactorizationCache,
    registry: &ComponentRegistry,
    rhs: &Array1<f64>,
    w: &Array1<f64>,
    cg_max_iter: usize,
    cg_delta_conv: f64,
) -> Result<Array1<f64>> {
    match cache {
        FactorizationCache::Dense { psi, chol, .. } => {
            let psi_rhs = psi.dot(rhs);
            let sw: Array1<f64> = w.mapv(f64::sqrt);
            let tmp = chol_solve(chol, &(&sw * &psi_rhs));
            Ok(&psi_rhs - &(&sw * &tmp))
        }
        FactorizationCache::GroupedWoodbury { chol_m, .. } => {
            let mut rhs_re = Array1::<f64>::zeros(chol_m.nrows());
            let mut offset = 0usize;
            for comp in &registry.components {
                let n = comp.num_re();
                let contrib = comp.incidence.apply_transpose(rhs);
                for k in 0..n {
                    rhs_re[offset + k] = contrib[k];
                }
                offset += n;
            }
            Ok(chol_solve(chol_m, &rhs_re))
        }
        FactorizationCache::Vecchia { b, d, .. } => {
            let apply_a = |v: &Array1<f64>| -> Array1<f64> {
                let bv = b.matvec(v);
                let dinv_bv = &bv / d;
                let btdinv = b.matvec_transpose(&dinv_bv);
                &btdinv + &(w * v)
            };
            let (x, _iters) = crate::linalg::conjugate_gradient(apply_a, rhs, |v| v.clone(), cg_max_iter, cg_delta_conv);
            Ok(x)
        }
        FactorizationCache::Fitc { chol_m, sigma_nm, d_plus_w_inv, .. } => {
            let d_inv_rhs = rhs / d_plus_w_inv;
            let sm_t_rhs = sigma_nm.t().dot(&d_inv_rhs);
            let correction = chol_solve(chol_m, &sm_t_rhs);
            let sm_correction = sigma_nm.dot(&correction);
            Ok(&d_inv_rhs - &(&sm_correction / d_plus_w_inv))
        }
    }
}
