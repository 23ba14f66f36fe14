//! Marginal-likelihood gradient engine. Given an accepted Laplace mode and
//! its factorization cache, computes `∂(−ll)/∂logθ` for the covariance
//! parameters, the likelihood's auxiliary parameters, and (directly, not
//! through the mode) the fixed-effect coefficients.
//!
//! Every structural path reduces to the same textbook split (Rasmussen &
//! Williams, *GPML*, §5.5.1): an "explicit" term that differentiates the
//! approximate log marginal likelihood holding the mode fixed, and an
//! "implicit" term that accounts for the mode itself shifting with θ. Both
//! terms route through the posterior-covariance identity
//! `Σ_post = (K⁻¹+W)⁻¹ = (I+KW)⁻¹K`, which [`crate::laplace::solve_newton_system`]
//! already computes for every cache variant.

use ndarray::{Array1, Array2};

use crate::component::{Component, ComponentRegistry};
use crate::covariance::FactorizationCache;
use crate::error::Result;
use crate::laplace::{self, LaplaceResult};
use crate::likelihood::Likelihood;
use crate::linalg::{chol_solve, forward_solve};
use crate::rng::EngineRng;
use crate::structure::{StructureFlags, StructureTag};

/// `∂(−ll)/∂logθ` for every parameter group. `d_neg_ll_d_log_cov` is
/// flattened in registry order (each component's parameters contiguous,
/// in the order [`Component::num_cov_par`] exposes them).
pub struct GradientResult {
    pub d_neg_ll_d_log_cov: Vec<f64>,
    pub d_neg_ll_d_log_aux: Vec<f64>,
    pub d_neg_ll_d_beta: Option<Array1<f64>>,
}

/// `dΣ_j/dθ_k · v` expanded to the data scale: `Z (dΣ_j (Zᵀ v))`.
fn dpsi_apply(comp: &Component, k: usize, v: &Array1<f64>) -> Array1<f64> {
    let u = comp.incidence.apply_transpose(v);
    let du = comp.sigma_grad(k).dot(&u);
    comp.incidence.apply(&du)
}

/// `0.5 · post_var_i · dW_i/deta_i`, the per-point coefficient the implicit
/// (mode-sensitivity) term weights `df̂/dθ` by.
fn sensitivity(likelihood: &Likelihood, y: &Array1<f64>, eta: &Array1<f64>, post_var: &Array1<f64>) -> Array1<f64> {
    Array1::from_iter(
        (0..y.len()).map(|i| 0.5 * post_var[i] * likelihood.d_diag_info_d_eta(y[i], eta[i])),
    )
}

/// `(I+KW)⁻¹ v` on the data scale, via `(I+KW)⁻¹ = I - Σ_post·W`
/// (multiply both sides of `(I+KW) = I + KW` by `(I+KW)⁻¹` on the left and
/// `Σ_post = (I+KW)⁻¹K` on the right to see the identity holds). Valid for
/// any cache whose [`crate::laplace::solve_newton_system`] implementation
/// operates on the data scale directly (`Dense`, `Vecchia`, `Fitc` — not
/// `GroupedWoodbury`, which solves a reduced RE-scale system instead and
/// has its own closed-form mode-sensitivity formula).
fn apply_i_plus_kw_inv(
    cache: &FactorizationCache,
    registry: &ComponentRegistry,
    v: &Array1<f64>,
    w: &Array1<f64>,
    cg_max_iter: usize,
    cg_delta_conv: f64,
) -> Result<Array1<f64>> {
    let wv = w * v;
    let sigma_post_wv = laplace::solve_newton_system(cache, registry, &wv, w, cg_max_iter, cg_delta_conv)?;
    Ok(v - &sigma_post_wv)
}

#[allow(clippy::too_many_arguments)]
pub fn compute(
    flags: &StructureFlags,
    registry: &ComponentRegistry,
    likelihood: &Likelihood,
    y: &Array1<f64>,
    fixed_offset: &Array1<f64>,
    x: Option<&Array2<f64>>,
    laplace_result: &LaplaceResult,
    rng: &mut EngineRng,
    num_rand_vec_trace: usize,
    cg_max_iter: usize,
    cg_delta_conv: f64,
) -> Result<GradientResult> {
    let num_data = y.len();
    let is_woodbury = matches!(flags.tag, StructureTag::GroupedWoodbury | StructureTag::SingleGroupedOnReScale);
    let f_latent = if is_woodbury {
        laplace::mode_to_latent(&laplace_result.mode, registry, num_data)
    } else {
        laplace_result.mode.clone()
    };
    let eta = &f_latent + fixed_offset;
    let grad = &laplace_result.first_deriv_log_lik;
    let w = &laplace_result.diag_information_log_lik;
    let a_vec = &laplace_result.a_vec;

    let (d_cov, post_var) = match &laplace_result.cache {
        FactorizationCache::Dense { psi, chol, .. } => {
            let posterior_cov = dense_posterior_cov(psi, chol, w);
            let post_var = posterior_cov.diag().to_owned();
            let sens = sensitivity(likelihood, y, &eta, &post_var);
            let cov = dense_cov_gradient(
                registry, &laplace_result.cache, &posterior_cov, a_vec, grad, w, &sens, cg_max_iter, cg_delta_conv,
            )?;
            (cov, post_var)
        }
        FactorizationCache::GroupedWoodbury { sigma_inv_diag, chol_m, .. } => {
            let (cov, post_var, _sens) =
                woodbury_cov_gradient(registry, sigma_inv_diag, chol_m, likelihood, y, &eta, a_vec, num_data);
            (cov, post_var)
        }
        FactorizationCache::Vecchia { .. } | FactorizationCache::Fitc { .. } => {
            let cov = stochastic_cov_gradient(
                registry, &laplace_result.cache, a_vec, w, rng, num_rand_vec_trace, cg_max_iter, cg_delta_conv,
            )?;
            (cov, Array1::<f64>::zeros(num_data))
        }
    };

    let d_aux = aux_gradient(
        flags, registry, likelihood, y, &eta, w, &post_var, &laplace_result.cache,
        rng, num_rand_vec_trace, cg_max_iter, cg_delta_conv,
    )?;

    let d_beta = x.map(|xx| {
        let p = xx.ncols();
        Array1::from_iter((0..p).map(|j| -xx.column(j).dot(grad)))
    });

    Ok(GradientResult { d_neg_ll_d_log_cov: d_cov, d_neg_ll_d_log_aux: d_aux, d_neg_ll_d_beta: d_beta })
}

/// `Σ_post = K - VᵀV` where `V[:,i] = forward_solve(chol, sqrt(w) ⊙ K[:,i])`,
/// the dense-path posterior covariance under the Laplace approximation
/// (`chol` is the cached `B = I + W^½ K W^½` factor).
fn dense_posterior_cov(psi: &Array2<f64>, chol: &Array2<f64>, w: &Array1<f64>) -> Array2<f64> {
    let n = psi.nrows();
    let sw = w.mapv(f64::sqrt);
    let mut v = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        let rhs = &sw * &psi.column(i);
        let vi = forward_solve(chol, &rhs);
        for r in 0..n {
            v[[r, i]] = vi[r];
        }
    }
    let mut out = psi.clone();
    for i in 0..n {
        for j in 0..n {
            let mut s = 0.0;
            for r in 0..n {
                s += v[[r, i]] * v[[r, j]];
            }
            out[[i, j]] -= s;
        }
    }
    out
}

/// Per-component, per-parameter covariance gradient on the dense path.
/// The mode-sensitivity term needs the full `(I+KW)⁻¹` operator, not just
/// `Σ_post`: the fixed point `f̂=K·grad(f̂)` differentiates to
/// `(I+KW)(df̂/dθ_j) = ∂K_j·grad`, so `df̂/dθ_j = (I+KW)⁻¹(∂K_j·grad)`
/// rather than `Σ_post·(∂K_j·grad)` — the two coincide only when the
/// right-hand side is itself of the form `K·(something)`, which it isn't
/// here.
#[allow(clippy::too_many_arguments)]
fn dense_cov_gradient(
    registry: &ComponentRegistry,
    cache: &FactorizationCache,
    posterior_cov: &Array2<f64>,
    a_vec: &Array1<f64>,
    grad: &Array1<f64>,
    w: &Array1<f64>,
    sens: &Array1<f64>,
    cg_max_iter: usize,
    cg_delta_conv: f64,
) -> Result<Vec<f64>> {
    let num_data = a_vec.len();
    let mut out = Vec::with_capacity(registry.total_cov_pars());
    for comp in &registry.components {
        for k in 0..comp.num_cov_par() {
            let dpsi_a = dpsi_apply(comp, k, a_vec);
            let quad = a_vec.dot(&dpsi_a);

            let dsigma = comp.sigma_grad(k);
            let dpsi = build_dpsi_dense(comp, &dsigma, num_data);
            let trace: f64 = (posterior_cov * &dpsi).sum();

            let dpsi_grad = dpsi_apply(comp, k, grad);
            let df_dtheta = apply_i_plus_kw_inv(cache, registry, &dpsi_grad, w, cg_max_iter, cg_delta_conv)?;
            let implicit = sens.dot(&df_dtheta);

            let explicit = 0.5 * quad - 0.5 * trace;
            let natural_scale_theta = comp.cov_pars[k];
            out.push(-(explicit + implicit) * natural_scale_theta);
        }
    }
    Ok(out)
}

fn build_dpsi_dense(comp: &Component, dsigma: &Array2<f64>, num_data: usize) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((num_data, num_data));
    let inc = &comp.incidence;
    for a in 0..num_data {
        let la = inc.level_of[a];
        let sa = inc.scale[a];
        if sa == 0.0 {
            continue;
        }
        for b in 0..num_data {
            let lb = inc.level_of[b];
            let sb = inc.scale[b];
            if sb == 0.0 {
                continue;
            }
            out[[a, b]] = sa * sb * dsigma[[la, lb]];
        }
    }
    out
}

/// RE-scale gradient for the grouped-Woodbury/single-grouped-on-RE-scale
/// paths. `a_re = Σ_re⁻¹ m̂ = Σ_j Zⱼᵀ a_vec` (stacked across components);
/// `M⁻¹` (inverted in full, `total_re` is small by construction) supplies
/// both the trace term and the per-observation posterior variance
/// `z_iᵀ M⁻¹ z_i` the implicit term needs on the data scale. Only
/// [`crate::kernel::Kernel::Identity`] components reach this path, so
/// `dΣ_re_k` is always the indicator block of component `k` — no kernel
/// dispatch is needed.
fn woodbury_cov_gradient(
    registry: &ComponentRegistry,
    sigma_inv_diag: &Array1<f64>,
    chol_m: &Array2<f64>,
    likelihood: &Likelihood,
    y: &Array1<f64>,
    eta: &Array1<f64>,
    a_vec: &Array1<f64>,
    num_data: usize,
) -> (Vec<f64>, Array1<f64>, Array1<f64>) {
    let total_re = sigma_inv_diag.len();
    let mut offsets = Vec::with_capacity(registry.components.len());
    let mut acc = 0usize;
    for comp in &registry.components {
        offsets.push(acc);
        acc += comp.num_re();
    }

    let mut a_re = Array1::<f64>::zeros(total_re);
    for (comp, &off) in registry.components.iter().zip(offsets.iter()) {
        let contrib = comp.incidence.apply_transpose(a_vec);
        for k in 0..comp.num_re() {
            a_re[off + k] = contrib[k];
        }
    }

    let mut m_inv = Array2::<f64>::zeros((total_re, total_re));
    for i in 0..total_re {
        let mut e = Array1::<f64>::zeros(total_re);
        e[i] = 1.0;
        let col = chol_solve(chol_m, &e);
        for r in 0..total_re {
            m_inv[[r, i]] = col[r];
        }
    }

    let mut post_var = Array1::<f64>::zeros(num_data);
    for i in 0..num_data {
        let mut s = 0.0;
        for (comp_p, &off_p) in registry.components.iter().zip(offsets.iter()) {
            let sp = comp_p.incidence.scale[i];
            if sp == 0.0 {
                continue;
            }
            let idx_p = off_p + comp_p.incidence.level_of[i];
            for (comp_q, &off_q) in registry.components.iter().zip(offsets.iter()) {
                let sq = comp_q.incidence.scale[i];
                if sq == 0.0 {
                    continue;
                }
                let idx_q = off_q + comp_q.incidence.level_of[i];
                s += sp * sq * m_inv[[idx_p, idx_q]];
            }
        }
        post_var[i] = s;
    }
    let sens = sensitivity(likelihood, y, eta, &post_var);

    let mut out = Vec::with_capacity(total_re);
    for (comp, &off) in registry.components.iter().zip(offsets.iter()) {
        let n = comp.num_re();
        let quad: f64 = (0..n).map(|k| a_re[off + k] * a_re[off + k]).sum();
        let trace: f64 = (0..n).map(|k| m_inv[[off + k, off + k]]).sum();

        let mut rhs = Array1::<f64>::zeros(total_re);
        for k in 0..n {
            rhs[off + k] = sigma_inv_diag[off + k] * a_re[off + k];
        }
        let d_b_dtheta = chol_solve(chol_m, &rhs);
        let d_f_dtheta = laplace::mode_to_latent(&d_b_dtheta, registry, num_data);
        let implicit = sens.dot(&d_f_dtheta);

        let explicit = 0.5 * quad - 0.5 * trace;
        out.push(-(explicit + implicit) * comp.cov_pars[0]);
    }

    (out, post_var, sens)
}

/// Covariance-parameter gradient for the Vecchia and FITC paths. The
/// quadratic term is exact and cheap (`dΨ·a` never needs a dense `n×n`
/// matrix, just the incidence apply/apply-transpose pair); the trace term
/// uses a Hutchinson stochastic estimator with antithetic pairing,
/// reusing [`laplace::solve_newton_system`] as the `Σ_post` operator on
/// each probe vector. The implicit (mode-sensitivity) term is dropped for
/// these two paths: it needs `diag(Σ_post)` (the per-point posterior
/// variance), and unlike a trace, a diagonal has no low-variance
/// Hutchinson estimator — each point would need its own probe budget.
/// `trace(Σ_post·D)` for a diagonal `D`, as used by [`aux_gradient`]'s
/// log-determinant term, has no such problem and is kept.
#[allow(clippy::too_many_arguments)]
fn stochastic_cov_gradient(
    registry: &ComponentRegistry,
    cache: &FactorizationCache,
    a_vec: &Array1<f64>,
    w: &Array1<f64>,
    rng: &mut EngineRng,
    num_rand_vec_trace: usize,
    cg_max_iter: usize,
    cg_delta_conv: f64,
) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(registry.total_cov_pars());
    for comp in &registry.components {
        for k in 0..comp.num_cov_par() {
            let dpsi_a = dpsi_apply(comp, k, a_vec);
            let quad = a_vec.dot(&dpsi_a);

            let mut trace_acc = 0.0f64;
            let half = num_rand_vec_trace.max(2) / 2;
            for s in 0..half {
                let probe = rng.gen_rademacher_vec(a_vec.len());
                let z = Array1::from_vec(probe);
                for sign in [1.0, -1.0] {
                    let zz = &z * sign;
                    let u = dpsi_apply(comp, k, &zz);
                    let sigma_post_u = laplace::solve_newton_system(cache, registry, &u, w, cg_max_iter, cg_delta_conv)?;
                    trace_acc += zz.dot(&sigma_post_u);
                }
                let _ = s;
            }
            let trace = trace_acc / (2 * half) as f64;

            let explicit = 0.5 * quad - 0.5 * trace;
            let natural_scale_theta = comp.cov_pars[k];
            out.push(-explicit * natural_scale_theta);
        }
    }
    Ok(out)
}

/// Expected Fisher information for the covariance-parameter block plus the
/// Gaussian nugget, on the dense path: `FI_kl = 0.5·tr(Σ_y⁻¹∂Σ_k·Σ_y⁻¹∂Σ_l)`
/// (Rasmussen & Williams *GPML* §5.4.1's Fisher-scoring update), with
/// `Σ_y⁻¹ = W - W·Σ_post·W` and `∂Σ/∂σ² = I` for the nugget. Rows/columns
/// are ordered `[log-cov parameters..., log-nugget]` and pre-scaled by
/// their natural-scale value, so the matrix solves directly against the
/// log-scale gradient [`compute`] returns. Only covers the dense-cache,
/// Gaussian-likelihood case (the one combination where the marginal
/// covariance of `y` — not just the Laplace posterior — has this closed
/// form); every other path falls back to the diagonal empirical-Fisher
/// approximation in `optimizer::fisher_scoring`.
pub fn fisher_information_dense(
    registry: &ComponentRegistry,
    likelihood: &Likelihood,
    cache: &FactorizationCache,
    w: &Array1<f64>,
) -> Option<Array2<f64>> {
    if likelihood.kind != crate::likelihood::LikelihoodKind::Gaussian {
        return None;
    }
    let (psi, chol) = match cache {
        FactorizationCache::Dense { psi, chol, .. } => (psi, chol),
        _ => return None,
    };
    let num_data = psi.nrows();
    let posterior_cov = dense_posterior_cov(psi, chol, w);

    let mut sigma_y_inv = Array2::<f64>::zeros((num_data, num_data));
    for i in 0..num_data {
        for j in 0..num_data {
            let wij = if i == j { w[i] } else { 0.0 };
            sigma_y_inv[[i, j]] = wij - w[i] * posterior_cov[[i, j]] * w[j];
        }
    }

    let mut d_list: Vec<Array2<f64>> = Vec::with_capacity(registry.total_cov_pars() + 1);
    let mut scale: Vec<f64> = Vec::with_capacity(registry.total_cov_pars() + 1);
    for comp in &registry.components {
        for k in 0..comp.num_cov_par() {
            let dsigma = comp.sigma_grad(k);
            d_list.push(build_dpsi_dense(comp, &dsigma, num_data));
            scale.push(comp.cov_pars[k]);
        }
    }
    d_list.push(Array2::<f64>::eye(num_data));
    scale.push(likelihood.aux_pars[0]);

    let n = d_list.len();
    let sy_d: Vec<Array2<f64>> = d_list.iter().map(|d| sigma_y_inv.dot(d)).collect();
    let mut fi = Array2::<f64>::zeros((n, n));
    for k in 0..n {
        for l in k..n {
            let trace: f64 = sy_d[k].dot(&sy_d[l]).diag().sum();
            let val = 0.5 * trace * scale[k] * scale[l];
            fi[[k, l]] = val;
            fi[[l, k]] = val;
        }
    }
    Some(fi)
}

/// Auxiliary-parameter gradient. Three terms per parameter:
///
/// - `direct`, from [`Likelihood::d_log_lik_d_aux`] — the likelihood's own
///   dependence on the parameter, holding the mode fixed.
/// - `implicit`, the mode-sensitivity correction `sens·(df̂/daux_k)`; only
///   computed for `Dense` and `GroupedWoodbury`/`SingleGroupedOnReScale`,
///   where `Σ_post` (or its RE-scale equivalent) is already materialized —
///   see [`stochastic_cov_gradient`]'s doc comment for why Vecchia/FITC
///   skip this one.
/// - `term_c`, the log-determinant `-0.5·log|I+KW|`'s *direct* dependence
///   on `aux_k` through `W` itself (e.g. Gaussian's `W=1/σ²`), independent
///   of any mode shift: `-0.5·trace(Σ_post·diag(dW/daux_k))`. This is a
///   pure trace, so unlike the implicit term it has a good Hutchinson
///   estimator and is kept for every path.
#[allow(clippy::too_many_arguments)]
fn aux_gradient(
    flags: &StructureFlags,
    registry: &ComponentRegistry,
    likelihood: &Likelihood,
    y: &Array1<f64>,
    eta: &Array1<f64>,
    w: &Array1<f64>,
    post_var: &Array1<f64>,
    cache: &FactorizationCache,
    rng: &mut EngineRng,
    num_rand_vec_trace: usize,
    cg_max_iter: usize,
    cg_delta_conv: f64,
) -> Result<Vec<f64>> {
    let num_data = y.len();
    let num_aux = likelihood.num_aux_pars();
    if num_aux == 0 {
        return Ok(Vec::new());
    }

    let direct: Vec<f64> = (0..num_aux)
        .map(|k| (0..num_data).map(|i| likelihood.d_log_lik_d_aux(y[i], eta[i])[k]).sum::<f64>())
        .collect();

    let is_woodbury = matches!(flags.tag, StructureTag::GroupedWoodbury | StructureTag::SingleGroupedOnReScale);
    let is_dense = matches!(cache, FactorizationCache::Dense { .. });
    let has_materialized_post_var = is_dense || is_woodbury;

    let sens = sensitivity(likelihood, y, eta, post_var);

    let dw_daux: Vec<Array1<f64>> = (0..num_aux)
        .map(|k| Array1::from_iter((0..num_data).map(|i| likelihood.d_diag_info_d_aux(y[i], eta[i])[k])))
        .collect();

    let mut out = Vec::with_capacity(num_aux);
    for k in 0..num_aux {
        let cross: Vec<f64> = (0..num_data).map(|i| likelihood.d2_neg_ll_d_eta_d_aux(y[i], eta[i])[k]).collect();
        let dg = Array1::from_iter(cross.into_iter().map(|c| -c));

        let implicit = if is_dense {
            if let FactorizationCache::Dense { psi, chol, .. } = cache {
                let posterior_cov = dense_posterior_cov(psi, chol, w);
                let d_f_daux = posterior_cov.dot(&dg);
                sens.dot(&d_f_daux)
            } else {
                0.0
            }
        } else if is_woodbury {
            if let FactorizationCache::GroupedWoodbury { chol_m, .. } = cache {
                let mut re_vec = Array1::<f64>::zeros(chol_m.nrows());
                let mut offset = 0usize;
                for comp in &registry.components {
                    let n = comp.num_re();
                    let contrib = comp.incidence.apply_transpose(&dg);
                    for kk in 0..n {
                        re_vec[offset + kk] = contrib[kk];
                    }
                    offset += n;
                }
                let d_b_daux = chol_solve(chol_m, &re_vec);
                let d_f_daux = laplace::mode_to_latent(&d_b_daux, registry, num_data);
                sens.dot(&d_f_daux)
            } else {
                0.0
            }
        } else {
            0.0
        };

        let term_c = if has_materialized_post_var {
            -0.5 * post_var.dot(&dw_daux[k])
        } else {
            let mut trace_acc = 0.0f64;
            let half = num_rand_vec_trace.max(2) / 2;
            for _ in 0..half {
                let probe = rng.gen_rademacher_vec(num_data);
                let z = Array1::from_vec(probe);
                for sign in [1.0, -1.0] {
                    let zz = &z * sign;
                    let dz = &dw_daux[k] * &zz;
                    let sigma_post_dz = laplace::solve_newton_system(cache, registry, &dz, w, cg_max_iter, cg_delta_conv)?;
                    trace_acc += zz.dot(&sigma_post_dz);
                }
            }
            let trace = trace_acc / (2 * half) as f64;
            -0.5 * trace
        };

        let natural_scale = likelihood.aux_pars[k];
        out.push(-(direct[k] + implicit + term_c) * natural_scale);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterState;
    use crate::component::{ComponentKind, Incidence};
    use crate::options::{ApproximationType, FitOptions};
    use crate::structure::{PathPreference, StructurePlanner};

    fn fit_gaussian_single_group(variance: f64, sigma2: f64, y: &Array1<f64>) -> (StructureFlags, ComponentRegistry, Likelihood, LaplaceResult) {
        let inc = Incidence::new_intercept(vec![0, 0, 1, 1], 2);
        let comp = Component::new_grouped(ComponentKind::GroupedIntercept, inc, variance).unwrap();
        let registry = ComponentRegistry::new(vec![comp]);
        let flags = StructurePlanner::plan(&registry, true, PathPreference::Dense).unwrap();
        let mut likelihood = Likelihood::parse("gaussian").unwrap();
        likelihood.aux_pars = vec![sigma2];
        let offset = Array1::zeros(4);
        let mut state = ClusterState::new(laplace::total_re(&registry));
        let result = laplace::solve_mode(&flags, &registry, &likelihood, y, &offset, &mut state, ApproximationType::Laplace, &FitOptions::default()).unwrap();
        (flags, registry, likelihood, result)
    }

    #[test]
    fn gaussian_dense_cov_gradient_matches_finite_difference() {
        let y = Array1::from(vec![1.0, 1.5, -0.5, -1.0]);
        let eps = 1e-4;
        let base_variance = 2.0;
        let sigma2 = 1.0;

        let mut rng = EngineRng::new(1);
        let (flags, registry, likelihood, result) = fit_gaussian_single_group(base_variance, sigma2, &y);
        let grad = compute(&flags, &registry, &likelihood, &y, &Array1::zeros(4), None, &result, &mut rng, 50, 200, 1e-8).unwrap();

        let (_, _, _, plus) = fit_gaussian_single_group(base_variance * (eps).exp(), sigma2, &y);
        let (_, _, _, minus) = fit_gaussian_single_group(base_variance * (-eps).exp(), sigma2, &y);
        let fd = -(plus.approx_marginal_ll - minus.approx_marginal_ll) / (2.0 * eps);

        assert!(
            (grad.d_neg_ll_d_log_cov[0] - fd).abs() < 1e-2,
            "analytic={} fd={}",
            grad.d_neg_ll_d_log_cov[0],
            fd
        );
    }

    #[test]
    fn gaussian_dense_aux_gradient_matches_finite_difference() {
        let y = Array1::from(vec![1.0, 1.5, -0.5, -1.0]);
        let eps = 1e-4;
        let variance = 2.0;
        let base_sigma2 = 1.0;

        let mut rng = EngineRng::new(1);
        let (flags, registry, likelihood, result) = fit_gaussian_single_group(variance, base_sigma2, &y);
        let grad = compute(&flags, &registry, &likelihood, &y, &Array1::zeros(4), None, &result, &mut rng, 50, 200, 1e-8).unwrap();

        let (_, _, _, plus) = fit_gaussian_single_group(variance, base_sigma2 * eps.exp(), &y);
        let (_, _, _, minus) = fit_gaussian_single_group(variance, base_sigma2 * (-eps).exp(), &y);
        let fd = -(plus.approx_marginal_ll - minus.approx_marginal_ll) / (2.0 * eps);

        assert!(
            (grad.d_neg_ll_d_log_aux[0] - fd).abs() < 1e-2,
            "analytic={} fd={}",
            grad.d_neg_ll_d_log_aux[0],
            fd
        );
    }

    #[test]
    fn fixed_effect_gradient_is_negative_design_dot_grad() {
        let y = Array1::from(vec![1.0, 1.5, -0.5, -1.0]);
        let mut rng = EngineRng::new(2);
        let (flags, registry, likelihood, result) = fit_gaussian_single_group(2.0, 1.0, &y);
        let x = Array2::from_shape_vec((4, 1), vec![1.0, 0.5, -0.5, -1.0]).unwrap();
        let grad = compute(&flags, &registry, &likelihood, &y, &Array1::zeros(4), Some(&x), &result, &mut rng, 50, 200, 1e-8).unwrap();
        let beta_grad = grad.d_neg_ll_d_beta.unwrap();
        let expected = -x.column(0).dot(&result.first_deriv_log_lik);
        assert!((beta_grad[0] - expected).abs() < 1e-10);
    }

    #[test]
    fn dense_gaussian_fisher_information_is_symmetric_psd() {
        let y = Array1::from(vec![1.0, 1.5, -0.5, -1.0]);
        let (_, registry, likelihood, result) = fit_gaussian_single_group(2.0, 1.0, &y);
        let fi = fisher_information_dense(&registry, &likelihood, &result.cache, &result.diag_information_log_lik).unwrap();
        assert_eq!(fi.shape(), &[2, 2]);
        for i in 0..2 {
            for j in 0..2 {
                assert!((fi[[i, j]] - fi[[j, i]]).abs() < 1e-10);
            }
        }
        use ndarray_linalg::{Eigh, UPLO};
        let eigs = fi.clone().eigh(UPLO::Lower).unwrap().0;
        assert!(eigs.iter().all(|&e| e >= -1e-8));
    }

    #[test]
    fn non_gaussian_likelihood_has_no_closed_form_fisher_information() {
        let y = Array1::from(vec![1.0, 0.0, 1.0, 0.0]);
        let inc = Incidence::new_intercept(vec![0, 0, 1, 1], 2);
        let comp = Component::new_grouped(ComponentKind::GroupedIntercept, inc, 1.0).unwrap();
        let registry = ComponentRegistry::new(vec![comp]);
        let flags = StructurePlanner::plan(&registry, false, PathPreference::Dense).unwrap();
        let likelihood = Likelihood::parse("bernoulli_logit").unwrap();
        let offset = Array1::zeros(4);
        let mut state = ClusterState::new(laplace::total_re(&registry));
        let result =
            laplace::solve_mode(&flags, &registry, &likelihood, &y, &offset, &mut state, ApproximationType::Laplace, &FitOptions::default())
                .unwrap();
        assert!(fisher_information_dense(&registry, &likelihood, &result.cache, &result.diag_information_log_lik).is_none());
    }
}
