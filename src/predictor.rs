//! Prediction: training-data random-effect recovery, new-location latent
//! mean/variance under whichever structural path is active, and
//! response-scale prediction via adaptive Gauss-Hermite quadrature.
//!
//! The latent predictive mean at any point (training or new) is always
//! `k*ᵀ a`, where `a` is [`crate::laplace::LaplaceResult::a_vec`] — the
//! Laplace "pseudo-response" (`(y-f̂)/σ²` for Gaussian, `∇log p(y|f̂)`
//! otherwise) that every structural path already produces on the data
//! scale. Predictive variance reuses the same posterior-covariance
//! operator the gradient engine uses (`Σ_post = (K⁻¹+W)⁻¹`), via the
//! Woodbury identity `(K+W⁻¹)⁻¹ = W - W Σ_post W`:
//!
//! `Var[f*] = k** - (w⊙k*)ᵀk* + (w⊙k*)ᵀ Σ_post (w⊙k*)`
//!
//! except on the grouped-Woodbury path, whose posterior covariance lives
//! on the (smaller) random-effect scale directly as `M⁻¹`, with no `k*`
//! projection needed.

use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh, UPLO};

use crate::component::ComponentRegistry;
use crate::covariance::FactorizationCache;
use crate::error::{GpremError, Result};
use crate::laplace::{self, LaplaceResult};
use crate::likelihood::Likelihood;
use crate::linalg::chol_solve;
use crate::rng::EngineRng;
use crate::structure::{StructureFlags, StructureTag};

/// One component's contribution to a query point, supplied by the caller
/// (the engine, which knows the new point's group memberships/coordinates).
#[derive(Debug, Clone)]
pub enum ComponentQuery {
    /// Grouped component: `Some(level)` for an existing training level (an
    /// index into that component's `num_re`), `None` for a group never
    /// seen during training (zero correlation with training data, full
    /// prior variance).
    GroupedLevel(Option<usize>),
    /// GP component: distance from the query point to each of the
    /// component's `num_re` training locations.
    GpDistance(Array1<f64>),
}

/// Latent-scale prediction at one point.
#[derive(Debug, Clone)]
pub struct LatentPrediction {
    pub mean: f64,
    pub variance: Option<f64>,
}

/// Per-component posterior mean of the random effects themselves
/// (`Σ_j · (Zⱼᵀ a)`, on each component's latent/RE scale), recovered from
/// the training fit. Used both to report fitted random effects and as the
/// building block for new-location prediction.
pub fn training_random_effects(registry: &ComponentRegistry, laplace_result: &LaplaceResult) -> Vec<Array1<f64>> {
    registry
        .components
        .iter()
        .map(|comp| {
            let zt_a = comp.incidence.apply_transpose(&laplace_result.a_vec);
            comp.build_sigma().dot(&zt_a)
        })
        .collect()
}

fn cross_cov_to_training(registry: &ComponentRegistry, query: &[ComponentQuery], num_data: usize) -> Result<(Array1<f64>, f64)> {
    if query.len() != registry.components.len() {
        return Err(GpremError::ShapeMismatch("one query entry required per component".into()));
    }
    let mut k_star = Array1::<f64>::zeros(num_data);
    let mut k_star_star = 0.0f64;
    for (comp, q) in registry.components.iter().zip(query.iter()) {
        k_star_star += comp.cov_pars[0];
        match q {
            ComponentQuery::GroupedLevel(Some(level)) => {
                let variance = comp.cov_pars[0];
                for i in 0..num_data {
                    if comp.incidence.level_of[i] == *level {
                        k_star[i] += comp.incidence.scale[i] * variance;
                    }
                }
            }
            ComponentQuery::GroupedLevel(None) => {}
            ComponentQuery::GpDistance(dist) => {
                if dist.len() != comp.num_re() {
                    return Err(GpremError::ShapeMismatch(
                        "GP query distance vector must cover every training location".into(),
                    ));
                }
                let cross = comp.kernel.cross_cov(dist, comp.kernel_params());
                for i in 0..num_data {
                    let lvl = comp.incidence.level_of[i];
                    k_star[i] += comp.incidence.scale[i] * cross[lvl];
                }
            }
        }
    }
    Ok((k_star, k_star_star))
}

/// Exact quadratic form `eᵀ M⁻¹ e` on the grouped-Woodbury reduced system,
/// where `e` places the query's level (one entry per component with a
/// known level; unseen-group components instead contribute their full
/// prior variance directly, since they have no row/column in `M`).
fn woodbury_new_point(registry: &ComponentRegistry, chol_m: &Array2<f64>, query: &[ComponentQuery]) -> Result<(f64, f64)> {
    let total_re = crate::laplace::total_re(registry);
    let mut e = Array1::<f64>::zeros(total_re);
    let mut prior_only_variance = 0.0f64;
    let mut offset = 0usize;
    let mut any_known = false;
    for (comp, q) in registry.components.iter().zip(query.iter()) {
        match q {
            ComponentQuery::GroupedLevel(Some(level)) => {
                e[offset + level] += 1.0;
                any_known = true;
            }
            ComponentQuery::GroupedLevel(None) => prior_only_variance += comp.cov_pars[0],
            ComponentQuery::GpDistance(_) => {
                return Err(GpremError::IncompatibleStructure(
                    "grouped-Woodbury prediction does not support GP components".into(),
                ))
            }
        }
        offset += comp.num_re();
    }
    let extra = if any_known {
        let minv_e = chol_solve(chol_m, &e);
        e.dot(&minv_e)
    } else {
        0.0
    };
    Ok((prior_only_variance, extra))
}

/// Monte Carlo estimate of `wkᵀ Σ_post wk` on the Vecchia path, where
/// `Σ_post = (K⁻¹+W)⁻¹` and the sparse precision factor `K⁻¹ ≈ BᵀD⁻¹B`
/// gives a cheap way to draw `r ~ N(0, K⁻¹+W)`: `Bᵀ(D^-0.5⊙z₁) ~ N(0, K⁻¹)`
/// (its covariance is `Bᵀ D⁻¹ B` by construction) plus `(W^0.5)⊙z₂ ~ N(0, W)`
/// (`W` diagonal). Solving `(K⁻¹+W)x = r` via the same CG operator
/// `solve_newton_system` already runs for the exact quadratic form gives
/// posterior draws `x ~ N(0, Σ_post)`; `wkᵀx` is then a zero-mean draw
/// whose second moment is exactly the target quadratic form, averaged
/// over `nsim` draws.
fn simulate_vecchia_quadratic_form(
    registry: &ComponentRegistry,
    cache: &FactorizationCache,
    w: &Array1<f64>,
    wk: &Array1<f64>,
    rng: &mut EngineRng,
    nsim: usize,
    cg_max_iter: usize,
    cg_delta_conv: f64,
) -> Result<f64> {
    let (b, d) = match cache {
        FactorizationCache::Vecchia { b, d, .. } => (b, d),
        _ => return Err(GpremError::IncompatibleStructure("Vecchia predictive-variance simulation requires a Vecchia cache".into())),
    };
    let sqrt_d = d.mapv(f64::sqrt);
    let sqrt_w = w.mapv(f64::sqrt);
    let n = w.len();
    let nsim = nsim.max(1);

    let mut sum_sq = 0.0f64;
    for draw in 0..nsim {
        let mut prior_rng = EngineRng::new(rng.child_seed(draw as u64 * 2));
        let mut lik_rng = EngineRng::new(rng.child_seed(draw as u64 * 2 + 1));
        let z1 = Array1::from(prior_rng.gen_standard_normal_vec(n));
        let z2 = Array1::from(lik_rng.gen_standard_normal_vec(n));

        let prior_term = b.matvec_transpose(&(&z1 / &sqrt_d));
        let lik_term = &sqrt_w * &z2;
        let r = &prior_term + &lik_term;

        let x = laplace::solve_newton_system(cache, registry, &r, w, cg_max_iter, cg_delta_conv)?;
        let proj = wk.dot(&x);
        sum_sq += proj * proj;
    }
    Ok(sum_sq / nsim as f64)
}

/// Predict the latent value at one new point under whichever structural
/// path produced `laplace_result.cache`.
#[allow(clippy::too_many_arguments)]
pub fn predict_new_point(
    flags: &StructureFlags,
    registry: &ComponentRegistry,
    laplace_result: &LaplaceResult,
    query: &[ComponentQuery],
    predict_var: bool,
    cg_max_iter: usize,
    cg_delta_conv: f64,
    rng: &mut EngineRng,
    nsim_var_pred: usize,
) -> Result<LatentPrediction> {
    let num_data = laplace_result.a_vec.len();
    let (k_star, k_star_star) = cross_cov_to_training(registry, query, num_data)?;
    let mean = k_star.dot(&laplace_result.a_vec);

    if !predict_var {
        return Ok(LatentPrediction { mean, variance: None });
    }

    let is_woodbury = matches!(flags.tag, StructureTag::GroupedWoodbury | StructureTag::SingleGroupedOnReScale);
    let variance = if is_woodbury {
        let chol_m = match &laplace_result.cache {
            FactorizationCache::GroupedWoodbury { chol_m, .. } => chol_m,
            _ => return Err(GpremError::IncompatibleStructure("expected a grouped-Woodbury cache".into())),
        };
        let (prior_only, extra) = woodbury_new_point(registry, chol_m, query)?;
        prior_only + extra
    } else {
        let w = &laplace_result.diag_information_log_lik;
        let wk = w * &k_star;
        let quad = if matches!(flags.tag, StructureTag::Vecchia) {
            simulate_vecchia_quadratic_form(registry, &laplace_result.cache, w, &wk, rng, nsim_var_pred, cg_max_iter, cg_delta_conv)?
        } else {
            let sigma_post_wk = laplace::solve_newton_system(&laplace_result.cache, registry, &wk, w, cg_max_iter, cg_delta_conv)?;
            wk.dot(&sigma_post_wk)
        };
        k_star_star - wk.dot(&k_star) + quad
    };

    Ok(LatentPrediction { mean, variance: Some(variance.max(0.0)) })
}

/// Golub-Welsch nodes/weights for `n`-point Gauss-Hermite quadrature:
/// eigenvalues/first-components of the tridiagonal Jacobi matrix for the
/// (physicists') Hermite polynomials.
fn gauss_hermite_nodes_weights(n: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut jacobi = Array2::<f64>::zeros((n, n));
    for i in 1..n {
        let off = (i as f64 / 2.0).sqrt();
        jacobi[[i, i - 1]] = off;
        jacobi[[i - 1, i]] = off;
    }
    let (eigvals, eigvecs) = jacobi.eigh(UPLO::Lower)?;
    let mu0 = std::f64::consts::PI.sqrt();
    let nodes: Vec<f64> = eigvals.to_vec();
    let weights: Vec<f64> = (0..n).map(|j| mu0 * eigvecs[[0, j]].powi(2)).collect();
    Ok((nodes, weights))
}

/// Response-scale prediction: `E[g(f*)]` for `f* ~ N(mean, var)` via
/// adaptive Gauss-Hermite quadrature, `g` being the likelihood's inverse
/// link. Falls back to the identity transform with `variance` untouched
/// when `var` is `None` or the likelihood has no curvature to integrate
/// over (caller still owns whether to report the latent or response
/// scale).
pub fn response_scale_prediction(likelihood: &Likelihood, latent: &LatentPrediction, num_gh_nodes: usize) -> Result<LatentPrediction> {
    let Some(var) = latent.variance else {
        return Ok(LatentPrediction { mean: likelihood.inverse_link(latent.mean), variance: None });
    };
    if var <= 0.0 {
        return Ok(LatentPrediction { mean: likelihood.inverse_link(latent.mean), variance: Some(0.0) });
    }
    let (nodes, weights) = gauss_hermite_nodes_weights(num_gh_nodes.max(2))?;
    let scale = (2.0 * var).sqrt();
    let inv_sqrt_pi = 1.0 / std::f64::consts::PI.sqrt();

    let mut mean = 0.0f64;
    for (x, w) in nodes.iter().zip(weights.iter()) {
        let f_star = latent.mean + scale * x;
        mean += w * likelihood.inverse_link(f_star);
    }
    mean *= inv_sqrt_pi;

    let mut second_moment = 0.0f64;
    for (x, w) in nodes.iter().zip(weights.iter()) {
        let f_star = latent.mean + scale * x;
        let g = likelihood.inverse_link(f_star);
        second_moment += w * g * g;
    }
    second_moment *= inv_sqrt_pi;
    let variance = (second_moment - mean * mean).max(0.0);

    Ok(LatentPrediction { mean, variance: Some(variance) })
}

/// Zero-fills the cross-cluster block: predictions for points in distinct
/// clusters never share covariance, so a multi-cluster predictive
/// covariance matrix is block-diagonal by construction. Exposed as a
/// standalone helper so the engine can assemble a full covariance matrix
/// across clusters without re-deriving this invariant at each call site.
pub fn zero_cross_cluster_block(n_a: usize, n_b: usize) -> Array2<f64> {
    Array2::zeros((n_a, n_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentKind, Incidence};
    use crate::kernel::Kernel;
    use crate::likelihood::Likelihood;
    use crate::options::FitOptions;
    use crate::structure::{PathPreference, StructurePlanner};
    use ndarray::arr1;

    #[test]
    fn gauss_hermite_integrates_identity_to_the_mean() {
        let (nodes, weights) = gauss_hermite_nodes_weights(20).unwrap();
        let inv_sqrt_pi = 1.0 / std::f64::consts::PI.sqrt();
        let mean_of_z: f64 = nodes.iter().zip(weights.iter()).map(|(x, w)| w * (2.0f64.sqrt() * x)).sum::<f64>() * inv_sqrt_pi;
        assert!(mean_of_z.abs() < 1e-8);

        let second: f64 = nodes.iter().zip(weights.iter()).map(|(x, w)| w * 2.0 * x * x).sum::<f64>() * inv_sqrt_pi;
        assert!((second - 1.0).abs() < 1e-6);
    }

    #[test]
    fn response_scale_identity_link_preserves_mean() {
        let lik = Likelihood::parse("gaussian").unwrap();
        let latent = LatentPrediction { mean: 2.0, variance: Some(0.5) };
        let resp = response_scale_prediction(&lik, &latent, 20).unwrap();
        assert!((resp.mean - 2.0).abs() < 1e-6);
    }

    #[test]
    fn unseen_grouped_level_gets_zero_mean_and_prior_variance() {
        let inc = Incidence::new_intercept(vec![0, 0, 1, 1], 2);
        let comp = Component::new_grouped(ComponentKind::GroupedIntercept, inc, 2.0).unwrap();
        let registry = ComponentRegistry::new(vec![comp]);
        let flags = StructurePlanner::plan(&registry, true, PathPreference::Dense).unwrap();
        let likelihood = Likelihood::parse("gaussian").unwrap();
        let y = arr1(&[1.0, 1.2, -0.8, -1.1]);
        let offset = Array1::zeros(4);
        let mut state = crate::cluster::ClusterState::new(crate::laplace::total_re(&registry));
        let result = laplace::solve_mode(&flags, &registry, &likelihood, &y, &offset, &mut state, crate::options::ApproximationType::Laplace, &FitOptions::default()).unwrap();

        let query = [ComponentQuery::GroupedLevel(None)];
        let mut rng = EngineRng::new(3);
        let pred = predict_new_point(&flags, &registry, &result, &query, true, 1000, 1e-3, &mut rng, 100).unwrap();
        assert!(pred.mean.abs() < 1e-10);
        assert!((pred.variance.unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn gp_component_new_point_at_training_location_recovers_training_mean() {
        let dist = arr1(&[0.0, 1.0]).to_owned();
        let dist_mat = ndarray::arr2(&[[0.0, 1.0], [1.0, 0.0]]);
        let inc = Incidence::new_intercept(vec![0, 1], 2);
        let comp = Component::new_gp(ComponentKind::GpIntercept, inc, Kernel::Exponential, dist_mat, 1.0, 1.0).unwrap();
        let registry = ComponentRegistry::new(vec![comp]);
        let flags = StructurePlanner::plan(&registry, true, PathPreference::Dense).unwrap();
        let likelihood = Likelihood::parse("gaussian").unwrap();
        let y = arr1(&[1.0, -1.0]);
        let offset = Array1::zeros(2);
        let mut state = crate::cluster::ClusterState::new(crate::laplace::total_re(&registry));
        let result = laplace::solve_mode(&flags, &registry, &likelihood, &y, &offset, &mut state, crate::options::ApproximationType::Laplace, &FitOptions::default()).unwrap();

        let train_re = training_random_effects(&registry, &result);
        let query = [ComponentQuery::GpDistance(dist.clone())];
        let mut rng = EngineRng::new(4);
        let pred = predict_new_point(&flags, &registry, &result, &query, false, 1000, 1e-3, &mut rng, 100).unwrap();
        assert!((pred.mean - train_re[0][0]).abs() < 1e-8);
    }

    fn chain_dist(n: usize) -> Array2<f64> {
        let mut dist = Array2::zeros((n, n));
        for i in 0..n {
            for j in 0..n {
                dist[[i, j]] = (i as f64 - j as f64).abs();
            }
        }
        dist
    }

    #[test]
    fn vecchia_simulated_variance_matches_dense_exact_variance_with_full_conditioning() {
        let n = 6;
        let dist = chain_dist(n);
        let y = arr1(&[0.4, -0.3, 0.9, -0.6, 0.2, -0.1]);
        let offset = Array1::zeros(n);
        let query_dist: Array1<f64> = Array1::from_iter((0..n).map(|i| i as f64));
        let query = [ComponentQuery::GpDistance(query_dist)];

        let dense_comp = Component::new_gp(ComponentKind::GpIntercept, Incidence::new_intercept((0..n).collect(), n), Kernel::Exponential, dist.clone(), 1.0, 2.0).unwrap();
        let dense_registry = ComponentRegistry::new(vec![dense_comp]);
        let dense_flags = StructurePlanner::plan(&dense_registry, true, PathPreference::Dense).unwrap();
        let likelihood = Likelihood::parse("gaussian").unwrap();
        let mut dense_state = crate::cluster::ClusterState::new(crate::laplace::total_re(&dense_registry));
        let dense_result = laplace::solve_mode(
            &dense_flags, &dense_registry, &likelihood, &y, &offset, &mut dense_state, crate::options::ApproximationType::Laplace, &FitOptions::default(),
        )
        .unwrap();
        let mut rng = EngineRng::new(5);
        let dense_pred = predict_new_point(&dense_flags, &dense_registry, &dense_result, &query, true, 1000, 1e-8, &mut rng, 1).unwrap();

        // DEFAULT_NUM_NEIGHBORS (30) exceeds n, so every point conditions on
        // all previous points: Vecchia's sparse precision factor is exact,
        // not an approximation, isolating the simulation estimator's own
        // Monte Carlo error from any structural approximation error.
        let vecchia_comp = Component::new_gp(ComponentKind::GpIntercept, Incidence::new_intercept((0..n).collect(), n), Kernel::Exponential, dist, 1.0, 2.0).unwrap();
        let vecchia_registry = ComponentRegistry::new(vec![vecchia_comp]);
        let vecchia_flags = StructurePlanner::plan(&vecchia_registry, true, PathPreference::Vecchia).unwrap();
        let mut vecchia_state = crate::cluster::ClusterState::new(crate::laplace::total_re(&vecchia_registry));
        let vecchia_result = laplace::solve_mode(
            &vecchia_flags, &vecchia_registry, &likelihood, &y, &offset, &mut vecchia_state, crate::options::ApproximationType::Laplace, &FitOptions::default(),
        )
        .unwrap();
        let mut rng = EngineRng::new(6);
        let vecchia_pred = predict_new_point(&vecchia_flags, &vecchia_registry, &vecchia_result, &query, true, 1000, 1e-8, &mut rng, 4000).unwrap();

        assert!((dense_pred.mean - vecchia_pred.mean).abs() < 1e-6);
        let dense_var = dense_pred.variance.unwrap();
        let vecchia_var = vecchia_pred.variance.unwrap();
        assert!(
            (dense_var - vecchia_var).abs() / dense_var.max(1.0) < 0.25,
            "dense={dense_var} vecchia_simulated={vecchia_var}"
        );
    }
}
