//! External interface. `Engine` owns the per-cluster component registries,
//! mutable Laplace state, and fit/predict options, and drives the whole
//! pipeline: structure planning once at construction, then repeated
//! Laplace solves under the outer optimizer, then prediction against
//! whichever structural path was chosen.
//!
//! Clusters are independent realizations of the latent process - cross-
//! cluster covariance is zero by construction. Every covariance parameter
//! and auxiliary parameter is shared across clusters,
//! but each cluster gets its own [`Cluster`]/[`ClusterState`] and its own
//! Laplace solve, and the engine's total negative log-likelihood and
//! gradient are the sum across clusters.

use ndarray::{s, Array1, Array2};

use crate::cluster::{Cluster, ClusterState};
use crate::component::{Component, ComponentKind, ComponentRegistry, Incidence};
use crate::error::{GpremError, Result};
use crate::gradient::{self, GradientResult};
use crate::kernel::Kernel;
use crate::laplace::{self, LaplaceResult};
use crate::likelihood::{Likelihood, LikelihoodKind};
use crate::optimizer::{self, Evaluation, FitOutcome, Gradient as OptGradient, Objective, Params};
use crate::options::{FitOptions, OptimizerKind, PredictOptions};
use crate::predictor::{self, ComponentQuery, LatentPrediction};
use crate::rng::EngineRng;
use crate::structure::{PathPreference, StructureFlags, StructurePlanner};

/// One grouped random-effect/random-coefficient term, as supplied by the
/// caller: a group label per observation, plus an optional covariate
/// (`Some` for a random *coefficient*, `None` for a random intercept).
pub struct GroupedSpec {
    pub group_ids: Vec<i64>,
    pub coefficient: Option<Vec<f64>>,
    pub initial_variance: f64,
}

/// One GP/GP-coefficient term: coordinates per observation (rows may
/// repeat an exact coordinate, collapsed to a single unique location
/// internally), a kernel choice, and an optional random-coefficient
/// covariate.
pub struct GpSpec {
    pub coords: Vec<Vec<f64>>,
    pub kernel: Kernel,
    pub coefficient: Option<Vec<f64>>,
    pub initial_variance: f64,
    pub initial_range: f64,
}

/// Everything needed to lay out the component registries, before any
/// response data is attached.
pub struct ModelSpec {
    /// Cluster membership per observation; observations sharing a cluster
    /// id see each other in their joint covariance, different clusters
    /// never do. A single all-equal vector puts every row in one cluster.
    pub cluster_ids: Vec<i64>,
    pub grouped: Vec<GroupedSpec>,
    pub gp: Vec<GpSpec>,
    pub likelihood: String,
    pub path_preference: PathPreference,
}

struct ClusterData {
    id: i64,
    cluster: Cluster,
    state: ClusterState,
    y: Array1<f64>,
    x: Option<Array2<f64>>,
    fixed_offset: Array1<f64>,
    last_result: Option<LaplaceResult>,
}

/// Per-row query used by [`Engine::set_prediction_data`]: one
/// [`ComponentQuery`] per component, in the same order `ModelSpec` listed
/// them, plus which cluster the new point belongs to (a cluster id never
/// seen in training predicts with zero cross-cluster covariance, i.e. a
/// prior-only prediction from every grouped/GP component).
pub struct PredictionRow {
    pub cluster_id: i64,
    pub queries: Vec<ComponentQuery>,
    pub fixed_offset: f64,
    pub covariates: Option<Vec<f64>>,
}

/// Summary returned by [`Engine::fit`].
pub struct FitSummary {
    pub neg_log_likelihood: f64,
    pub iterations: usize,
    /// `optim_stall`: `max_iter` was reached without meeting the
    /// convergence tolerance. Not an error - the caller decides whether a
    /// stalled fit is usable.
    pub optim_stall: bool,
    pub cov_pars: Vec<f64>,
    pub aux_pars: Vec<f64>,
    pub beta: Vec<f64>,
}

/// Mean/sd reparameterization of the fixed-effect block used internally
/// by gradient-based outer optimizers (gradient descent, BFGS) that have
/// no curvature information to compensate for covariates on wildly
/// different scales; Fisher scoring already rescales via `XᵀWX` and skips
/// this. A column with (numerically) zero variance is treated as an
/// intercept: left unscaled, and absorbs the mean-shift of every other
/// column so the reparameterization is exact. Without such a column the
/// mean-shift has nothing to absorb, so only the `sd` rescaling applies.
#[derive(Clone)]
struct CovariateScale {
    mean: Vec<f64>,
    sd: Vec<f64>,
    intercept_col: Option<usize>,
}

impl CovariateScale {
    fn fit(x: &Array2<f64>) -> Self {
        let p = x.ncols();
        let n = x.nrows().max(1) as f64;
        let mut mean = vec![0.0; p];
        let mut sd = vec![1.0; p];
        let mut intercept_col = None;
        for j in 0..p {
            let col = x.column(j);
            let m = col.sum() / n;
            let var = col.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
            let s = var.sqrt();
            if s < 1e-12 {
                if intercept_col.is_none() {
                    intercept_col = Some(j);
                }
            } else {
                mean[j] = m;
                sd[j] = s;
            }
        }
        if intercept_col.is_none() {
            mean = vec![0.0; p];
        }
        CovariateScale { mean, sd, intercept_col }
    }

    /// `beta_natural -> beta_std`, the initial-value transform.
    fn standardize_coef(&self, beta_natural: &[f64]) -> Vec<f64> {
        let mut beta = beta_natural.to_vec();
        let mut shift = 0.0;
        for j in 0..beta.len() {
            if Some(j) == self.intercept_col {
                continue;
            }
            shift += self.mean[j] * beta[j];
            beta[j] *= self.sd[j];
        }
        if let Some(k) = self.intercept_col {
            beta[k] += shift;
        }
        beta
    }

    /// `beta_std -> beta_natural`, the inverse of [`Self::standardize_coef`].
    fn unstandardize_coef(&self, beta_std: &[f64]) -> Vec<f64> {
        let mut beta = beta_std.to_vec();
        let mut shift = 0.0;
        for j in 0..beta.len() {
            if Some(j) == self.intercept_col {
                continue;
            }
            beta[j] /= self.sd[j];
            shift += self.mean[j] * beta[j];
        }
        if let Some(k) = self.intercept_col {
            beta[k] -= shift;
        }
        beta
    }

    /// Chain-rule transform of `d(neg_ll)/d(beta_natural)` into
    /// `d(neg_ll)/d(beta_std)`, the adjoint of the linear map
    /// [`Self::unstandardize_coef`] implements.
    fn gradient_to_standardized(&self, grad_natural: &[f64]) -> Vec<f64> {
        let k = self.intercept_col;
        (0..grad_natural.len())
            .map(|j| {
                if Some(j) == k {
                    grad_natural[j]
                } else {
                    let cross = k.map(|ki| self.mean[j] * grad_natural[ki]).unwrap_or(0.0);
                    (grad_natural[j] - cross) / self.sd[j]
                }
            })
            .collect()
    }
}

pub struct Engine {
    flags: StructureFlags,
    likelihood: Likelihood,
    clusters: Vec<ClusterData>,
    num_fixed: usize,
    fit_options: FitOptions,
    predict_options: PredictOptions,
    rng: EngineRng,
    prediction_rows: Vec<PredictionRow>,
    beta: Vec<f64>,
    covariate_scale: Option<CovariateScale>,
}

fn unique_levels(raw: &[i64]) -> (Vec<usize>, usize) {
    let mut seen = std::collections::HashMap::new();
    let mut level_of = Vec::with_capacity(raw.len());
    for &v in raw {
        let next = seen.len();
        let lvl = *seen.entry(v).or_insert(next);
        level_of.push(lvl);
    }
    (level_of, seen.len())
}

fn unique_coords(raw: &[Vec<f64>]) -> (Vec<usize>, Array2<f64>) {
    let mut uniques: Vec<Vec<f64>> = Vec::new();
    let mut level_of = Vec::with_capacity(raw.len());
    for row in raw {
        let found = uniques.iter().position(|u| u == row);
        let lvl = match found {
            Some(l) => l,
            None => {
                uniques.push(row.clone());
                uniques.len() - 1
            }
        };
        level_of.push(lvl);
    }
    let m = uniques.len();
    let dim = uniques.first().map(|u| u.len()).unwrap_or(0);
    let mut dist = Array2::<f64>::zeros((m, m));
    for a in 0..m {
        for b in 0..m {
            let d: f64 = (0..dim).map(|k| (uniques[a][k] - uniques[b][k]).powi(2)).sum::<f64>().sqrt();
            dist[[a, b]] = d;
        }
    }
    (level_of, dist)
}

fn build_registry_for_rows(spec: &ModelSpec, rows: &[usize]) -> Result<ComponentRegistry> {
    let mut components = Vec::new();
    for g in &spec.grouped {
        let raw: Vec<i64> = rows.iter().map(|&r| g.group_ids[r]).collect();
        let (level_of, num_re) = unique_levels(&raw);
        let incidence = match &g.coefficient {
            Some(coef) => {
                let covariate = Array1::from_iter(rows.iter().map(|&r| coef[r]));
                Incidence::new_coef(level_of, num_re, covariate)
            }
            None => Incidence::new_intercept(level_of, num_re),
        };
        let kind = if g.coefficient.is_some() { ComponentKind::GroupedCoef } else { ComponentKind::GroupedIntercept };
        components.push(Component::new_grouped(kind, incidence, g.initial_variance)?);
    }
    for gp in &spec.gp {
        let raw: Vec<Vec<f64>> = rows.iter().map(|&r| gp.coords[r].clone()).collect();
        let (level_of, dist) = unique_coords(&raw);
        let num_re = dist.nrows();
        let incidence = match &gp.coefficient {
            Some(coef) => {
                let covariate = Array1::from_iter(rows.iter().map(|&r| coef[r]));
                Incidence::new_coef(level_of, num_re, covariate)
            }
            None => Incidence::new_intercept(level_of, num_re),
        };
        let kind = if gp.coefficient.is_some() { ComponentKind::GpCoef } else { ComponentKind::GpIntercept };
        components.push(Component::new_gp(kind, incidence, gp.kernel, dist, gp.initial_variance, gp.initial_range)?);
    }
    Ok(ComponentRegistry::new(components))
}

impl Engine {
    /// Lay out the component registries (one per cluster) and pick the
    /// structural path. No response data is required yet.
    pub fn create(spec: &ModelSpec, fit_options: FitOptions, predict_options: PredictOptions) -> Result<Self> {
        let num_data = spec.cluster_ids.len();
        if spec.grouped.iter().any(|g| g.group_ids.len() != num_data) || spec.gp.iter().any(|g| g.coords.len() != num_data) {
            return Err(GpremError::ShapeMismatch("every component's per-row data must match cluster_ids' length".into()));
        }

        let mut cluster_rows: std::collections::BTreeMap<i64, Vec<usize>> = std::collections::BTreeMap::new();
        for (i, &cid) in spec.cluster_ids.iter().enumerate() {
            cluster_rows.entry(cid).or_default().push(i);
        }

        let likelihood = Likelihood::parse(&spec.likelihood)?;
        let mut clusters = Vec::with_capacity(cluster_rows.len());
        let mut flags: Option<StructureFlags> = None;
        for (cluster_id, rows) in cluster_rows {
            let registry = build_registry_for_rows(spec, &rows)?;
            if flags.is_none() {
                flags = Some(StructurePlanner::plan(&registry, matches!(likelihood.kind, crate::likelihood::LikelihoodKind::Gaussian), spec.path_preference)?);
            }
            let n_re = crate::laplace::total_re(&registry);
            clusters.push(ClusterData {
                id: cluster_id,
                cluster: Cluster { indices: rows.clone(), components: registry },
                state: ClusterState::new(n_re),
                y: Array1::zeros(rows.len()),
                x: None,
                fixed_offset: Array1::zeros(rows.len()),
                last_result: None,
            });
        }
        let flags = flags.ok_or_else(|| GpremError::BadInput("at least one cluster is required".into()))?;

        Ok(Self {
            flags,
            likelihood,
            clusters,
            num_fixed: 0,
            fit_options,
            predict_options,
            rng: EngineRng::new(0x5EED),
            prediction_rows: Vec::new(),
            beta: Vec::new(),
            covariate_scale: None,
        })
    }

    fn num_data(&self) -> usize {
        self.clusters.iter().map(|c| c.cluster.n_i()).sum()
    }

    pub fn set_response(&mut self, y: &[f64]) -> Result<()> {
        self.set_response_with_fixed_effects(y, &vec![0.0; y.len()])
    }

    pub fn set_response_with_fixed_effects(&mut self, y: &[f64], fixed_offset: &[f64]) -> Result<()> {
        if y.len() != self.num_data() || fixed_offset.len() != self.num_data() {
            return Err(GpremError::ShapeMismatch("response/offset length must match the number of rows given at create".into()));
        }
        for c in &mut self.clusters {
            c.y = Array1::from_iter(c.cluster.indices.iter().map(|&r| y[r]));
            c.fixed_offset = Array1::from_iter(c.cluster.indices.iter().map(|&r| fixed_offset[r]));
        }
        self.rng = EngineRng::new(self.fit_options.seed);
        Ok(())
    }

    pub fn set_covariates(&mut self, x: &Array2<f64>) -> Result<()> {
        if x.nrows() != self.num_data() {
            return Err(GpremError::ShapeMismatch("covariate matrix row count must match the number of rows given at create".into()));
        }
        self.num_fixed = x.ncols();
        self.covariate_scale = Some(CovariateScale::fit(x));
        for c in &mut self.clusters {
            let rows: Vec<usize> = c.cluster.indices.clone();
            let mut sub = Array2::<f64>::zeros((rows.len(), x.ncols()));
            for (i, &r) in rows.iter().enumerate() {
                for j in 0..x.ncols() {
                    sub[[i, j]] = x[[r, j]];
                }
            }
            c.x = Some(sub);
        }
        Ok(())
    }

    /// Whether the fixed-effect block is currently driven by a gradient-
    /// based family with no curvature information (gradient descent or
    /// BFGS), in which case [`CovariateScale`] standardization applies.
    /// Fisher scoring already rescales via `XᵀWX` and is excluded.
    fn standardize_coef_optimizer(&self) -> bool {
        self.num_fixed > 0
            && (matches!(self.fit_options.optimizer_cov, OptimizerKind::Bfgs)
                || !matches!(self.fit_options.optimizer_coef, OptimizerKind::FisherScoring))
    }

    pub fn set_prediction_data(&mut self, rows: Vec<PredictionRow>) {
        self.prediction_rows = rows;
    }

    /// Seeds the fixed-effect coefficients `fit` starts from. Call after
    /// [`Engine::set_covariates`]; `coef` must have one entry per
    /// covariate column.
    pub fn set_init_coef(&mut self, coef: &[f64]) -> Result<()> {
        if coef.len() != self.num_fixed {
            return Err(GpremError::ShapeMismatch(
                "initial coefficient vector length must match the number of covariate columns".into(),
            ));
        }
        self.beta = coef.to_vec();
        Ok(())
    }

    /// Crude method-of-moments initial covariance parameters: component
    /// variance from the response's overall variance split evenly across
    /// components, GP range from the median pairwise distance of that
    /// component's unique locations (mirrors the teacher's
    /// intercept-only/robust-scale heuristics in [`Likelihood::find_initial_aux_pars`]).
    pub fn find_init_cov_pars(&self) -> Result<Vec<f64>> {
        let n_comp: usize = self.clusters.first().map(|c| c.cluster.components.components.len()).unwrap_or(0);
        if n_comp == 0 {
            return Ok(vec![]);
        }
        let all_y: Vec<f64> = self.clusters.iter().flat_map(|c| c.y.iter().copied()).collect();
        let mean = all_y.iter().sum::<f64>() / all_y.len().max(1) as f64;
        let var = (all_y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / all_y.len().max(1) as f64).max(1e-6);
        let share = (var / n_comp as f64).max(1e-4);

        let mut out = Vec::new();
        for comp in &self.clusters[0].cluster.components.components {
            out.push(share);
            if comp.kind.is_gp() {
                let dist = comp.dist.as_ref().ok_or_else(|| {
                    GpremError::IncompatibleStructure("GP component is missing its distance matrix".into())
                })?;
                let mut off_diag: Vec<f64> = Vec::new();
                for i in 0..dist.nrows() {
                    for j in (i + 1)..dist.ncols() {
                        off_diag.push(dist[[i, j]]);
                    }
                }
                off_diag.sort_by(|a, b| a.partial_cmp(b).unwrap());
                let median = off_diag.get(off_diag.len() / 2).copied().unwrap_or(1.0).max(1e-6);
                out.push(median);
            }
        }
        Ok(out)
    }

    fn set_cov_pars_all_clusters(&mut self, flat: &[f64]) -> Result<()> {
        let mut idx = 0usize;
        for comp_idx in 0..self.clusters[0].cluster.components.components.len() {
            let k = self.clusters[0].cluster.components.components[comp_idx].num_cov_par();
            let pars = &flat[idx..idx + k];
            for c in &mut self.clusters {
                c.cluster.components.components[comp_idx].set_cov_pars(pars)?;
            }
            idx += k;
        }
        Ok(())
    }

    fn apply_params(&mut self, params: &Params) -> Result<()> {
        let natural: Vec<f64> = params.log_cov.iter().map(|v| v.exp()).collect();
        self.set_cov_pars_all_clusters(&natural)?;
        let num_aux = self.likelihood.num_aux_pars();
        for (k, &lv) in params.log_aux.iter().enumerate().take(num_aux) {
            self.likelihood.aux_pars[k] = lv.exp();
        }
        Ok(())
    }

    /// Whether `σ²` is profiled out of the optimization vector: only
    /// meaningful for the Gaussian likelihood, and only implemented with no
    /// fixed-effect covariates (see [`Engine::profile_sigma2`]). Works
    /// across every structural path, since it only relies on the Laplace
    /// pseudo-response `a_vec` rather than a specific factorization.
    fn profiling_active(&self) -> bool {
        self.fit_options.profile_out_sigma2 && matches!(self.likelihood.kind, LikelihoodKind::Gaussian) && self.num_fixed == 0
    }

    /// Sets every component's covariance parameters from `log_ratio`
    /// (`log(variance_k / σ²)`), computes the closed-form profile
    /// maximizer `σ̂² = Σ_c y_cᵀ(Ψ_c(ratio)+I)⁻¹y_c / n` for those ratios
    /// (since under the ratio reparameterization `Ψ(ratio) = Ψ(θ)/σ²`
    /// exactly, `Σ_y = σ²(Ψ(ratio)+I)` and the Gaussian profile-likelihood
    /// maximizer for an overall covariance scale applies directly), then
    /// rescales the stored covariance parameters back to the natural
    /// scale `ratio_k·σ̂²` and sets the likelihood's nugget to `σ̂²`.
    /// Returns `σ̂²`.
    fn apply_profiled_cov_pars(&mut self, log_ratio: &[f64]) -> Result<f64> {
        let ratios: Vec<f64> = log_ratio.iter().map(|v| v.exp()).collect();
        self.set_cov_pars_all_clusters(&ratios)?;
        let sigma2_hat = self.profile_sigma2()?;
        let natural: Vec<f64> = ratios.iter().map(|r| r * sigma2_hat).collect();
        self.set_cov_pars_all_clusters(&natural)?;
        self.likelihood.aux_pars[0] = sigma2_hat;
        Ok(sigma2_hat)
    }

    /// `(Σ_c y_cᵀ(Ψ_c+I)⁻¹y_c) / n` with every cluster's nugget pinned to
    /// 1 and the current (ratio-scale) component covariance parameters
    /// already set. `laplace::solve_mode`'s returned `a_vec` (the Laplace
    /// pseudo-response) already equals `(Ψ_c+I)⁻¹y_c` at that pinned
    /// nugget for a Gaussian likelihood with no fixed effects, regardless
    /// of which structural path produced it, so the quadratic form is read
    /// off directly rather than re-solved against a cache-specific factor.
    /// Each cluster gets a throwaway [`ClusterState`]: this is a probe
    /// solve, not the warm-started trajectory the real per-iteration solve
    /// maintains.
    fn profile_sigma2(&mut self) -> Result<f64> {
        let mut unit = self.likelihood.clone();
        unit.aux_pars[0] = 1.0;
        let mut total_quad = 0.0f64;
        let mut total_n = 0usize;
        for c in &mut self.clusters {
            let mut probe_state = ClusterState::new(laplace::total_re(&c.cluster.components));
            let result = laplace::solve_mode(
                &self.flags,
                &c.cluster.components,
                &unit,
                &c.y,
                &c.fixed_offset,
                &mut probe_state,
                self.fit_options.approximation_type,
                &self.fit_options,
            )?;
            // Under the unit-nugget probe, `a_vec` (the Laplace pseudo-response
            // `(y-f̂)/σ²`, here with σ²=1) equals `Σ_y⁻¹(y-offset)` exactly for a
            // Gaussian likelihood: posterior mean `f̂ = Ψ Σ_y⁻¹(y-offset)`, so
            // `(y-offset)-f̂ = (Σ_y-Ψ)Σ_y⁻¹(y-offset) = Σ_y⁻¹(y-offset)` at σ²=1.
            // That holds for any structural path, so no cache-specific solve is
            // needed here.
            let resid = &c.y - &c.fixed_offset;
            total_quad += resid.dot(&result.a_vec);
            total_n += c.y.len();
        }
        Ok((total_quad / total_n.max(1) as f64).max(1e-10))
    }

    fn current_params(&self) -> Params {
        let profiling = self.profiling_active();
        let sigma2 = self.likelihood.aux_pars[0];
        let mut log_cov = Vec::new();
        for comp in &self.clusters[0].cluster.components.components {
            for &p in &comp.cov_pars {
                log_cov.push(if profiling { (p / sigma2).ln() } else { p.ln() });
            }
        }
        let log_aux: Vec<f64> = if profiling {
            vec![]
        } else {
            self.likelihood.aux_pars[..self.likelihood.num_aux_pars()].iter().map(|v| v.ln()).collect()
        };
        let natural_beta = if self.beta.len() == self.num_fixed { self.beta.clone() } else { vec![0.0; self.num_fixed] };
        let beta = if self.standardize_coef_optimizer() {
            self.covariate_scale.as_ref().expect("covariate_scale is set whenever num_fixed > 0").standardize_coef(&natural_beta)
        } else {
            natural_beta
        };
        Params { log_cov, log_aux, beta }
    }

    fn solve_all_clusters(&mut self, beta: &[f64]) -> Result<(f64, Vec<LaplaceResult>)> {
        let mut total_ll = 0.0f64;
        let mut results = Vec::with_capacity(self.clusters.len());
        for c in &mut self.clusters {
            let offset = match &c.x {
                Some(x) => &c.fixed_offset + &x.dot(&Array1::from(beta.to_vec())),
                None => c.fixed_offset.clone(),
            };
            let result = laplace::solve_mode(
                &self.flags,
                &c.cluster.components,
                &self.likelihood,
                &c.y,
                &offset,
                &mut c.state,
                self.fit_options.approximation_type,
                &self.fit_options,
            )?;
            if result.na_or_inf {
                return Err(GpremError::InnerDiverged("Laplace mode-finding did not converge for a cluster".into()));
            }
            total_ll += result.approx_marginal_ll;
            c.state.mode = result.mode.clone();
            results.push(result);
        }
        Ok((total_ll, results))
    }

    fn gradient_all_clusters(&mut self, beta: &[f64], results: &[LaplaceResult]) -> Result<GradientResult> {
        let n_cov = self.clusters[0].cluster.components.total_cov_pars();
        let n_aux = self.likelihood.num_aux_pars();
        let mut d_log_cov = vec![0.0f64; n_cov];
        let mut d_log_aux = vec![0.0f64; n_aux];
        let mut d_beta = Array1::<f64>::zeros(self.num_fixed);

        for (c, result) in self.clusters.iter_mut().zip(results.iter()) {
            let offset = match &c.x {
                Some(x) => &c.fixed_offset + &x.dot(&Array1::from(beta.to_vec())),
                None => c.fixed_offset.clone(),
            };
            let grad = gradient::compute(
                &self.flags,
                &c.cluster.components,
                &self.likelihood,
                &c.y,
                &offset,
                c.x.as_ref(),
                result,
                &mut self.rng,
                self.fit_options.num_rand_vec_trace,
                self.fit_options.cg_max_iter,
                self.fit_options.cg_delta_conv,
            )?;
            for k in 0..n_cov {
                d_log_cov[k] += grad.d_neg_ll_d_log_cov[k];
            }
            for k in 0..n_aux {
                d_log_aux[k] += grad.d_neg_ll_d_log_aux[k];
            }
            if let Some(db) = grad.d_neg_ll_d_beta {
                d_beta = &d_beta + &db;
            }
        }
        Ok(GradientResult { d_neg_ll_d_log_cov: d_log_cov, d_neg_ll_d_log_aux: d_log_aux, d_neg_ll_d_beta: Some(d_beta) })
    }

    /// Sums each cluster's expected Fisher information (cross-cluster
    /// covariance is zero, so the joint information is additive like the
    /// joint gradient). The cov/aux block is `Some` only when every
    /// cluster's structural path and likelihood admit the closed form
    /// (`fisher_information_dense`); the coefficient block (`XᵀWX`) is
    /// available whenever at least one cluster carries covariates.
    fn fisher_information_all_clusters(&self, results: &[LaplaceResult]) -> (Option<Array2<f64>>, Option<Array2<f64>>) {
        let n_cov_aux = self.clusters[0].cluster.components.total_cov_pars() + self.likelihood.num_aux_pars();
        let mut fisher_cov_aux = Some(Array2::<f64>::zeros((n_cov_aux, n_cov_aux)));
        for (c, result) in self.clusters.iter().zip(results.iter()) {
            match gradient::fisher_information_dense(&c.cluster.components, &self.likelihood, &result.cache, &result.diag_information_log_lik) {
                Some(fi) if fi.nrows() == n_cov_aux && fi.ncols() == n_cov_aux => {
                    if let Some(acc) = fisher_cov_aux.as_mut() {
                        *acc = &*acc + &fi;
                    }
                }
                _ => {
                    fisher_cov_aux = None;
                }
            }
        }

        let mut fisher_beta = if self.num_fixed > 0 { Some(Array2::<f64>::zeros((self.num_fixed, self.num_fixed))) } else { None };
        for (c, result) in self.clusters.iter().zip(results.iter()) {
            if let (Some(x), Some(acc)) = (c.x.as_ref(), fisher_beta.as_mut()) {
                let w = &result.diag_information_log_lik;
                for i in 0..self.num_fixed {
                    for j in 0..self.num_fixed {
                        acc[[i, j]] += (0..x.nrows()).map(|r| x[[r, i]] * w[r] * x[[r, j]]).sum::<f64>();
                    }
                }
            }
        }

        (fisher_cov_aux, fisher_beta)
    }

    /// Run the outer optimizer to convergence (or `max_iter`), leaving
    /// parameters and every cluster's Laplace state at their final values.
    pub fn fit(&mut self) -> Result<FitSummary> {
        let init = self.current_params();
        let fit_options = self.fit_options.clone();
        let outcome: FitOutcome = {
            let mut objective = EngineObjective { engine: self };
            optimizer::fit(&mut objective, init, &fit_options)?
        };
        if self.profiling_active() {
            self.apply_profiled_cov_pars(&outcome.params.log_cov)?;
        } else {
            self.apply_params(&outcome.params)?;
        }
        let natural_beta = if self.standardize_coef_optimizer() {
            self.covariate_scale.as_ref().expect("covariate_scale is set whenever num_fixed > 0").unstandardize_coef(&outcome.params.beta)
        } else {
            outcome.params.beta.clone()
        };
        self.beta = natural_beta.clone();
        let (_, results) = self.solve_all_clusters(&natural_beta)?;
        for (c, r) in self.clusters.iter_mut().zip(results.into_iter()) {
            c.last_result = Some(r);
        }
        Ok(FitSummary {
            neg_log_likelihood: outcome.neg_ll,
            iterations: outcome.iterations,
            optim_stall: outcome.stalled,
            cov_pars: self.clusters[0].cluster.components.components.iter().flat_map(|c| c.cov_pars.clone()).collect(),
            aux_pars: self.likelihood.aux_pars.clone(),
            beta: natural_beta,
        })
    }

    /// Evaluate the negative log-likelihood at the engine's current
    /// parameters without running any optimizer steps.
    pub fn neg_log_likelihood(&mut self, beta: &[f64]) -> Result<f64> {
        let (ll, _) = self.solve_all_clusters(beta)?;
        Ok(-ll)
    }

    /// Re-solve the Laplace mode under a new fixed-effect offset without
    /// touching covariance/auxiliary parameters - the hook a gradient
    /// boosting driver calls once per boosting iteration after updating
    /// its leaf values, to refresh the random-effect predictions those
    /// leaf values condition on.
    pub fn newton_update_leaf_values(&mut self, fixed_offset: &[f64]) -> Result<()> {
        if fixed_offset.len() != self.num_data() {
            return Err(GpremError::ShapeMismatch("offset length must match the number of rows given at create".into()));
        }
        for c in &mut self.clusters {
            c.fixed_offset = Array1::from_iter(c.cluster.indices.iter().map(|&r| fixed_offset[r]));
        }
        let (_, results) = self.solve_all_clusters(&vec![0.0; self.num_fixed])?;
        for (c, r) in self.clusters.iter_mut().zip(results.into_iter()) {
            c.last_result = Some(r);
        }
        Ok(())
    }

    pub fn predict_training_random_effects(&self) -> Vec<Vec<Array1<f64>>> {
        self.clusters
            .iter()
            .map(|c| match &c.last_result {
                Some(r) => predictor::training_random_effects(&c.cluster.components, r),
                None => vec![],
            })
            .collect()
    }

    /// Predict every row queued by [`Engine::set_prediction_data`], on the
    /// latent scale, then (if `predict_options.predict_response`) pushed
    /// through Gauss-Hermite quadrature to the response scale.
    pub fn predict(&mut self) -> Result<Vec<LatentPrediction>> {
        let mut out = Vec::with_capacity(self.prediction_rows.len());
        for row in &self.prediction_rows {
            let cluster = self.clusters.iter().find(|c| c.id == row.cluster_id);
            let latent = match cluster.and_then(|c| c.last_result.as_ref().map(|r| (c, r))) {
                Some((c, result)) => predictor::predict_new_point(
                    &self.flags,
                    &c.cluster.components,
                    result,
                    &row.queries,
                    self.predict_options.predict_var,
                    self.fit_options.cg_max_iter,
                    self.fit_options.cg_delta_conv,
                    &mut self.rng,
                    self.predict_options.nsim_var_pred,
                )?,
                None => {
                    let prior_variance: f64 = self.clusters[0].cluster.components.components.iter().map(|comp| comp.cov_pars[0]).sum();
                    LatentPrediction { mean: 0.0, variance: if self.predict_options.predict_var { Some(prior_variance) } else { None } }
                }
            };
            let beta_contrib = match &row.covariates {
                Some(cov) => cov.iter().zip(self.beta.iter()).map(|(x, b)| x * b).sum::<f64>(),
                None => 0.0,
            };
            let fixed_contrib = beta_contrib + row.fixed_offset;
            let shifted = LatentPrediction { mean: latent.mean + fixed_contrib, variance: latent.variance };
            let final_pred = if self.predict_options.predict_response {
                predictor::response_scale_prediction(&self.likelihood, &shifted, self.predict_options.num_gh_nodes)?
            } else {
                shifted
            };
            out.push(final_pred);
        }
        Ok(out)
    }
}

struct EngineObjective<'a> {
    engine: &'a mut Engine,
}

impl<'a> EngineObjective<'a> {
    /// Evaluation path for the profiled-out-σ² case: `params.log_cov`
    /// holds `log(ratio_k)`, not `log(variance_k)`, and `params.log_aux`/
    /// `params.beta` are always empty (no nugget, no covariates). The
    /// profiled gradient w.r.t. `log(ratio_k)` is, by the envelope theorem,
    /// the ordinary natural-scale gradient w.r.t. `log(variance_k)`
    /// evaluated at the profiled natural values, so no separate gradient
    /// derivation is needed beyond [`Engine::apply_profiled_cov_pars`]
    /// having already set those natural values before the solve below.
    fn evaluate_profiled(&mut self, params: &Params) -> Result<Evaluation> {
        self.engine.apply_profiled_cov_pars(&params.log_cov)?;
        let natural_beta: Vec<f64> = vec![];
        let (ll, results) = self.engine.solve_all_clusters(&natural_beta)?;
        let grad = self.engine.gradient_all_clusters(&natural_beta, &results)?;
        let (fisher_cov_aux, _) = self.engine.fisher_information_all_clusters(&results);
        let n = params.log_cov.len();
        let fisher_cov_aux = fisher_cov_aux.map(|fi| fi.slice(s![0..n, 0..n]).to_owned());
        Ok(Evaluation {
            neg_ll: -ll,
            grad: OptGradient { d_log_cov: grad.d_neg_ll_d_log_cov, d_log_aux: vec![], d_beta: vec![] },
            fisher_cov_aux,
            fisher_beta: None,
        })
    }
}

impl<'a> Objective for EngineObjective<'a> {
    fn evaluate(&mut self, params: &Params) -> Result<Evaluation> {
        if self.engine.profiling_active() {
            return self.evaluate_profiled(params);
        }
        self.engine.apply_params(params)?;
        let standardize = self.engine.standardize_coef_optimizer();
        let natural_beta = if standardize {
            self.engine.covariate_scale.as_ref().expect("covariate_scale is set whenever num_fixed > 0").unstandardize_coef(&params.beta)
        } else {
            params.beta.clone()
        };
        let (ll, results) = self.engine.solve_all_clusters(&natural_beta)?;
        let grad = self.engine.gradient_all_clusters(&natural_beta, &results)?;
        let d_beta_natural = grad.d_neg_ll_d_beta.map(|v| v.to_vec()).unwrap_or_else(|| vec![0.0; params.beta.len()]);
        let d_beta = if standardize {
            self.engine.covariate_scale.as_ref().unwrap().gradient_to_standardized(&d_beta_natural)
        } else {
            d_beta_natural
        };
        let (fisher_cov_aux, fisher_beta) = self.engine.fisher_information_all_clusters(&results);
        Ok(Evaluation {
            neg_ll: -ll,
            grad: OptGradient { d_log_cov: grad.d_neg_ll_d_log_cov, d_log_aux: grad.d_neg_ll_d_log_aux, d_beta },
            fisher_cov_aux,
            fisher_beta,
        })
    }
}
