//! Dense/sparse-Cholesky path: builds `Ψ = Σ_j Z_j Σ_j Z_jᵀ` and factors
//! either `Ψ + σ² I` (Gaussian) or `B = I + W^½ Ψ W^½` (Laplace inner
//! loop for non-Gaussian likelihoods).

use ndarray::{Array1, Array2};

use crate::component::ComponentRegistry;
use crate::error::Result;
use crate::linalg::chol_lower;

use super::FactorizationCache;

/// `Ψ = Σ_j Z_j Σ_j Z_jᵀ`, the sum of each component's contribution
/// expanded to the data scale.
pub fn build_psi(registry: &ComponentRegistry, num_data: usize) -> Array2<f64> {
    let mut psi = Array2::<f64>::zeros((num_data, num_data));
    for comp in &registry.components {
        let sigma_j = comp.build_sigma();
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
                psi[[a, b]] += sa * sb * sigma_j[[la, lb]];
            }
        }
    }
    psi
}

pub fn factorize(
    registry: &ComponentRegistry,
    num_data: usize,
    nugget_variance: Option<f64>,
    w_diag: Option<&Array1<f64>>,
) -> Result<FactorizationCache> {
    let psi = build_psi(registry, num_data);
    let chol = match w_diag {
        Some(w) => {
            let mut b = Array2::<f64>::eye(num_data);
            for i in 0..num_data {
                for j in 0..num_data {
                    b[[i, j]] += w[i].sqrt() * psi[[i, j]] * w[j].sqrt();
                }
            }
            chol_lower(&b)?
        }
        None => {
            let mut m = psi.clone();
            if let Some(nugget) = nugget_variance {
                for i in 0..num_data {
                    m[[i, i]] += nugget;
                }
            }
            chol_lower(&m)?
        }
    };
    Ok(FactorizationCache::Dense { psi, chol, perm: None })
}
