//! Grouped-Woodbury path: builds block-diagonal `Σ⁻¹` (one diagonal block
//! per grouped component, scalar per level) and the dense `ZᵀWZ` Gram
//! matrix of the stacked incidence, then factors `M = Σ⁻¹ + ZᵀWZ`. Valid
//! only when every component is grouped (no GP component has a diagonal
//! `Σ⁻¹`, so it cannot appear on this path — the structure planner
//! enforces this before `factorize` is ever called).

use ndarray::{Array1, Array2};

use crate::component::ComponentRegistry;
use crate::error::Result;
use crate::linalg::chol_lower;

use super::FactorizationCache;

pub fn factorize(
    registry: &ComponentRegistry,
    num_data: usize,
    w_diag: Option<&Array1<f64>>,
) -> Result<FactorizationCache> {
    let total_re: usize = registry.components.iter().map(|c| c.num_re()).sum();
    let mut offsets = Vec::with_capacity(registry.components.len());
    let mut acc = 0usize;
    for comp in &registry.components {
        offsets.push(acc);
        acc += comp.num_re();
    }

    let mut sigma_inv_diag = Array1::<f64>::zeros(total_re);
    for (comp, &off) in registry.components.iter().zip(offsets.iter()) {
        let variance = comp.cov_pars[0];
        for k in 0..comp.num_re() {
            sigma_inv_diag[off + k] = 1.0 / variance;
        }
    }

    let mut zt_w_z = Array2::<f64>::zeros((total_re, total_re));
    for a in 0..num_data {
        let w = w_diag.map(|v| v[a]).unwrap_or(1.0);
        for (p, (comp_p, &off_p)) in registry.components.iter().zip(offsets.iter()).enumerate() {
            let scale_p = comp_p.incidence.scale[a];
            if scale_p == 0.0 {
                continue;
            }
            let row = off_p + comp_p.incidence.level_of[a];
            for (comp_q, &off_q) in registry.components.iter().zip(offsets.iter()).skip(p) {
                let scale_q = comp_q.incidence.scale[a];
                if scale_q == 0.0 {
                    continue;
                }
                let col = off_q + comp_q.incidence.level_of[a];
                let contrib = w * scale_p * scale_q;
                zt_w_z[[row, col]] += contrib;
                if row != col {
                    zt_w_z[[col, row]] += contrib;
                }
            }
        }
    }

    let mut m = zt_w_z.clone();
    for i in 0..total_re {
        m[[i, i]] += sigma_inv_diag[i];
    }
    let chol_m = chol_lower(&m)?;

    Ok(FactorizationCache::GroupedWoodbury { sigma_inv_diag, zt_z: zt_w_z, chol_m })
}
