//! Covariance assembly and factorization. One submodule per structural
//! path named by [`crate::structure::StructureTag`]; [`factorize`]
//! dispatches on the tag chosen by the structure planner and returns a
//! cache reused by the Laplace solver, the gradient engine, and the
//! predictor until a structural trigger invalidates it.

pub mod dense;
pub mod fitc;
pub mod vecchia;
pub mod woodbury;

use ndarray::{Array1, Array2};

use crate::component::ComponentRegistry;
use crate::error::Result;
use crate::linalg::{Permutation, SparseLowerTriangular};
use crate::options::CgPreconditioner;
use crate::structure::{StructureFlags, StructureTag};

/// Everything downstream stages need after a successful `factorize(theta)`
/// call: the chosen path's factor(s), plus enough of the raw assembly to
/// recompute gradients without re-deriving it from the registry.
#[derive(Debug, Clone)]
pub enum FactorizationCache {
    Dense {
        psi: Array2<f64>,
        chol: Array2<f64>,
        perm: Option<Permutation>,
    },
    GroupedWoodbury {
        /// `Σ⁻¹` diagonal, concatenated across components' latent scales.
        sigma_inv_diag: Array1<f64>,
        /// `ZᵀZ`, the full (small, `total_num_re x total_num_re`) Gram
        /// matrix of the stacked incidence matrix.
        zt_z: Array2<f64>,
        /// Cholesky factor of `M = Σ⁻¹ + ZᵀWZ` (Gaussian: `W = I/σ²`).
        chol_m: Array2<f64>,
    },
    Vecchia {
        b: SparseLowerTriangular,
        d: Array1<f64>,
        preconditioner: CgPreconditioner,
    },
    Fitc {
        chol_m: Array2<f64>,
        chol_uu: Array2<f64>,
        sigma_nm: Array2<f64>,
        d_plus_w_inv: Array1<f64>,
    },
}

/// Assemble and factorize the covariance for one cluster under the chosen
/// structural path. `w_diag` is the current Newton-step information
/// (`None` before the first Laplace iteration, or always `1/sigma2` on the
/// data scale for Gaussian).
pub fn factorize(
    flags: &StructureFlags,
    registry: &ComponentRegistry,
    num_data: usize,
    nugget_variance: Option<f64>,
    w_diag: Option<&Array1<f64>>,
    num_neighbors: usize,
    cg_preconditioner: CgPreconditioner,
) -> Result<FactorizationCache> {
    match flags.tag {
        StructureTag::DenseChol | StructureTag::SparseChol | StructureTag::SingleGpOnReScale => {
            dense::factorize(registry, num_data, nugget_variance, w_diag)
        }
        StructureTag::GroupedWoodbury | StructureTag::SingleGroupedOnReScale => {
            woodbury::factorize(registry, num_data, w_diag)
        }
        StructureTag::Vecchia => {
            vecchia::factorize(registry, num_data, nugget_variance, num_neighbors, cg_preconditioner)
        }
        StructureTag::Fitc => fitc::factorize(registry, num_data, nugget_variance, w_diag),
    }
}
