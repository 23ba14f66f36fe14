//! Shared numerical helpers used by covariance assembly, Laplace solving,
//! and gradient computation: a fill-reducing permutation helper, a minimal
//! sparse lower-triangular representation for the sparse-Cholesky path, a
//! conjugate-gradient solver for the iterative Vecchia path, and a
//! shared-memory parallel-for abstraction.

use ndarray::{Array1, Array2};
use ndarray_linalg::{Cholesky, Inverse, UPLO};

use crate::error::{GpremError, Result};

/// A fill-reducing row/column permutation, computed once per structural
/// epoch and reused until a structural trigger resets it.
#[derive(Debug, Clone)]
pub struct Permutation {
    pub order: Vec<usize>,
}

impl Permutation {
    pub fn identity(n: usize) -> Self {
        Self { order: (0..n).collect() }
    }

    /// Approximate minimum-degree-style ordering is out of scope for the
    /// dense path (permutation only matters for sparse fill-in); dense
    /// callers always get the identity permutation back.
    pub fn none() -> Option<Self> {
        None
    }
}

/// Apply `P A Pᵀ` if a permutation is present, otherwise return `a`
/// unchanged. Every call site that needs to respect the fill-reducing
/// permutation goes through this helper.
pub fn apply_perm_if_any(a: &Array2<f64>, perm: &Option<Permutation>) -> Array2<f64> {
    match perm {
        None => a.clone(),
        Some(p) => {
            let n = a.nrows();
            let mut out = Array2::<f64>::zeros((n, n));
            for i in 0..n {
                for j in 0..n {
                    out[[i, j]] = a[[p.order[i], p.order[j]]];
                }
            }
            out
        }
    }
}

/// Apply the inverse permutation to a vector (undo [`apply_perm_if_any`]'s
/// reordering of the solution).
pub fn apply_perm_inv_vec(v: &Array1<f64>, perm: &Option<Permutation>) -> Array1<f64> {
    match perm {
        None => v.clone(),
        Some(p) => {
            let mut out = Array1::<f64>::zeros(v.len());
            for i in 0..v.len() {
                out[p.order[i]] = v[i];
            }
            out
        }
    }
}

/// Lower-triangular Cholesky factor of a dense symmetric positive-definite
/// matrix. Maps a non-PD failure onto [`GpremError::CovNotPsd`] so the
/// outer optimizer can recover via step halving.
pub fn chol_lower(a: &Array2<f64>) -> Result<Array2<f64>> {
    a.cholesky(UPLO::Lower).map_err(|_| GpremError::CovNotPsd)
}

/// Solve `L x = b` for lower-triangular `L` by forward substitution.
pub fn forward_solve(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut x = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut s = b[i];
        for j in 0..i {
            s -= l[[i, j]] * x[j];
        }
        x[i] = s / l[[i, i]];
    }
    x
}

/// Solve `Lᵀ x = b` for lower-triangular `L` by backward substitution.
pub fn backward_solve_transpose(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let n = l.nrows();
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut s = b[i];
        for j in (i + 1)..n {
            s -= l[[j, i]] * x[j];
        }
        x[i] = s / l[[i, i]];
    }
    x
}

/// Solve `Ψ x = b` given `Ψ`'s lower Cholesky factor `L`.
pub fn chol_solve(l: &Array2<f64>, b: &Array1<f64>) -> Array1<f64> {
    let y = forward_solve(l, b);
    backward_solve_transpose(l, &y)
}

/// `log det(Ψ) = 2 sum(log diag(L))` for `Ψ = L Lᵀ`.
pub fn log_det_from_chol(l: &Array2<f64>) -> f64 {
    2.0 * l.diag().iter().map(|v| v.ln()).sum::<f64>()
}

/// Dense matrix inverse; wraps `ndarray_linalg::Inverse` and maps failure
/// onto [`GpremError::CovNotPsd`] (callers only ever invert covariance-like
/// matrices in this engine).
pub fn inv(a: &Array2<f64>) -> Result<Array2<f64>> {
    a.inv().map_err(|_| GpremError::CovNotPsd)
}

/// A minimal compressed-row sparse lower-triangular matrix, standing in for
/// a sparse-linear-algebra crate the teacher's stack does not carry.
/// Entries are not required to be sorted within a row.
#[derive(Debug, Clone)]
pub struct SparseLowerTriangular {
    pub n: usize,
    pub row_ptr: Vec<usize>,
    pub col_idx: Vec<usize>,
    pub values: Vec<f64>,
}

impl SparseLowerTriangular {
    pub fn from_dense_pattern(dense: &Array2<f64>, tol: f64) -> Self {
        let n = dense.nrows();
        let mut row_ptr = vec![0usize; n + 1];
        let mut col_idx = Vec::new();
        let mut values = Vec::new();
        for i in 0..n {
            for j in 0..=i {
                let v = dense[[i, j]];
                if v.abs() > tol {
                    col_idx.push(j);
                    values.push(v);
                }
            }
            row_ptr[i + 1] = col_idx.len();
        }
        Self { n, row_ptr, col_idx, values }
    }

    /// Forward-substitution solve `L x = b` exploiting the sparsity
    /// pattern (assumes the diagonal entry of each row is present).
    pub fn forward_solve(&self, b: &Array1<f64>) -> Array1<f64> {
        let mut x = Array1::<f64>::zeros(self.n);
        for i in 0..self.n {
            let start = self.row_ptr[i];
            let end = self.row_ptr[i + 1];
            let mut s = b[i];
            let mut diag = 1.0;
            for k in start..end {
                let j = self.col_idx[k];
                if j == i {
                    diag = self.values[k];
                } else {
                    s -= self.values[k] * x[j];
                }
            }
            x[i] = s / diag;
        }
        x
    }

    /// `L v` (dense matrix-vector product over the stored lower-triangular
    /// pattern, diagonal included).
    pub fn matvec(&self, v: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::<f64>::zeros(self.n);
        for i in 0..self.n {
            let start = self.row_ptr[i];
            let end = self.row_ptr[i + 1];
            let mut s = 0.0;
            for k in start..end {
                s += self.values[k] * v[self.col_idx[k]];
            }
            out[i] = s;
        }
        out
    }

    /// `Lᵀ v`, scattering each row's contribution into its column.
    pub fn matvec_transpose(&self, v: &Array1<f64>) -> Array1<f64> {
        let mut out = Array1::<f64>::zeros(self.n);
        for i in 0..self.n {
            let start = self.row_ptr[i];
            let end = self.row_ptr[i + 1];
            for k in start..end {
                out[self.col_idx[k]] += self.values[k] * v[i];
            }
        }
        out
    }
}

/// Conjugate-gradient solve of `A x = b` for symmetric positive-definite
/// `A`, optionally left-preconditioned by `m_inv` (a closure applying the
/// preconditioner's action). Used by the iterative Vecchia path.
pub fn conjugate_gradient<F, G>(
    apply_a: F,
    b: &Array1<f64>,
    apply_m_inv: G,
    max_iter: usize,
    tol: f64,
) -> (Array1<f64>, usize)
where
    F: Fn(&Array1<f64>) -> Array1<f64>,
    G: Fn(&Array1<f64>) -> Array1<f64>,
{
    let n = b.len();
    let mut x = Array1::<f64>::zeros(n);
    let mut r = b - &apply_a(&x);
    let mut z = apply_m_inv(&r);
    let mut p = z.clone();
    let mut rz_old = r.dot(&z);
    let b_norm = b.dot(b).sqrt().max(1e-300);

    for iter in 0..max_iter {
        if (r.dot(&r)).sqrt() / b_norm < tol {
            return (x, iter);
        }
        let ap = apply_a(&p);
        let alpha = rz_old / p.dot(&ap).max(1e-300);
        x = &x + &(&p * alpha);
        r = &r - &(&ap * alpha);
        z = apply_m_inv(&r);
        let rz_new = r.dot(&z);
        let beta = rz_new / rz_old.max(1e-300);
        p = &z + &(&p * beta);
        rz_old = rz_new;
    }
    (x, max_iter)
}

/// Shared-memory parallel-for abstraction: applies `f` to every element of
/// `slice` with static scheduling. Dispatches to `rayon` under the
/// `parallel` feature, falls back to a sequential loop otherwise — the
/// call site never needs a `#[cfg(feature = ...)]`.
pub fn par_for_each_mut<T, F>(slice: &mut [T], f: F)
where
    T: Send,
    F: Fn(usize, &mut T) + Sync,
{
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        slice.par_iter_mut().enumerate().for_each(|(i, v)| f(i, v));
    }
    #[cfg(not(feature = "parallel"))]
    {
        for (i, v) in slice.iter_mut().enumerate() {
            f(i, v);
        }
    }
}
