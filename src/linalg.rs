//! Dense linear algebra kernels for Hessian-guided quantization
//!
//! GPTQ needs three factorizations in sequence: a lower Cholesky of the
//! damped Hessian, the inverse of that factorization, and an upper
//! Cholesky re-factorization of the inverse. The reference corpus carries
//! no pure-Rust Cholesky, so the kernels live here, on `f32` ndarray
//! matrices.

use ndarray::Array2;
use thiserror::Error;

/// Cholesky factorization failure: the matrix is not positive-definite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("matrix is not positive-definite at pivot column {pivot}")]
pub struct NotPositiveDefinite {
    /// Column index of the first non-positive pivot.
    pub pivot: usize,
}

/// Result type for factorization kernels.
pub type Result<T> = std::result::Result<T, NotPositiveDefinite>;

/// Lower Cholesky factorization, `A = L Lᵀ`.
///
/// `a` must be square and symmetric; only the lower triangle is read.
/// Returns the lower-triangular factor with zeros above the diagonal.
pub fn cholesky_lower(a: &Array2<f32>) -> Result<Array2<f32>> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols(), "cholesky_lower requires a square matrix");
    let mut l = Array2::<f32>::zeros((n, n));

    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if !(diag > 0.0) || !diag.is_finite() {
            return Err(NotPositiveDefinite { pivot: j });
        }
        let diag = diag.sqrt();
        l[[j, j]] = diag;

        for i in (j + 1)..n {
            let mut v = a[[i, j]];
            for k in 0..j {
                v -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = v / diag;
        }
    }
    Ok(l)
}

/// Upper Cholesky factorization, `A = Uᵀ U`.
///
/// Same contract as [`cholesky_lower`] with the factor stored in the
/// upper triangle.
pub fn cholesky_upper(a: &Array2<f32>) -> Result<Array2<f32>> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols(), "cholesky_upper requires a square matrix");
    let mut u = Array2::<f32>::zeros((n, n));

    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= u[[k, j]] * u[[k, j]];
        }
        if !(diag > 0.0) || !diag.is_finite() {
            return Err(NotPositiveDefinite { pivot: j });
        }
        let diag = diag.sqrt();
        u[[j, j]] = diag;

        for i in (j + 1)..n {
            let mut v = a[[j, i]];
            for k in 0..j {
                v -= u[[k, j]] * u[[k, i]];
            }
            u[[j, i]] = v / diag;
        }
    }
    Ok(u)
}

/// Invert a lower-triangular matrix by forward substitution.
///
/// Diagonal entries must be non-zero (guaranteed for a Cholesky factor).
pub fn invert_lower_triangular(l: &Array2<f32>) -> Array2<f32> {
    let n = l.nrows();
    let mut m = Array2::<f32>::zeros((n, n));

    for j in 0..n {
        m[[j, j]] = 1.0 / l[[j, j]];
        for i in (j + 1)..n {
            let mut v = 0.0;
            for k in j..i {
                v -= l[[i, k]] * m[[k, j]];
            }
            m[[i, j]] = v / l[[i, i]];
        }
    }
    m
}

/// Inverse of `L Lᵀ` from its lower Cholesky factor.
///
/// Uses `(L Lᵀ)⁻¹ = L⁻ᵀ L⁻¹ = Mᵀ M` with `M = L⁻¹`.
pub fn cholesky_inverse(l: &Array2<f32>) -> Array2<f32> {
    let m = invert_lower_triangular(l);
    m.t().dot(&m)
}
