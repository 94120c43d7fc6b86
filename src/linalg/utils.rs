//! Numeric building blocks shared by every K-FAC layer: batch centering,
//! Gram covariances, homogeneous augmentation, damped inversion and the
//! Pi-adjusted split of a damping budget between two Kronecker factors.

use crate::linalg::faer_ndarray::{FaerCholesky, FaerLinalgError, fast_ata};
use faer::Side;
use ndarray::{Array2, ArrayBase, Axis, Data, Ix2, s};

#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}

/// Subtract the column-wise mean from every row.
pub fn center<S: Data<Elem = f64>>(x: &ArrayBase<S, Ix2>) -> Array2<f64> {
    match x.mean_axis(Axis(0)) {
        Some(mean) => x - &mean,
        None => x.to_owned(),
    }
}

/// `X^T X / n` for a batch of row vectors.
///
/// The caller guarantees `n >= 1`; layers reject empty captures before
/// reaching this point.
pub fn compute_cov<S: Data<Elem = f64>>(x: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let n = x.nrows().max(1) as f64;
    let mut cov = fast_ata(x);
    cov.mapv_inplace(|v| v / n);
    cov
}

/// Append a constant-one column as the last feature.
pub fn append_homog<S: Data<Elem = f64>>(x: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let (n, p) = x.dim();
    let mut out = Array2::<f64>::ones((n, p + 1));
    out.slice_mut(s![.., ..p]).assign(x);
    out
}

pub fn add_ridge<S: Data<Elem = f64>>(matrix: &ArrayBase<S, Ix2>, ridge: f64) -> Array2<f64> {
    let mut regularized = matrix.to_owned();
    if ridge <= 0.0 {
        return regularized;
    }
    for i in 0..regularized.nrows().min(regularized.ncols()) {
        regularized[[i, i]] += ridge;
    }
    regularized
}

/// `(M + damping * I)^{-1}` through a Cholesky factorization.
///
/// Fails when the damped matrix is not positive definite; no ridge escalation
/// is attempted here.
pub fn inverse_by_cholesky<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
    damping: f64,
) -> Result<Array2<f64>, FaerLinalgError> {
    let (rows, cols) = matrix.dim();
    if rows != cols {
        return Err(FaerLinalgError::NotSquare { rows, cols });
    }
    let damped = add_ridge(matrix, damping);
    let mut inv = damped.cholesky(Side::Lower)?.inverse();

    // Triangular solves leave tiny asymmetry; enforce symmetry explicitly.
    for i in 0..rows {
        for j in (i + 1)..rows {
            let avg = 0.5 * (inv[[i, j]] + inv[[j, i]]);
            inv[[i, j]] = avg;
            inv[[j, i]] = avg;
        }
    }
    Ok(inv)
}

pub fn trace<S: Data<Elem = f64>>(matrix: &ArrayBase<S, Ix2>) -> f64 {
    let mut acc = KahanSum::default();
    for &v in matrix.diag() {
        acc.add(v);
    }
    acc.sum()
}

/// Ratio of the average eigenvalues of two factors, `sqrt(tr(L)/dim(L) / (tr(R)/dim(R)))`.
///
/// Returns 1 when either normalized trace is zero, negative or not finite
/// (e.g. a factor that has not seen any samples yet).
pub fn compute_pi_tracenorm<S1, S2>(left: &ArrayBase<S1, Ix2>, right: &ArrayBase<S2, Ix2>) -> f64
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let left_dim = left.nrows();
    let right_dim = right.nrows();
    if left_dim == 0 || right_dim == 0 {
        return 1.0;
    }
    let left_norm = trace(left) / left_dim as f64;
    let right_norm = trace(right) / right_dim as f64;
    let pi = (left_norm / right_norm).sqrt();
    if left_norm > 0.0 && right_norm > 0.0 && pi.is_finite() && pi > 0.0 {
        pi
    } else {
        log::debug!(
            "pi trace-norm fallback: left {:.3e}, right {:.3e}",
            left_norm,
            right_norm
        );
        1.0
    }
}

/// Split `damping` into `(damping * pi, damping / pi)` for the left and right
/// factors, so their product stays `damping^2`.
pub fn compute_pi_adjusted_damping<S1, S2>(
    left: &ArrayBase<S1, Ix2>,
    right: &ArrayBase<S2, Ix2>,
    damping: f64,
) -> (f64, f64)
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let pi = compute_pi_tracenorm(left, right);
    (damping * pi, damping / pi)
}
