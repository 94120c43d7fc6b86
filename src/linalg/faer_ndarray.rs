use faer::linalg::solvers;
pub use faer::linalg::solvers::{Llt as FaerLlt, Solve as FaerSolve};
use faer::linalg::matmul::matmul;
use faer::{Accum, Mat, MatMut, MatRef, Par, Side, get_global_parallelism};
use ndarray::{Array2, ArrayBase, CowArray, Data, Ix2};
use thiserror::Error;

/// Failures of the dense factorizations backing the covariance inverses.
#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("expected a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("matrix contains non-finite entries")]
    NonFinite,
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
}

/// Covariance factors are usually small; below this size the ndarray product
/// is cheaper than setting up a faer GEMM.
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    const MIN_DIM: usize = 32;
    const MIN_WORK: usize = 64 * 64;
    m.max(n).max(k) >= MIN_DIM && m.saturating_mul(n).saturating_mul(k) >= MIN_WORK
}

fn gemm(lhs: MatRef<'_, f64>, rhs: MatRef<'_, f64>) -> Array2<f64> {
    let (m, k, n) = (lhs.nrows(), lhs.ncols(), rhs.ncols());
    let par = if m.min(k).min(n) < 128 {
        Par::Seq
    } else {
        get_global_parallelism()
    };
    let mut out = Mat::<f64>::zeros(m, n);
    matmul(out.as_mut(), Accum::Replace, lhs, rhs, 1.0, par);
    mat_to_array(out.as_ref())
}

/// Mutable faer view over an ndarray matrix, used for in-place solves.
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let (rs, cs) = (array.strides()[0], array.strides()[1]);
    // SAFETY: shape and strides describe the live array, which stays mutably
    // borrowed for the lifetime of the view.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, rs, cs) }
}

/// Gram matrix `Aᵀ A` of an `(n, p)` sample matrix.
pub fn fast_ata<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    let (n, p) = a.dim();
    if !should_use_faer_matmul(p, p, n) {
        return a.t().dot(a);
    }
    let view = FaerArrayView::new(a);
    gemm(view.as_ref().transpose(), view.as_ref())
}

/// Matrix product `A B`.
pub fn fast_ab<S1, S2>(a: &ArrayBase<S1, Ix2>, b: &ArrayBase<S2, Ix2>) -> Array2<f64>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
{
    let (n, p) = a.dim();
    let q = b.ncols();
    debug_assert_eq!(p, b.nrows(), "inner dimensions differ");
    if !should_use_faer_matmul(n, q, p) {
        return a.dot(b);
    }
    gemm(FaerArrayView::new(a).as_ref(), FaerArrayView::new(b).as_ref())
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

/// Read-only faer view of an ndarray matrix. Views with non-positive strides
/// (reversed or broadcast axes) are copied into standard layout first.
pub struct FaerArrayView<'a> {
    data: CowArray<'a, f64, Ix2>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let view = array.view();
        let data = if view.strides().iter().all(|&s| s > 0) {
            CowArray::from(view)
        } else {
            CowArray::from(view.as_standard_layout().into_owned())
        };
        Self { data }
    }

    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (rows, cols) = self.data.dim();
        let (rs, cs) = (self.data.strides()[0], self.data.strides()[1]);
        // SAFETY: pointer, shape and strides all come from `self.data`, which
        // outlives the returned view.
        unsafe { MatRef::from_raw_parts(self.data.as_ptr(), rows, cols, rs, cs) }
    }
}

/// Lower Cholesky factor of a symmetric positive-definite matrix.
pub struct FaerCholeskyFactor {
    factor: FaerLlt<f64>,
    dim: usize,
}

impl FaerCholeskyFactor {
    /// Solve `M X = I`, i.e. materialize `M^{-1}`.
    pub fn inverse(&self) -> Array2<f64> {
        let mut inv = Array2::<f64>::eye(self.dim);
        let mut inv_view = array2_to_mat_mut(&mut inv);
        self.factor.solve_in_place(inv_view.as_mut());
        inv
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let (rows, cols) = self.dim();
        if rows != cols {
            return Err(FaerLinalgError::NotSquare { rows, cols });
        }
        if !self.iter().all(|v| v.is_finite()) {
            return Err(FaerLinalgError::NonFinite);
        }
        let faer_view = FaerArrayView::new(self);
        let factor = FaerLlt::new(faer_view.as_ref(), side).map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor, dim: rows })
    }
}
