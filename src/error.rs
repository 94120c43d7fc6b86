use crate::linalg::faer_ndarray::FaerLinalgError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KfacError {
    #[error(
        "{layer} layer has no captured {which}; run the forward and backward pass before updating or preconditioning"
    )]
    MissingCapture {
        layer: &'static str,
        which: &'static str,
    },

    #[error("{layer} layer captured an empty batch; covariance needs at least one row")]
    EmptyBatch { layer: &'static str },

    #[error("Shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Damping must be finite and strictly positive, got {0}")]
    InvalidDamping(f64),

    #[error("Invalid layer configuration: {0}")]
    InvalidConfig(String),

    #[error("Inverting the {factor} covariance with damping {damping:.3e} failed: {source}")]
    Numerical {
        factor: &'static str,
        damping: f64,
        #[source]
        source: FaerLinalgError,
    },
}

impl KfacError {
    pub(crate) fn shape_mismatch(
        what: impl Into<String>,
        expected: &[usize],
        found: &[usize],
    ) -> Self {
        KfacError::ShapeMismatch {
            what: what.into(),
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }
}
