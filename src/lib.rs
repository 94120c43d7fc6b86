#![deny(dead_code)]
#![deny(unused_imports)]

pub mod error;
pub mod layers;
pub mod linalg;
pub mod modules;
pub mod moving_average;
pub mod patches;
pub mod types;

pub use error::KfacError;
pub use layers::{CaptureHooks, ConvLayer, IdentityLayer, KfacLayer, LinearLayer};
pub use linalg::faer_ndarray::FaerLinalgError;
pub use linalg::utils::{
    append_homog, center, compute_cov, compute_pi_adjusted_damping, compute_pi_tracenorm,
    inverse_by_cholesky,
};
pub use modules::{ConvGeometry, ConvModule, LinearModule};
pub use moving_average::MovingAverage;
pub use patches::extract_patches;
pub use types::{AveragingPolicy, LayerConfig, PaddingMode, SharedTensor, shared_tensor};
