//! # Per-layer K-FAC blocks
//!
//! Every trainable module gets one [`KfacLayer`]. Its Fisher block is
//! approximated as `S ⊗ A`, where `A` is the covariance of the (optionally
//! bias-augmented) layer inputs and `S` the covariance of the gradients
//! flowing into the layer outputs. Preconditioning a gradient `G` of shape
//! `(out, in)` then reduces to `S^{-1} G A^{-1}`.
//!
//! Per training step the host drives each layer through:
//!
//! 1. `capture_forward` with the module input,
//! 2. `capture_backward` with the gradient of the module output,
//! 3. [`KfacLayer::update_cov`],
//! 4. [`KfacLayer::multiply_preconditioner`] with the raw parameter gradients.
//!
//! Layers hold `Rc` parameter handles and are therefore `!Send`; a host that
//! trains on several threads must serialize calls per layer.

pub mod conv;
pub mod identity;
pub mod linear;

pub use conv::ConvLayer;
pub use identity::IdentityLayer;
pub use linear::LinearLayer;

use crate::error::KfacError;
use crate::linalg::faer_ndarray::fast_ab;
use crate::linalg::utils::{
    append_homog, center, compute_cov, compute_pi_adjusted_damping, inverse_by_cholesky,
};
use crate::moving_average::MovingAverage;
use crate::types::{LayerConfig, SharedTensor};
use ndarray::{Array2, ArrayD, ArrayView2, Axis, IxDyn, s};

/// Entry points the host execution engine calls while running a module.
///
/// Captures are value snapshots: the layer copies what it needs and keeps no
/// link to the host's gradient-tracked tensors.
pub trait CaptureHooks {
    /// Receives the module input of the forward pass.
    fn capture_forward(&mut self, input: ndarray::ArrayViewD<'_, f64>) -> Result<(), KfacError>;

    /// Receives the gradient flowing into the module output.
    fn capture_backward(
        &mut self,
        grad_output: ndarray::ArrayViewD<'_, f64>,
    ) -> Result<(), KfacError>;
}

/// Curvature block contract shared by every layer variant.
pub trait KfacLayer: CaptureHooks {
    /// Re-apply configuration options after construction.
    fn setup(&mut self, config: &LayerConfig) -> Result<(), KfacError>;

    /// Fold the latest captures into the running covariance estimates.
    fn update_cov(&mut self) -> Result<(), KfacError>;

    /// Map raw gradients (in `vars()` order) to preconditioned gradients of
    /// identical shapes.
    fn multiply_preconditioner(
        &self,
        grads: Vec<ArrayD<f64>>,
        damping: f64,
    ) -> Result<Vec<ArrayD<f64>>, KfacError>;

    fn vars(&self) -> Vec<SharedTensor>;

    fn has_bias(&self) -> bool;

    /// Columns of the parameter matrix, including the bias column.
    fn in_features(&self) -> usize;

    fn out_features(&self) -> usize;

    fn activation_covariance(&self) -> Array2<f64>;

    fn sensitivity_covariance(&self) -> Array2<f64>;

    /// Divisor applied to the natural gradient.
    fn normalization_factor(&self) -> f64 {
        1.0
    }
}

/// The two running covariance estimates plus the centering switch. Layers
/// compose this instead of sharing a base type.
#[derive(Debug, Clone)]
pub(crate) struct KroneckerFactors {
    activations_cov: MovingAverage,
    sensitivities_cov: MovingAverage,
    center: bool,
}

impl KroneckerFactors {
    pub(crate) fn new(
        in_features: usize,
        out_features: usize,
        config: &LayerConfig,
    ) -> Result<Self, KfacError> {
        config.validate()?;
        Ok(Self {
            activations_cov: MovingAverage::new(in_features, config.averaging),
            sensitivities_cov: MovingAverage::new(out_features, config.averaging),
            center: config.center,
        })
    }

    pub(crate) fn setup(&mut self, config: &LayerConfig) -> Result<(), KfacError> {
        config.validate()?;
        self.center = config.center;
        self.activations_cov.set_policy(config.averaging);
        self.sensitivities_cov.set_policy(config.averaging);
        Ok(())
    }

    pub(crate) fn activation_covariance(&self) -> Array2<f64> {
        self.activations_cov.value()
    }

    pub(crate) fn sensitivity_covariance(&self) -> Array2<f64> {
        self.sensitivities_cov.value()
    }

    /// One covariance update from row-sample matrices. Both inputs must have
    /// the same (non-zero) number of rows.
    pub(crate) fn update(
        &mut self,
        layer: &'static str,
        activations: ArrayView2<'_, f64>,
        sensitivities: ArrayView2<'_, f64>,
        has_bias: bool,
    ) -> Result<(), KfacError> {
        let rows = activations.nrows();
        if rows == 0 || sensitivities.nrows() == 0 {
            return Err(KfacError::EmptyBatch { layer });
        }
        if sensitivities.nrows() != rows {
            return Err(KfacError::shape_mismatch(
                format!("{layer} sensitivity rows (stale capture?)"),
                &[rows],
                &[sensitivities.nrows()],
            ));
        }

        let (act, sen) = if self.center {
            (center(&activations), center(&sensitivities))
        } else {
            (activations.to_owned(), sensitivities.to_owned())
        };
        let act = if has_bias { append_homog(&act) } else { act };

        self.activations_cov.add_to_average(&compute_cov(&act))?;
        self.sensitivities_cov.add_to_average(&compute_cov(&sen))?;
        log::debug!(
            "[KFAC {}] folded {} rows into factors ({}x{}, {}x{}), centered={}",
            layer,
            rows,
            act.ncols(),
            act.ncols(),
            sen.ncols(),
            sen.ncols(),
            self.center
        );
        Ok(())
    }

    /// Pi-adjusted per-factor damping `(activation, sensitivity)`.
    ///
    /// `normalization` scales the requested damping first (the location count
    /// for convolutions); the two values multiply to the scaled damping.
    pub(crate) fn compute_damping(
        &self,
        damping: f64,
        normalization: Option<f64>,
    ) -> Result<(f64, f64), KfacError> {
        if !(damping.is_finite() && damping > 0.0) {
            return Err(KfacError::InvalidDamping(damping));
        }
        let scaled = damping * normalization.unwrap_or(1.0);
        Ok(compute_pi_adjusted_damping(
            &self.activations_cov.value(),
            &self.sensitivities_cov.value(),
            scaled.sqrt(),
        ))
    }

    /// `S^{-1} G A^{-1} / renorm` with both factors damped. `mat_grads` must
    /// be `(out_features, in_features)`.
    pub(crate) fn precondition(
        &self,
        mat_grads: &Array2<f64>,
        damping: f64,
        normalization: Option<f64>,
        renorm: f64,
    ) -> Result<Array2<f64>, KfacError> {
        let expected = [self.sensitivities_cov.dim(), self.activations_cov.dim()];
        if mat_grads.shape() != expected {
            return Err(KfacError::shape_mismatch(
                "gradient matrix against covariance factors",
                &expected,
                mat_grads.shape(),
            ));
        }
        let (a_damp, s_damp) = self.compute_damping(damping, normalization)?;

        let act_cov_inverse = inverse_by_cholesky(&self.activations_cov.value(), a_damp)
            .map_err(|source| {
                log::warn!(
                    "[KFAC] activation factor not positive definite at damping {:.3e}",
                    a_damp
                );
                KfacError::Numerical {
                    factor: "activation",
                    damping: a_damp,
                    source,
                }
            })?;
        let sen_cov_inverse = inverse_by_cholesky(&self.sensitivities_cov.value(), s_damp)
            .map_err(|source| {
                log::warn!(
                    "[KFAC] sensitivity factor not positive definite at damping {:.3e}",
                    s_damp
                );
                KfacError::Numerical {
                    factor: "sensitivity",
                    damping: s_damp,
                    source,
                }
            })?;

        let mut nat_grads = fast_ab(&fast_ab(&sen_cov_inverse, mat_grads), &act_cov_inverse);
        if renorm != 1.0 {
            nat_grads.mapv_inplace(|v| v / renorm);
        }
        Ok(nat_grads)
    }
}

/// Check gradient count and shapes against the wrapped parameters.
pub(crate) fn check_grads(
    layer: &'static str,
    grads: &[ArrayD<f64>],
    vars: &[SharedTensor],
) -> Result<(), KfacError> {
    if grads.len() != vars.len() {
        return Err(KfacError::shape_mismatch(
            format!("{layer} gradient count"),
            &[vars.len()],
            &[grads.len()],
        ));
    }
    for (i, (grad, var)) in grads.iter().zip(vars).enumerate() {
        let var = var.borrow();
        if grad.shape() != var.shape() {
            return Err(KfacError::shape_mismatch(
                format!("{layer} gradient {i}"),
                var.shape(),
                grad.shape(),
            ));
        }
    }
    Ok(())
}

/// Assemble `(out, in [+1])` from a weight gradient whose leading axis is
/// `out` and an optional bias gradient, which becomes the last column.
pub(crate) fn grads_to_mat(weights: &ArrayD<f64>, bias: Option<&ArrayD<f64>>) -> Array2<f64> {
    let out = weights.shape()[0];
    let cols = if out == 0 { 0 } else { weights.len() / out };
    let extra = usize::from(bias.is_some());
    let mut mat = Array2::<f64>::zeros((out, cols + extra));
    for (dst, src) in mat
        .slice_mut(s![.., ..cols])
        .iter_mut()
        .zip(weights.iter())
    {
        *dst = *src;
    }
    if let Some(bias) = bias {
        for (dst, src) in mat.column_mut(cols).iter_mut().zip(bias.iter()) {
            *dst = *src;
        }
    }
    mat
}

/// Inverse of [`grads_to_mat`]: split the bias column back off and restore
/// the weight shape.
pub(crate) fn mat_to_grads(
    mat: &Array2<f64>,
    weight_shape: &[usize],
    has_bias: bool,
) -> Result<Vec<ArrayD<f64>>, KfacError> {
    let cols = mat.ncols().saturating_sub(usize::from(has_bias));
    let weight_values: Vec<f64> = mat.slice(s![.., ..cols]).iter().copied().collect();
    let weights = ArrayD::from_shape_vec(IxDyn(weight_shape), weight_values).map_err(|_| {
        KfacError::shape_mismatch("preconditioned weight", weight_shape, &[mat.nrows(), cols])
    })?;
    let mut out = vec![weights];
    if has_bias {
        out.push(mat.index_axis(Axis(1), cols).to_owned().into_dyn());
    }
    Ok(out)
}
