use super::{CaptureHooks, KfacLayer};
use crate::error::KfacError;
use crate::types::{LayerConfig, SharedTensor};
use ndarray::{Array2, ArrayD, ArrayViewD};

/// Placeholder for modules without a curvature block (embeddings, parameter
/// free ops), so the optimizer can iterate every registered layer uniformly.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityLayer;

impl IdentityLayer {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureHooks for IdentityLayer {
    fn capture_forward(&mut self, _input: ArrayViewD<'_, f64>) -> Result<(), KfacError> {
        Ok(())
    }

    fn capture_backward(&mut self, _grad_output: ArrayViewD<'_, f64>) -> Result<(), KfacError> {
        Ok(())
    }
}

impl KfacLayer for IdentityLayer {
    fn setup(&mut self, _config: &LayerConfig) -> Result<(), KfacError> {
        Ok(())
    }

    fn update_cov(&mut self) -> Result<(), KfacError> {
        Ok(())
    }

    fn multiply_preconditioner(
        &self,
        grads: Vec<ArrayD<f64>>,
        _damping: f64,
    ) -> Result<Vec<ArrayD<f64>>, KfacError> {
        Ok(grads)
    }

    fn vars(&self) -> Vec<SharedTensor> {
        Vec::new()
    }

    fn has_bias(&self) -> bool {
        false
    }

    fn in_features(&self) -> usize {
        0
    }

    fn out_features(&self) -> usize {
        0
    }

    fn activation_covariance(&self) -> Array2<f64> {
        Array2::zeros((0, 0))
    }

    fn sensitivity_covariance(&self) -> Array2<f64> {
        Array2::zeros((0, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{IxDyn, array};

    #[test]
    fn passes_gradients_through_untouched() {
        let mut layer = IdentityLayer::new();
        let grads = vec![array![[1.0, -2.0]].into_dyn(), ArrayD::zeros(IxDyn(&[3]))];
        let ptr = grads[0].as_ptr();
        layer.capture_forward(grads[0].view()).unwrap();
        layer.update_cov().unwrap();

        let out = layer.multiply_preconditioner(grads.clone(), -7.0).unwrap();
        assert_eq!(out, grads);
        // Same buffer comes back: nothing is copied.
        let moved = layer.multiply_preconditioner(grads, f64::NAN).unwrap();
        assert_eq!(moved[0].as_ptr(), ptr);

        assert!(layer.vars().is_empty());
        assert_eq!(layer.activation_covariance().dim(), (0, 0));
        assert_eq!(layer.normalization_factor(), 1.0);
    }
}
