use super::{CaptureHooks, KfacLayer, KroneckerFactors, check_grads, grads_to_mat, mat_to_grads};
use crate::error::KfacError;
use crate::modules::LinearModule;
use crate::types::{LayerConfig, SharedTensor};
use ndarray::{Array2, ArrayD, ArrayViewD};

const LABEL: &str = "linear";

/// K-FAC block for a dense layer.
#[derive(Debug, Clone)]
pub struct LinearLayer {
    module: LinearModule,
    factors: KroneckerFactors,
    activations: Option<Array2<f64>>,
    sensitivities: Option<Array2<f64>>,
}

/// Copy a `(..., width)` tensor into a `(rows, width)` matrix.
fn flatten_rows(x: ArrayViewD<'_, f64>, width: usize, what: &str) -> Result<Array2<f64>, KfacError> {
    let last = x.shape().last().copied().unwrap_or(0);
    if x.ndim() == 0 || last != width {
        return Err(KfacError::shape_mismatch(
            format!("{LABEL} {what} trailing dimension"),
            &[width],
            x.shape(),
        ));
    }
    let rows = if width == 0 { 0 } else { x.len() / width };
    Array2::from_shape_vec((rows, width), x.iter().copied().collect())
        .map_err(|_| KfacError::shape_mismatch(format!("{LABEL} {what}"), &[rows, width], x.shape()))
}

impl LinearLayer {
    pub fn new(module: LinearModule, config: &LayerConfig) -> Result<Self, KfacError> {
        module.validate()?;
        let in_features = module.in_features + usize::from(module.bias.is_some());
        let factors = KroneckerFactors::new(in_features, module.out_features, config)?;
        Ok(Self {
            module,
            factors,
            activations: None,
            sensitivities: None,
        })
    }

    pub fn module(&self) -> &LinearModule {
        &self.module
    }

    /// Latest forward capture, `(rows, in_features_unbiased)`.
    pub fn activations(&self) -> Option<&Array2<f64>> {
        self.activations.as_ref()
    }

    /// Latest backward capture, `(rows, out_features)`.
    pub fn sensitivities(&self) -> Option<&Array2<f64>> {
        self.sensitivities.as_ref()
    }

    /// Per-factor damping `(activation, sensitivity)` for a requested damping.
    pub fn compute_damping(&self, damping: f64) -> Result<(f64, f64), KfacError> {
        self.factors.compute_damping(damping, None)
    }

    pub fn grads_to_mat(&self, grads: &[ArrayD<f64>]) -> Result<Array2<f64>, KfacError> {
        check_grads(LABEL, grads, &self.vars())?;
        Ok(grads_to_mat(&grads[0], grads.get(1)))
    }

    pub fn mat_to_grads(&self, mat_grads: &Array2<f64>) -> Result<Vec<ArrayD<f64>>, KfacError> {
        let expected = [self.module.out_features, self.in_features()];
        if mat_grads.shape() != expected {
            return Err(KfacError::shape_mismatch(
                format!("{LABEL} gradient matrix"),
                &expected,
                mat_grads.shape(),
            ));
        }
        mat_to_grads(
            mat_grads,
            &[self.module.out_features, self.module.in_features],
            self.has_bias(),
        )
    }
}

impl CaptureHooks for LinearLayer {
    fn capture_forward(&mut self, input: ArrayViewD<'_, f64>) -> Result<(), KfacError> {
        self.activations = Some(flatten_rows(input, self.module.in_features, "input")?);
        Ok(())
    }

    fn capture_backward(&mut self, grad_output: ArrayViewD<'_, f64>) -> Result<(), KfacError> {
        self.sensitivities = Some(flatten_rows(
            grad_output,
            self.module.out_features,
            "output gradient",
        )?);
        Ok(())
    }
}

impl KfacLayer for LinearLayer {
    fn setup(&mut self, config: &LayerConfig) -> Result<(), KfacError> {
        self.factors.setup(config)
    }

    fn update_cov(&mut self) -> Result<(), KfacError> {
        let act = self.activations.as_ref().ok_or(KfacError::MissingCapture {
            layer: LABEL,
            which: "activations",
        })?;
        let sen = self.sensitivities.as_ref().ok_or(KfacError::MissingCapture {
            layer: LABEL,
            which: "sensitivities",
        })?;
        let has_bias = self.has_bias();
        self.factors.update(LABEL, act.view(), sen.view(), has_bias)
    }

    fn multiply_preconditioner(
        &self,
        grads: Vec<ArrayD<f64>>,
        damping: f64,
    ) -> Result<Vec<ArrayD<f64>>, KfacError> {
        let mat_grads = self.grads_to_mat(&grads)?;
        let nat_grads =
            self.factors
                .precondition(&mat_grads, damping, None, self.normalization_factor())?;
        self.mat_to_grads(&nat_grads)
    }

    fn vars(&self) -> Vec<SharedTensor> {
        let mut vars = vec![self.module.weight.clone()];
        vars.extend(self.module.bias.clone());
        vars
    }

    fn has_bias(&self) -> bool {
        self.module.bias.is_some()
    }

    fn in_features(&self) -> usize {
        self.module.in_features + usize::from(self.has_bias())
    }

    fn out_features(&self) -> usize {
        self.module.out_features
    }

    fn activation_covariance(&self) -> Array2<f64> {
        self.factors.activation_covariance()
    }

    fn sensitivity_covariance(&self) -> Array2<f64> {
        self.factors.sensitivity_covariance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array3, array};

    fn biased_layer(center: bool) -> LinearLayer {
        let config = LayerConfig {
            center,
            ..LayerConfig::default()
        };
        LinearLayer::new(LinearModule::new(3, 2, true), &config).unwrap()
    }

    #[test]
    fn covariance_shapes_include_bias_column() {
        let mut layer = biased_layer(false);
        assert_eq!((layer.in_features(), layer.out_features()), (4, 2));

        let x = array![[1.0, 0.0, 2.0], [0.5, -1.0, 0.0], [0.0, 1.0, 1.0]];
        let g = array![[0.1, -0.2], [0.3, 0.0], [-0.1, 0.2]];
        layer.capture_forward(x.view().into_dyn()).unwrap();
        layer.capture_backward(g.view().into_dyn()).unwrap();
        layer.update_cov().unwrap();

        let a = layer.activation_covariance();
        let s = layer.sensitivity_covariance();
        assert_eq!(a.dim(), (4, 4));
        assert_eq!(s.dim(), (2, 2));
        // The homogeneous coordinate contributes 1 on the bias diagonal and
        // the feature means on the bias row.
        assert_abs_diff_eq!(a[[3, 3]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(a[[0, 3]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(a[[3, 2]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s[[0, 0]], (0.01 + 0.09 + 0.01) / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn leading_axes_are_flattened_into_rows() {
        let mut layer = biased_layer(false);
        let x = Array3::<f64>::ones((2, 5, 3));
        layer.capture_forward(x.view().into_dyn()).unwrap();
        assert_eq!(layer.activations().unwrap().dim(), (10, 3));

        let wrong = Array2::<f64>::ones((4, 2));
        assert!(matches!(
            layer.capture_forward(wrong.view().into_dyn()),
            Err(KfacError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn centered_covariance_ignores_constant_offsets() {
        let mut layer = biased_layer(true);
        let x = array![[5.0, 5.0, 5.0], [5.0, 5.0, 5.0]];
        let g = array![[2.0, -1.0], [2.0, -1.0]];
        layer.capture_forward(x.view().into_dyn()).unwrap();
        layer.capture_backward(g.view().into_dyn()).unwrap();
        layer.update_cov().unwrap();

        let a = layer.activation_covariance();
        for i in 0..3 {
            for j in 0..4 {
                assert_abs_diff_eq!(a[[i, j]], 0.0, epsilon = 1e-12);
            }
        }
        assert_abs_diff_eq!(a[[3, 3]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(layer.sensitivity_covariance().sum(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn update_without_captures_is_reported() {
        let mut layer = biased_layer(false);
        assert!(matches!(
            layer.update_cov(),
            Err(KfacError::MissingCapture {
                which: "activations",
                ..
            })
        ));
        layer
            .capture_forward(Array2::<f64>::ones((2, 3)).view().into_dyn())
            .unwrap();
        assert!(matches!(
            layer.update_cov(),
            Err(KfacError::MissingCapture {
                which: "sensitivities",
                ..
            })
        ));
    }

    #[test]
    fn grads_round_trip_through_matrix_layout() {
        let layer = biased_layer(false);
        let w = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]].into_dyn();
        let b = array![7.0, 8.0].into_dyn();
        let mat = layer.grads_to_mat(&[w.clone(), b.clone()]).unwrap();
        assert_eq!(mat, array![[1.0, 2.0, 3.0, 7.0], [4.0, 5.0, 6.0, 8.0]]);
        let back = layer.mat_to_grads(&mat).unwrap();
        assert_eq!(back, vec![w, b]);
    }

    #[test]
    fn preconditioning_rejects_bad_inputs() {
        let mut layer = biased_layer(false);
        layer
            .capture_forward(array![[1.0, 0.0, 0.0]].view().into_dyn())
            .unwrap();
        layer
            .capture_backward(array![[1.0, 0.0]].view().into_dyn())
            .unwrap();
        layer.update_cov().unwrap();

        let w = ArrayD::<f64>::zeros(ndarray::IxDyn(&[2, 3]));
        let b = ArrayD::<f64>::zeros(ndarray::IxDyn(&[2]));
        assert!(matches!(
            layer.multiply_preconditioner(vec![w.clone()], 0.1),
            Err(KfacError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            layer.multiply_preconditioner(vec![w.clone(), b.clone()], 0.0),
            Err(KfacError::InvalidDamping(_))
        ));
        assert!(matches!(
            layer.multiply_preconditioner(vec![w, b], f64::NAN),
            Err(KfacError::InvalidDamping(_))
        ));
    }
}
