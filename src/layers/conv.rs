use super::{CaptureHooks, KfacLayer, KroneckerFactors, check_grads, grads_to_mat, mat_to_grads};
use crate::error::KfacError;
use crate::modules::{ConvGeometry, ConvModule};
use crate::patches::extract_patches;
use crate::types::{LayerConfig, SharedTensor};
use ndarray::{Array2, Array3, ArrayD, ArrayViewD, Ix2};

const LABEL: &str = "conv";

/// K-FAC block for an N-dimensional convolution.
///
/// Every spatial location of every example is treated as one sample of the
/// activation and sensitivity statistics.
#[derive(Debug, Clone)]
pub struct ConvLayer {
    module: ConvModule,
    factors: KroneckerFactors,
    /// `(batch, locations, in_channels * prod(kernel_size))`
    activations: Option<Array3<f64>>,
    /// `(batch, locations, out_channels)`
    sensitivities: Option<Array3<f64>>,
}

/// Move the channel axis of a `(batch, channels, l_1, ..., l_n)` gradient
/// last and merge the location axes, keeping row-major location order.
fn locations_last(grad: ArrayViewD<'_, f64>, channels: usize) -> Array3<f64> {
    let ndim = grad.ndim();
    let batch = grad.shape()[0];
    let locations: usize = grad.shape()[2..].iter().product();
    let mut perm: Vec<usize> = vec![0];
    perm.extend(2..ndim);
    perm.push(1);
    let permuted = grad.permuted_axes(perm);
    let mut out = Array3::<f64>::zeros((batch, locations, channels));
    for (dst, src) in out.iter_mut().zip(permuted.iter()) {
        *dst = *src;
    }
    out
}

fn flatten_locations(x: &Array3<f64>) -> Result<Array2<f64>, KfacError> {
    let (batch, locations, features) = x.dim();
    x.view()
        .into_shape_with_order((batch * locations, features))
        .map(|v| v.to_owned())
        .map_err(|_| {
            KfacError::shape_mismatch(
                format!("{LABEL} capture"),
                &[batch * locations, features],
                x.shape(),
            )
        })
}

impl ConvLayer {
    pub fn new(module: ConvModule, config: &LayerConfig) -> Result<Self, KfacError> {
        module.validate()?;
        let in_features = module.geometry.patch_size() + usize::from(module.bias.is_some());
        let factors = KroneckerFactors::new(in_features, module.geometry.out_channels, config)?;
        Ok(Self {
            module,
            factors,
            activations: None,
            sensitivities: None,
        })
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.module.geometry
    }

    pub fn n_dim(&self) -> usize {
        self.module.geometry.n_dim()
    }

    pub fn activations(&self) -> Option<&Array3<f64>> {
        self.activations.as_ref()
    }

    pub fn sensitivities(&self) -> Option<&Array3<f64>> {
        self.sensitivities.as_ref()
    }

    /// Spatial locations per example in the latest forward capture.
    pub fn num_locations(&self) -> Result<usize, KfacError> {
        self.activations
            .as_ref()
            .map(|a| a.dim().1)
            .ok_or(KfacError::MissingCapture {
                layer: LABEL,
                which: "activations",
            })
    }

    /// Per-factor damping `(activation, sensitivity)`, normalized by the
    /// number of spatial locations of the latest capture.
    pub fn compute_damping(&self, damping: f64) -> Result<(f64, f64), KfacError> {
        let locations = self.num_locations()?;
        self.factors.compute_damping(damping, Some(locations as f64))
    }
}

impl CaptureHooks for ConvLayer {
    fn capture_forward(&mut self, input: ArrayViewD<'_, f64>) -> Result<(), KfacError> {
        self.activations = Some(extract_patches(input, &self.module.geometry)?);
        Ok(())
    }

    fn capture_backward(&mut self, grad_output: ArrayViewD<'_, f64>) -> Result<(), KfacError> {
        let geometry = &self.module.geometry;
        if grad_output.ndim() != geometry.n_dim() + 2
            || grad_output.shape()[1] != geometry.out_channels
        {
            return Err(KfacError::shape_mismatch(
                format!("{LABEL} output gradient (batch, out_channels, ...)"),
                &[geometry.n_dim() + 2, geometry.out_channels],
                grad_output.shape(),
            ));
        }
        self.sensitivities = Some(locations_last(grad_output, geometry.out_channels));
        Ok(())
    }
}

impl KfacLayer for ConvLayer {
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
        let act = flatten_locations(act)?;
        let sen = flatten_locations(sen)?;
        let has_bias = self.has_bias();
        self.factors.update(LABEL, act.view(), sen.view(), has_bias)
    }

    fn multiply_preconditioner(
        &self,
        grads: Vec<ArrayD<f64>>,
        damping: f64,
    ) -> Result<Vec<ArrayD<f64>>, KfacError> {
        check_grads(LABEL, &grads, &self.vars())?;
        let renorm_coeff = self.normalization_factor();
        let locations = self.num_locations()?;

        // Weight (out, in, k_1, ..., k_n) flattens to (out, in * prod(k)).
        let mat_grads = grads_to_mat(&grads[0], grads.get(1));
        let nat_grads =
            self.factors
                .precondition(&mat_grads, damping, Some(locations as f64), renorm_coeff)?;
        debug_assert_eq!(nat_grads.raw_dim(), Ix2(self.out_features(), self.in_features()));
        mat_to_grads(&nat_grads, grads[0].shape(), self.has_bias())
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
        self.module.geometry.patch_size() + usize::from(self.has_bias())
    }

    fn out_features(&self) -> usize {
        self.module.geometry.out_channels
    }

    fn activation_covariance(&self) -> Array2<f64> {
        self.factors.activation_covariance()
    }

    fn sensitivity_covariance(&self) -> Array2<f64> {
        self.factors.sensitivity_covariance()
    }

    /// Locations per example: the covariances count every location as a
    /// sample, while the weight gradient is one observation per example.
    fn normalization_factor(&self) -> f64 {
        self.activations
            .as_ref()
            .map(|a| a.dim().1 as f64)
            .unwrap_or(1.0)
    }
}
