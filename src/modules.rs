//! Static descriptions of the host modules a K-FAC layer wraps.
//!
//! The host engine owns the parameter storage; these descriptors carry the
//! shape metadata K-FAC needs plus shared handles to the weight and bias.

use crate::error::KfacError;
use crate::types::{PaddingMode, SharedTensor, shared_tensor};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Dense layer `y = x W^T + b` with `W` of shape (out_features, in_features).
#[derive(Debug, Clone)]
pub struct LinearModule {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: SharedTensor,
    pub bias: Option<SharedTensor>,
}

impl LinearModule {
    /// Zero-initialized parameters.
    pub fn new(in_features: usize, out_features: usize, bias: bool) -> Self {
        Self {
            in_features,
            out_features,
            weight: shared_tensor(ArrayD::zeros(IxDyn(&[out_features, in_features]))),
            bias: bias.then(|| shared_tensor(ArrayD::zeros(IxDyn(&[out_features])))),
        }
    }

    pub fn from_parameters(
        weight: SharedTensor,
        bias: Option<SharedTensor>,
    ) -> Result<Self, KfacError> {
        let (out_features, in_features) = {
            let w = weight.borrow();
            match w.shape() {
                &[out, inp] => (out, inp),
                other => {
                    return Err(KfacError::shape_mismatch(
                        "linear weight rank",
                        &[2],
                        &[other.len()],
                    ));
                }
            }
        };
        let module = Self {
            in_features,
            out_features,
            weight,
            bias,
        };
        module.validate()?;
        Ok(module)
    }

    /// Check the parameter handles against `in_features` / `out_features`.
    /// The storage is shared with the host, so this can fail after a
    /// successful construction if the host swaps a tensor.
    pub fn validate(&self) -> Result<(), KfacError> {
        check_parameter(
            "linear weight",
            &self.weight,
            &[self.out_features, self.in_features],
        )?;
        if let Some(bias) = &self.bias {
            check_parameter("linear bias", bias, &[self.out_features])?;
        }
        Ok(())
    }
}

/// Convolution geometry for any number of spatial dimensions.
///
/// Weight layout is `(out_channels, in_channels, k_1, ..., k_n)`; inputs are
/// `(batch, in_channels, s_1, ..., s_n)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: Vec<usize>,
    pub stride: Vec<usize>,
    pub padding: Vec<usize>,
    #[serde(default)]
    pub padding_mode: PaddingMode,
}

impl ConvGeometry {
    /// Unit stride, no padding.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: Vec<usize>) -> Self {
        let n_dim = kernel_size.len();
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: vec![1; n_dim],
            padding: vec![0; n_dim],
            padding_mode: PaddingMode::Zeros,
        }
    }

    pub fn with_stride(mut self, stride: Vec<usize>) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: Vec<usize>) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_padding_mode(mut self, padding_mode: PaddingMode) -> Self {
        self.padding_mode = padding_mode;
        self
    }

    pub fn n_dim(&self) -> usize {
        self.kernel_size.len()
    }

    pub fn kernel_volume(&self) -> usize {
        self.kernel_size.iter().product()
    }

    /// Length of one flattened receptive field.
    pub fn patch_size(&self) -> usize {
        self.in_channels * self.kernel_volume()
    }

    pub fn weight_shape(&self) -> Vec<usize> {
        let mut shape = vec![self.out_channels, self.in_channels];
        shape.extend_from_slice(&self.kernel_size);
        shape
    }

    pub fn validate(&self) -> Result<(), KfacError> {
        let n = self.n_dim();
        if n == 0 {
            return Err(KfacError::InvalidConfig(
                "convolution needs at least one spatial dimension".to_string(),
            ));
        }
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(KfacError::InvalidConfig(format!(
                "channel counts must be positive, got in={} out={}",
                self.in_channels, self.out_channels
            )));
        }
        if self.kernel_size.contains(&0) {
            return Err(KfacError::InvalidConfig(format!(
                "kernel sizes must be positive, got {:?}",
                self.kernel_size
            )));
        }
        if self.stride.len() != n || self.stride.contains(&0) {
            return Err(KfacError::InvalidConfig(format!(
                "stride {:?} does not fit a {}-d kernel",
                self.stride, n
            )));
        }
        if self.padding.len() != n {
            return Err(KfacError::InvalidConfig(format!(
                "padding {:?} does not fit a {}-d kernel",
                self.padding, n
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConvModule {
    pub geometry: ConvGeometry,
    pub weight: SharedTensor,
    pub bias: Option<SharedTensor>,
}

impl ConvModule {
    /// Zero-initialized parameters.
    pub fn new(geometry: ConvGeometry, bias: bool) -> Result<Self, KfacError> {
        geometry.validate()?;
        let weight = shared_tensor(ArrayD::zeros(IxDyn(&geometry.weight_shape())));
        let bias = bias.then(|| shared_tensor(ArrayD::zeros(IxDyn(&[geometry.out_channels]))));
        Ok(Self {
            geometry,
            weight,
            bias,
        })
    }

    pub fn from_parameters(
        geometry: ConvGeometry,
        weight: SharedTensor,
        bias: Option<SharedTensor>,
    ) -> Result<Self, KfacError> {
        let module = Self {
            geometry,
            weight,
            bias,
        };
        module.validate()?;
        Ok(module)
    }

    /// Geometry checks plus weight `(out, in, k...)` and bias `(out,)` shapes.
    pub fn validate(&self) -> Result<(), KfacError> {
        self.geometry.validate()?;
        check_parameter(
            "convolution weight",
            &self.weight,
            &self.geometry.weight_shape(),
        )?;
        if let Some(bias) = &self.bias {
            check_parameter("convolution bias", bias, &[self.geometry.out_channels])?;
        }
        Ok(())
    }
}

fn check_parameter(
    what: &str,
    handle: &SharedTensor,
    expected: &[usize],
) -> Result<(), KfacError> {
    let value = handle.borrow();
    if value.shape() != expected {
        return Err(KfacError::shape_mismatch(what, expected, value.shape()));
    }
    Ok(())
}
