use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::KfacError;

/// Host-owned parameter tensor. Layers keep a clone of the handle and read
/// its shape; the host mutates the storage when it applies an update.
pub type SharedTensor = Rc<RefCell<ArrayD<f64>>>;

pub fn shared_tensor(value: ArrayD<f64>) -> SharedTensor {
    Rc::new(RefCell::new(value))
}

/// How a covariance accumulator weighs new samples against its history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AveragingPolicy {
    /// Plain mean over every sample seen so far.
    #[default]
    CountWeighted,
    /// Bias-corrected exponential moving average; `decay` multiplies the history.
    Exponential { decay: f64 },
}

impl AveragingPolicy {
    pub fn decay(&self) -> f64 {
        match self {
            AveragingPolicy::CountWeighted => 1.0,
            AveragingPolicy::Exponential { decay } => *decay,
        }
    }
}

/// Options recognized when a layer is registered or re-`setup`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LayerConfig {
    /// Mean-subtract activations and sensitivities before the Gram product.
    #[serde(default)]
    pub center: bool,
    #[serde(default)]
    pub averaging: AveragingPolicy,
}

impl LayerConfig {
    pub fn centered() -> Self {
        Self {
            center: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), KfacError> {
        let decay = self.averaging.decay();
        if !(decay > 0.0 && decay <= 1.0) {
            return Err(KfacError::InvalidConfig(format!(
                "averaging decay must lie in (0, 1], got {decay}"
            )));
        }
        Ok(())
    }
}

/// Border handling applied before convolution patches are windowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    #[default]
    Zeros,
    Reflect,
    Replicate,
    Circular,
}
