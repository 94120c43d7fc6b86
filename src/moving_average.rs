use crate::error::KfacError;
use crate::types::AveragingPolicy;
use ndarray::{Array2, ArrayBase, Data, Ix2};

/// Running average of square covariance estimates.
///
/// Stores the decayed sum of samples and the matching decayed weight, so
/// `value()` is a proper (bias-corrected) average for both policies.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    sum: Array2<f64>,
    total_weight: f64,
    num_updates: usize,
    policy: AveragingPolicy,
}

impl MovingAverage {
    pub fn new(dim: usize, policy: AveragingPolicy) -> Self {
        Self {
            sum: Array2::zeros((dim, dim)),
            total_weight: 0.0,
            num_updates: 0,
            policy,
        }
    }

    pub fn dim(&self) -> usize {
        self.sum.nrows()
    }

    pub fn policy(&self) -> AveragingPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: AveragingPolicy) {
        self.policy = policy;
    }

    pub fn add_to_average<S: Data<Elem = f64>>(
        &mut self,
        sample: &ArrayBase<S, Ix2>,
    ) -> Result<(), KfacError> {
        if sample.dim() != self.sum.dim() {
            return Err(KfacError::shape_mismatch(
                "covariance sample",
                self.sum.shape(),
                sample.shape(),
            ));
        }
        let decay = self.policy.decay();
        if decay != 1.0 {
            self.sum.mapv_inplace(|v| v * decay);
            self.total_weight *= decay;
        }
        self.sum += sample;
        self.total_weight += 1.0;
        self.num_updates += 1;
        Ok(())
    }

    /// Current average; the zero matrix before any sample has been folded in.
    pub fn value(&self) -> Array2<f64> {
        if self.total_weight > 0.0 {
            &self.sum / self.total_weight
        } else {
            Array2::zeros(self.sum.raw_dim())
        }
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn num_updates(&self) -> usize {
        self.num_updates
    }

    pub fn reset(&mut self) {
        self.sum.fill(0.0);
        self.total_weight = 0.0;
        self.num_updates = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn count_weighted_average_is_the_mean() {
        let mut avg = MovingAverage::new(2, AveragingPolicy::CountWeighted);
        assert_eq!(avg.value(), Array2::<f64>::zeros((2, 2)));

        avg.add_to_average(&array![[1.0, 0.0], [0.0, 1.0]]).unwrap();
        avg.add_to_average(&array![[3.0, 2.0], [2.0, 5.0]]).unwrap();
        let value = avg.value();
        assert_abs_diff_eq!(value[[0, 0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(value[[0, 1]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(value[[1, 1]], 3.0, epsilon = 1e-12);
        assert_eq!(avg.num_updates(), 2);
        assert_abs_diff_eq!(avg.total_weight(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn exponential_average_is_bias_corrected() {
        let mut avg = MovingAverage::new(1, AveragingPolicy::Exponential { decay: 0.5 });
        avg.add_to_average(&array![[4.0]]).unwrap();
        // A single sample is returned as-is.
        assert_abs_diff_eq!(avg.value()[[0, 0]], 4.0, epsilon = 1e-12);

        avg.add_to_average(&array![[1.0]]).unwrap();
        // (0.5 * 4 + 1) / (0.5 + 1)
        assert_abs_diff_eq!(avg.value()[[0, 0]], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_wrong_sample_shape_and_resets() {
        let mut avg = MovingAverage::new(3, AveragingPolicy::default());
        let err = avg.add_to_average(&Array2::<f64>::eye(2)).unwrap_err();
        assert!(matches!(err, KfacError::ShapeMismatch { .. }));
        assert_eq!(avg.num_updates(), 0);

        avg.add_to_average(&Array2::<f64>::eye(3)).unwrap();
        avg.reset();
        assert_eq!(avg.num_updates(), 0);
        assert_eq!(avg.value(), Array2::<f64>::zeros((3, 3)));
        assert_eq!(avg.dim(), 3);
    }
}
