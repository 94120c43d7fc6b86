//! Receptive-field extraction for convolution layers (im2col generalized to
//! any number of spatial dimensions).
//!
//! Patches are laid out channel-major, then kernel offsets in row-major order,
//! which is exactly how a `(out, in, k_1, ..., k_n)` weight flattens to
//! `(out, in * prod(k))`. Output locations are enumerated row-major over the
//! output grid.

use crate::error::KfacError;
use crate::modules::ConvGeometry;
use crate::types::PaddingMode;
use ndarray::{Array3, ArrayD, ArrayViewD, Axis, CowArray, IxDyn, Slice};

/// Map a (possibly out-of-range) padded coordinate back onto the input axis.
/// `None` means the position reads a zero.
fn source_index(i: isize, size: usize, mode: PaddingMode) -> Option<usize> {
    let n = size as isize;
    if (0..n).contains(&i) {
        return Some(i as usize);
    }
    match mode {
        PaddingMode::Zeros => None,
        PaddingMode::Reflect => {
            let reflected = if i < 0 { -i } else { 2 * (n - 1) - i };
            Some(reflected as usize)
        }
        PaddingMode::Replicate => Some(i.clamp(0, n - 1) as usize),
        PaddingMode::Circular => Some(i.rem_euclid(n) as usize),
    }
}

/// Pad every spatial axis of a `(batch, channels, s_1, ..., s_n)` tensor by
/// `padding[d]` on both sides.
pub fn pad(
    x: ArrayViewD<'_, f64>,
    padding: &[usize],
    mode: PaddingMode,
) -> Result<ArrayD<f64>, KfacError> {
    let n = padding.len();
    let shape = x.shape();
    if x.ndim() != n + 2 {
        return Err(KfacError::shape_mismatch(
            "padded input rank",
            &[n + 2],
            &[x.ndim()],
        ));
    }
    for d in 0..n {
        let size = shape[2 + d];
        let p = padding[d];
        let fits = match mode {
            PaddingMode::Zeros => true,
            PaddingMode::Reflect => p < size,
            PaddingMode::Replicate => size > 0,
            PaddingMode::Circular => p <= size,
        };
        if p > 0 && !fits {
            return Err(KfacError::InvalidConfig(format!(
                "{mode:?} padding of {p} does not fit spatial dimension {d} of size {size}"
            )));
        }
    }

    if mode == PaddingMode::Zeros {
        let mut padded_shape = shape.to_vec();
        for d in 0..n {
            padded_shape[2 + d] += 2 * padding[d];
        }
        let mut padded = ArrayD::zeros(IxDyn(&padded_shape));
        padded
            .slice_each_axis_mut(|ax| {
                let d = ax.axis.index();
                if d < 2 {
                    Slice::from(..)
                } else {
                    let p = padding[d - 2] as isize;
                    Slice::new(p, Some(p + shape[d] as isize), 1)
                }
            })
            .assign(&x);
        return Ok(padded);
    }

    // Gather one axis at a time; every padded coordinate maps to an input one.
    let mut padded = x.to_owned();
    for d in 0..n {
        let size = shape[2 + d];
        let p = padding[d] as isize;
        let gather: Option<Vec<usize>> = (-p..size as isize + p)
            .map(|i| source_index(i, size, mode))
            .collect();
        let gather = gather.ok_or_else(|| {
            KfacError::InvalidConfig(format!("{mode:?} padding has no source for axis {d}"))
        })?;
        padded = padded.select(Axis(2 + d), &gather);
    }
    Ok(padded)
}

/// Number of window positions along each spatial axis.
pub fn output_spatial_shape(
    geometry: &ConvGeometry,
    input_spatial: &[usize],
) -> Result<Vec<usize>, KfacError> {
    let n = geometry.n_dim();
    if input_spatial.len() != n {
        return Err(KfacError::shape_mismatch(
            "convolution spatial rank",
            &[n],
            &[input_spatial.len()],
        ));
    }
    let mut out = Vec::with_capacity(n);
    for d in 0..n {
        let padded = input_spatial[d] + 2 * geometry.padding[d];
        let k = geometry.kernel_size[d];
        if padded < k {
            return Err(KfacError::shape_mismatch(
                format!("padded spatial dimension {d} (kernel does not fit)"),
                &[k],
                &[padded],
            ));
        }
        out.push((padded - k) / geometry.stride[d] + 1);
    }
    Ok(out)
}

/// Extract `(batch, locations, in_channels * prod(kernel_size))` patches from a
/// `(batch, in_channels, s_1, ..., s_n)` input.
pub fn extract_patches(
    x: ArrayViewD<'_, f64>,
    geometry: &ConvGeometry,
) -> Result<Array3<f64>, KfacError> {
    let n = geometry.n_dim();
    if x.ndim() != n + 2 {
        return Err(KfacError::shape_mismatch(
            "convolution input rank",
            &[n + 2],
            &[x.ndim()],
        ));
    }
    if x.shape()[1] != geometry.in_channels {
        return Err(KfacError::shape_mismatch(
            "convolution input channels",
            &[geometry.in_channels],
            &[x.shape()[1]],
        ));
    }

    let out_spatial = output_spatial_shape(geometry, &x.shape()[2..])?;
    let padded: CowArray<'_, f64, IxDyn> = if geometry.padding.iter().all(|&p| p == 0) {
        CowArray::from(x)
    } else {
        CowArray::from(pad(x, &geometry.padding, geometry.padding_mode)?)
    };

    let batch = padded.shape()[0];
    let n_locations: usize = out_spatial.iter().product();
    let mut patches = Array3::<f64>::zeros((batch, n_locations, geometry.patch_size()));

    // A window spans one example and every channel, so windows come out in
    // (batch, location) order and each one iterates channel-major.
    let mut window = vec![1, geometry.in_channels];
    window.extend_from_slice(&geometry.kernel_size);
    let mut step = vec![1, 1];
    step.extend_from_slice(&geometry.stride);
    let windows = padded.windows_with_stride(IxDyn(&window), IxDyn(&step));
    for (mut row, patch) in patches.rows_mut().into_iter().zip(windows) {
        row.iter_mut()
            .zip(patch.iter())
            .for_each(|(dst, &src)| *dst = src);
    }
    Ok(patches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, array};

    #[test]
    fn one_dimensional_patches_have_expected_shape() {
        let x = Array::from_shape_vec(IxDyn(&[2, 1, 5]), (0..10).map(f64::from).collect())
            .unwrap();
        let geometry = ConvGeometry::new(1, 4, vec![3]);
        let patches = extract_patches(x.view(), &geometry).unwrap();
        assert_eq!(patches.dim(), (2, 3, 3));
        assert_eq!(patches.slice(ndarray::s![0, 1, ..]).to_vec(), vec![1.0, 2.0, 3.0]);
        assert_eq!(patches.slice(ndarray::s![1, 2, ..]).to_vec(), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn features_are_channel_major() {
        // Two channels, length 3, kernel 2.
        let x = array![[[1.0, 2.0, 3.0], [10.0, 20.0, 30.0]]].into_dyn();
        let geometry = ConvGeometry::new(2, 1, vec![2]);
        let patches = extract_patches(x.view(), &geometry).unwrap();
        assert_eq!(patches.dim(), (1, 2, 4));
        assert_eq!(
            patches.slice(ndarray::s![0, 0, ..]).to_vec(),
            vec![1.0, 2.0, 10.0, 20.0]
        );
        assert_eq!(
            patches.slice(ndarray::s![0, 1, ..]).to_vec(),
            vec![2.0, 3.0, 20.0, 30.0]
        );
    }

    #[test]
    fn strided_two_dimensional_patches() {
        let x = Array::from_shape_vec(IxDyn(&[1, 1, 4, 4]), (0..16).map(f64::from).collect())
            .unwrap();
        let geometry = ConvGeometry::new(1, 1, vec![2, 2]).with_stride(vec![2, 2]);
        let patches = extract_patches(x.view(), &geometry).unwrap();
        assert_eq!(patches.dim(), (1, 4, 4));
        assert_eq!(
            patches.slice(ndarray::s![0, 0, ..]).to_vec(),
            vec![0.0, 1.0, 4.0, 5.0]
        );
        assert_eq!(
            patches.slice(ndarray::s![0, 3, ..]).to_vec(),
            vec![10.0, 11.0, 14.0, 15.0]
        );
    }

    #[test]
    fn three_dimensional_kernel_uses_the_same_routine() {
        let x = ArrayD::<f64>::ones(IxDyn(&[2, 3, 4, 5, 6]));
        let geometry = ConvGeometry::new(3, 2, vec![2, 3, 4]).with_padding(vec![1, 0, 2]);
        let patches = extract_patches(x.view(), &geometry).unwrap();
        // (4+2-2+1) * (5-3+1) * (6+4-4+1)
        assert_eq!(patches.dim(), (2, 5 * 3 * 7, 3 * 24));
    }

    #[test]
    fn padding_modes() {
        let x = array![[[1.0, 2.0, 3.0]]].into_dyn();
        let cases = [
            (PaddingMode::Zeros, vec![0.0, 0.0, 1.0, 2.0, 3.0, 0.0, 0.0]),
            (PaddingMode::Reflect, vec![3.0, 2.0, 1.0, 2.0, 3.0, 2.0, 1.0]),
            (PaddingMode::Replicate, vec![1.0, 1.0, 1.0, 2.0, 3.0, 3.0, 3.0]),
            (PaddingMode::Circular, vec![2.0, 3.0, 1.0, 2.0, 3.0, 1.0, 2.0]),
        ];
        for (mode, expected) in cases {
            let padded = pad(x.view(), &[2], mode).unwrap();
            assert_eq!(padded.shape(), &[1, 1, 7]);
            assert_eq!(padded.iter().copied().collect::<Vec<_>>(), expected, "{mode:?}");
        }
    }

    #[test]
    fn zero_padding_surrounds_patches() {
        let x = array![[[1.0, 2.0]]].into_dyn();
        let geometry = ConvGeometry::new(1, 1, vec![3]).with_padding(vec![1]);
        let patches = extract_patches(x.view(), &geometry).unwrap();
        assert_eq!(patches.dim(), (1, 2, 3));
        assert_eq!(
            patches.slice(ndarray::s![0, 0, ..]).to_vec(),
            vec![0.0, 1.0, 2.0]
        );
        assert_eq!(
            patches.slice(ndarray::s![0, 1, ..]).to_vec(),
            vec![1.0, 2.0, 0.0]
        );
    }

    #[test]
    fn stride_that_overshoots_the_end_drops_the_partial_window() {
        // Circular padding of 1 gives [5, 0, 1, 2, 3, 4, 5, 0]; with kernel 2
        // and stride 3 the fourth window would start past the end.
        let x = Array::from_shape_vec(IxDyn(&[1, 1, 6]), (0..6).map(f64::from).collect())
            .unwrap();
        let geometry = ConvGeometry::new(1, 1, vec![2])
            .with_stride(vec![3])
            .with_padding(vec![1])
            .with_padding_mode(PaddingMode::Circular);
        assert_eq!(output_spatial_shape(&geometry, &[6]).unwrap(), vec![3]);
        let patches = extract_patches(x.view(), &geometry).unwrap();
        assert_eq!(patches.dim(), (1, 3, 2));
        assert_eq!(
            patches.iter().copied().collect::<Vec<_>>(),
            vec![5.0, 0.0, 2.0, 3.0, 5.0, 0.0]
        );
    }

    #[test]
    fn rejects_oversized_kernel_and_bad_reflect_padding() {
        let x = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 2]));
        let geometry = ConvGeometry::new(1, 1, vec![3]);
        assert!(matches!(
            extract_patches(x.view(), &geometry),
            Err(KfacError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            pad(x.view(), &[2], PaddingMode::Reflect),
            Err(KfacError::InvalidConfig(_))
        ));
        let wrong_channels = ArrayD::<f64>::zeros(IxDyn(&[1, 2, 5]));
        assert!(extract_patches(wrong_channels.view(), &geometry).is_err());
    }
}
