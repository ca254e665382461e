//! Numeric transforms applied to pretrained tensors before they become parameters

use ndarray::{Array2, ArrayD, IxDyn, Slice};

use crate::error::GraphError;

/// Kernel shape after dilation: `(k - 1) * d + 1` on each dilated axis.
///
/// `dilation[i]` applies to axis `rank - dilation.len() + i`.
pub fn dilated_kernel_shape(shape: &[usize], dilation: &[usize]) -> Result<Vec<usize>, GraphError> {
    if dilation.len() > shape.len() {
        return Err(GraphError::shape(format!(
            "{} dilation factors for a kernel of rank {}",
            dilation.len(),
            shape.len()
        )));
    }
    if dilation.contains(&0) {
        return Err(GraphError::shape("dilation factors must be positive"));
    }
    let offset = shape.len() - dilation.len();
    Ok(shape
        .iter()
        .enumerate()
        .map(|(axis, k)| {
            if axis < offset || *k == 0 {
                *k
            } else {
                (k - 1) * dilation[axis - offset] + 1
            }
        })
        .collect())
}

/// Spread kernel taps `d` apart, filling the gaps with zeros.
///
/// Returns the expanded values in row-major order and their shape. All
/// factors equal to 1 return the kernel unchanged.
pub fn expand_dilated_kernel(
    data: &[f32],
    shape: &[usize],
    dilation: &[usize],
) -> Result<(Vec<f32>, Vec<usize>), GraphError> {
    let expanded_shape = dilated_kernel_shape(shape, dilation)?;
    if expanded_shape == shape {
        return Ok((data.to_vec(), shape.to_vec()));
    }

    let kernel = ArrayD::from_shape_vec(IxDyn(shape), data.to_vec())?;
    let mut expanded = ArrayD::<f32>::zeros(IxDyn(&expanded_shape));
    let offset = shape.len() - dilation.len();
    expanded
        .slice_each_axis_mut(|desc| {
            let axis = desc.axis.index();
            if axis < offset {
                Slice::from(..)
            } else {
                Slice::new(0, None, dilation[axis - offset] as isize)
            }
        })
        .assign(&kernel);

    Ok((expanded.iter().copied().collect(), expanded_shape))
}

/// Lay out flattened dense weights as `input_shape + (num_output,)`.
///
/// Pretrained weights arrive as `(num_output, flattened_input)`; with
/// `transpose` they are transposed into the `(flattened_input, num_output)`
/// order the tensor product expects, otherwise taken as-is.
pub fn orient_dense_weights(
    data: &[f32],
    input_shape: &[usize],
    num_output: usize,
    transpose: bool,
) -> Result<Vec<f32>, GraphError> {
    let flattened: usize = input_shape.iter().product();
    if data.len() != flattened * num_output {
        return Err(GraphError::shape(format!(
            "dense weights hold {} values, expected {} x {}",
            data.len(),
            num_output,
            flattened
        )));
    }
    if !transpose {
        return Ok(data.to_vec());
    }
    let matrix = Array2::from_shape_vec((num_output, flattened), data.to_vec())?;
    Ok(matrix.reversed_axes().iter().copied().collect())
}

/// Reciprocal of the stored moving-average scale, 0 for an unset scale.
pub fn inverse_global_scale(global_scale: f32) -> f32 {
    if global_scale != 0.0 {
        1.0 / global_scale
    } else {
        0.0
    }
}

/// Per-channel values for the four batch normalization parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormStatistics {
    pub scale: Vec<f32>,
    pub bias: Vec<f32>,
    pub mean: Vec<f32>,
    pub variance: Vec<f32>,
}

impl BatchNormStatistics {
    /// Defaults used when no statistics were exported.
    pub fn untrained(channels: usize) -> Self {
        Self {
            scale: vec![1.0; channels],
            bias: vec![0.0; channels],
            mean: vec![1.0; channels],
            variance: vec![0.0; channels],
        }
    }

    /// Build from pretrained tensors `[mean, variance, global_scale, (scale, bias)]`.
    ///
    /// Mean and variance are divided by the global scale. The affine
    /// scale and bias come from tensors 3 and 4 when all five are present.
    pub fn from_tensors(
        layer: &str,
        tensors: &[Vec<f32>],
        channels: usize,
    ) -> Result<Self, GraphError> {
        if tensors.is_empty() {
            return Ok(Self::untrained(channels));
        }
        if tensors.len() < 3 {
            return Err(GraphError::invalid_parameters(
                layer,
                "at least three tensors (saved mean, saved variance and scale) are needed",
            ));
        }

        let global_scale = tensors[2].first().copied().ok_or_else(|| {
            GraphError::invalid_parameters(layer, "global scale tensor is empty")
        })?;
        let inv_scale = inverse_global_scale(global_scale);

        let mean = per_channel(layer, "mean", &tensors[0], channels)?
            .into_iter()
            .map(|v| v * inv_scale)
            .collect();
        let variance = per_channel(layer, "variance", &tensors[1], channels)?
            .into_iter()
            .map(|v| v * inv_scale)
            .collect();

        let (scale, bias) = if tensors.len() == 5 {
            (
                per_channel(layer, "scale", &tensors[3], channels)?,
                per_channel(layer, "bias", &tensors[4], channels)?,
            )
        } else {
            (vec![1.0; channels], vec![0.0; channels])
        };

        Ok(Self {
            scale,
            bias,
            mean,
            variance,
        })
    }
}

fn per_channel(
    layer: &str,
    what: &str,
    values: &[f32],
    channels: usize,
) -> Result<Vec<f32>, GraphError> {
    if values.len() != channels {
        return Err(GraphError::invalid_parameters(
            layer,
            format!("{} holds {} values for {} channels", what, values.len(), channels),
        ));
    }
    Ok(values.to_vec())
}

/// Split a row-major tensor evenly along its first axis.
pub fn split_groups(
    data: &[f32],
    shape: &[usize],
    groups: usize,
) -> Result<Vec<(Vec<f32>, Vec<usize>)>, GraphError> {
    let leading = shape.first().copied().unwrap_or(0);
    if groups == 0 || leading % groups != 0 {
        return Err(GraphError::shape(format!(
            "cannot split {} output channels into {} groups",
            leading, groups
        )));
    }
    let total: usize = shape.iter().product();
    if data.len() != total {
        return Err(GraphError::shape(format!(
            "kernel of shape {:?} holds {} values",
            shape,
            data.len()
        )));
    }

    let mut part_shape = shape.to_vec();
    part_shape[0] = leading / groups;
    let part_len = total / groups;
    Ok(data
        .chunks(part_len.max(1))
        .take(groups)
        .map(|chunk| (chunk.to_vec(), part_shape.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_dilation_is_identity() {
        let data: Vec<f32> = (0..18).map(|v| v as f32).collect();
        let (out, shape) = expand_dilated_kernel(&data, &[2, 1, 3, 3], &[1, 1]).unwrap();
        assert_eq!(shape, vec![2, 1, 3, 3]);
        assert_eq!(out, data);
    }

    #[test]
    fn test_dilation_inserts_zero_gaps() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let (out, shape) = expand_dilated_kernel(&data, &[1, 2, 2], &[2, 2]).unwrap();
        assert_eq!(shape, vec![1, 3, 3]);
        assert_eq!(out, vec![1.0, 0.0, 2.0, 0.0, 0.0, 0.0, 3.0, 0.0, 4.0]);
    }

    #[test]
    fn test_dilation_per_axis() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let (out, shape) = expand_dilated_kernel(&data, &[2, 2], &[1, 3]).unwrap();
        assert_eq!(shape, vec![2, 4]);
        assert_eq!(out, vec![1.0, 0.0, 0.0, 2.0, 3.0, 0.0, 0.0, 4.0]);
    }

    #[test]
    fn test_dense_transpose_round_trip() {
        let data: Vec<f32> = (0..12).map(|v| v as f32 * 0.5).collect();
        let oriented = orient_dense_weights(&data, &[4], 3, true).unwrap();
        assert_eq!(oriented[1], data[4]);
        let restored = orient_dense_weights(&oriented, &[3], 4, true).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_dense_count_mismatch() {
        assert!(orient_dense_weights(&[0.0; 5], &[2, 2], 1, false).is_err());
    }

    #[test]
    fn test_zero_global_scale() {
        assert_eq!(inverse_global_scale(0.0), 0.0);
        assert_eq!(inverse_global_scale(4.0), 0.25);
    }

    #[test]
    fn test_batch_norm_three_tensors() {
        let stats = BatchNormStatistics::from_tensors(
            "bn",
            &[vec![2.0, 4.0], vec![8.0, 6.0], vec![2.0]],
            2,
        )
        .unwrap();
        assert_eq!(stats.mean, vec![1.0, 2.0]);
        assert_eq!(stats.variance, vec![4.0, 3.0]);
        assert_eq!(stats.scale, vec![1.0, 1.0]);
        assert_eq!(stats.bias, vec![0.0, 0.0]);
    }

    #[test]
    fn test_batch_norm_five_tensors_keep_affine() {
        let stats = BatchNormStatistics::from_tensors(
            "bn",
            &[
                vec![2.0],
                vec![8.0],
                vec![0.0],
                vec![0.5],
                vec![-1.0],
            ],
            1,
        )
        .unwrap();
        assert_eq!(stats.mean, vec![0.0]);
        assert_eq!(stats.variance, vec![0.0]);
        assert_eq!(stats.scale, vec![0.5]);
        assert_eq!(stats.bias, vec![-1.0]);
    }

    #[test]
    fn test_batch_norm_two_tensors_rejected() {
        let err = BatchNormStatistics::from_tensors("bn", &[vec![1.0], vec![1.0]], 1);
        assert!(matches!(err, Err(GraphError::InvalidParameters { .. })));
    }

    #[test]
    fn test_batch_norm_without_tensors() {
        let stats = BatchNormStatistics::from_tensors("bn", &[], 3).unwrap();
        assert_eq!(stats, BatchNormStatistics::untrained(3));
    }

    #[test]
    fn test_split_groups() {
        let data: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let parts = split_groups(&data, &[4, 2], 2).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], (vec![4.0, 5.0, 6.0, 7.0], vec![2, 2]));
        assert!(split_groups(&data, &[4, 2], 3).is_err());
    }
}
