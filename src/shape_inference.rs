/// Shape inference and validation for native operations
use crate::error::GraphError;

/// Compute the broadcasted shape for two operands following NumPy broadcasting rules
///
/// Broadcasting rules:
/// 1. If arrays have different ranks, prepend 1s to the smaller rank
/// 2. Two dimensions are compatible if they are equal or one of them is 1
/// 3. Output shape is the maximum of each dimension
pub fn broadcast_shapes(shape_a: &[u32], shape_b: &[u32]) -> Result<Vec<u32>, GraphError> {
    let max_rank = shape_a.len().max(shape_b.len());
    let mut result = Vec::with_capacity(max_rank);

    // Iterate from right to left (least significant dimension first)
    for i in 0..max_rank {
        let dim_a = if i < shape_a.len() {
            shape_a[shape_a.len() - 1 - i]
        } else {
            1
        };

        let dim_b = if i < shape_b.len() {
            shape_b[shape_b.len() - 1 - i]
        } else {
            1
        };

        if dim_a == dim_b || dim_a == 1 || dim_b == 1 {
            result.push(dim_a.max(dim_b));
        } else {
            return Err(GraphError::ShapeInferenceFailed {
                reason: format!(
                    "Incompatible shapes for broadcasting: {:?} and {:?} (dimension {} incompatible: {} vs {})",
                    shape_a, shape_b, i, dim_a, dim_b
                ),
            });
        }
    }

    // Reverse to get back to original order
    result.reverse();
    Ok(result)
}

/// Infer output shape for a tensor product (`times`)
///
/// The weight shape must start with the full input shape; the remaining
/// trailing axes form the output: `x: S_in`, `w: S_in + S_out` -> `S_out`.
pub fn infer_times_shape(input: &[u32], weights: &[u32]) -> Result<Vec<u32>, GraphError> {
    if weights.len() <= input.len() || weights[..input.len()] != *input {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!(
                "Times requires weights shaped input + output, got input {:?} and weights {:?}",
                input, weights
            ),
        });
    }
    Ok(weights[input.len()..].to_vec())
}

/// Output extent of one sliding-window axis.
///
/// With `pad` the window is centered and the extent is `ceil(in / stride)`.
/// Otherwise only full windows count, rounded down (convolution) or up
/// (pooling in ceiling mode).
pub fn window_output_extent(
    input: u32,
    kernel: u32,
    stride: u32,
    pad: bool,
    ceil_mode: bool,
) -> Result<u32, GraphError> {
    if stride == 0 {
        return Err(GraphError::ShapeInferenceFailed {
            reason: "stride must be positive".to_string(),
        });
    }
    if pad {
        return Ok(input.div_ceil(stride));
    }
    if kernel > input {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!("kernel extent {} exceeds input extent {}", kernel, input),
        });
    }
    let span = input - kernel;
    let steps = if ceil_mode {
        span.div_ceil(stride)
    } else {
        span / stride
    };
    Ok(steps + 1)
}

/// Padding placed before the first window position for a centered window.
pub fn leading_padding(input: u32, kernel: u32, stride: u32, pad: bool) -> u32 {
    if !pad {
        return 0;
    }
    let out = input.div_ceil(stride.max(1));
    let needed = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(input);
    needed / 2
}

/// Infer output shape of a convolution.
///
/// `weights` is `(O, K_0, .., K_{r-1})` over data `(D_0, .., D_{r-1})`; the
/// kernel must cover the whole leading (channel) axis, which is replaced by
/// the `O` output maps.
pub fn infer_convolution_shape(
    data: &[u32],
    weights: &[u32],
    strides: &[u32],
    auto_padding: &[bool],
) -> Result<Vec<u32>, GraphError> {
    if data.is_empty() || weights.len() != data.len() + 1 {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!(
                "Convolution weights {:?} must have rank {} for data {:?}",
                weights,
                data.len() + 1,
                data
            ),
        });
    }
    if weights[1] != data[0] {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!(
                "Convolution kernel depth {} does not match input channels {}",
                weights[1], data[0]
            ),
        });
    }

    let mut out = Vec::with_capacity(data.len());
    out.push(weights[0]);
    for axis in 1..data.len() {
        let stride = strides.get(axis).copied().unwrap_or(1);
        let pad = auto_padding.get(axis).copied().unwrap_or(false);
        out.push(window_output_extent(
            data[axis],
            weights[axis + 1],
            stride,
            pad,
            false,
        )?);
    }
    Ok(out)
}

/// Infer output shape of pooling over the trailing spatial axes of `(C, ..)`.
pub fn infer_pooling_shape(
    data: &[u32],
    kernel: &[u32],
    strides: &[u32],
    auto_padding: bool,
    ceil_mode: bool,
) -> Result<Vec<u32>, GraphError> {
    if kernel.len() >= data.len() || kernel.is_empty() {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!(
                "Pooling kernel {:?} must cover the spatial axes of {:?}",
                kernel, data
            ),
        });
    }
    let leading = data.len() - kernel.len();
    let mut out = data[..leading].to_vec();
    for (i, k) in kernel.iter().enumerate() {
        let stride = strides.get(i).copied().unwrap_or(1);
        out.push(window_output_extent(
            data[leading + i],
            *k,
            stride,
            auto_padding,
            ceil_mode,
        )?);
    }
    Ok(out)
}

/// Infer output shape of concatenation along `axis`
pub fn infer_splice_shape(shapes: &[&[u32]], axis: usize) -> Result<Vec<u32>, GraphError> {
    let first = shapes.first().ok_or_else(|| GraphError::ShapeInferenceFailed {
        reason: "Splice requires at least one input".to_string(),
    })?;
    if axis >= first.len() {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!("Splice axis {} out of range for {:?}", axis, first),
        });
    }
    let mut out = first.to_vec();
    for shape in &shapes[1..] {
        if shape.len() != first.len()
            || shape
                .iter()
                .zip(first.iter())
                .enumerate()
                .any(|(i, (a, b))| i != axis && a != b)
        {
            return Err(GraphError::ShapeInferenceFailed {
                reason: format!(
                    "Splice inputs {:?} and {:?} differ outside axis {}",
                    first, shape, axis
                ),
            });
        }
        out[axis] += shape[axis];
    }
    Ok(out)
}

/// Validate that a reshape operation is valid
pub fn validate_reshape(input_shape: &[u32], output_shape: &[u32]) -> Result<(), GraphError> {
    let input_size: u32 = input_shape.iter().product();
    let output_size: u32 = output_shape.iter().product();

    if input_size != output_size {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!(
                "Reshape requires same number of elements: input {:?} ({} elements) != output {:?} ({} elements)",
                input_shape, input_size, output_shape, output_size
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_same_shape() {
        assert_eq!(broadcast_shapes(&[2, 3], &[2, 3]).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_broadcast_channel_bias() {
        assert_eq!(
            broadcast_shapes(&[8, 5, 5], &[8, 1, 1]).unwrap(),
            vec![8, 5, 5]
        );
    }

    #[test]
    fn test_broadcast_different_ranks() {
        assert_eq!(
            broadcast_shapes(&[2, 3, 4], &[3, 4]).unwrap(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn test_broadcast_incompatible() {
        assert!(broadcast_shapes(&[2, 3], &[2, 4]).is_err());
    }

    #[test]
    fn test_times_shape() {
        assert_eq!(
            infer_times_shape(&[8, 3, 3], &[8, 3, 3, 10]).unwrap(),
            vec![10]
        );
        assert!(infer_times_shape(&[8, 3, 3], &[72, 10]).is_err());
    }

    #[test]
    fn test_window_extent_floor_and_ceil() {
        assert_eq!(window_output_extent(6, 3, 2, false, false).unwrap(), 2);
        assert_eq!(window_output_extent(6, 3, 2, false, true).unwrap(), 3);
        assert_eq!(window_output_extent(6, 3, 2, true, false).unwrap(), 3);
        assert!(window_output_extent(2, 3, 1, false, false).is_err());
    }

    #[test]
    fn test_leading_padding_centers_odd_kernel() {
        assert_eq!(leading_padding(5, 3, 1, true), 1);
        assert_eq!(leading_padding(5, 5, 1, true), 2);
        assert_eq!(leading_padding(5, 3, 1, false), 0);
    }

    #[test]
    fn test_convolution_shape() {
        assert_eq!(
            infer_convolution_shape(&[3, 5, 5], &[8, 3, 3, 3], &[3, 1, 1], &[false, false, false])
                .unwrap(),
            vec![8, 3, 3]
        );
        assert_eq!(
            infer_convolution_shape(&[3, 5, 5], &[8, 3, 3, 3], &[3, 1, 1], &[false, true, true])
                .unwrap(),
            vec![8, 5, 5]
        );
        assert!(infer_convolution_shape(&[4, 5, 5], &[8, 3, 3, 3], &[], &[]).is_err());
    }

    #[test]
    fn test_pooling_shape_rounds_up() {
        assert_eq!(
            infer_pooling_shape(&[16, 7, 7], &[2, 2], &[2, 2], false, true).unwrap(),
            vec![16, 4, 4]
        );
    }

    #[test]
    fn test_splice_shape() {
        assert_eq!(
            infer_splice_shape(&[&[2, 4, 4], &[3, 4, 4]], 0).unwrap(),
            vec![5, 4, 4]
        );
        assert!(infer_splice_shape(&[&[2, 4, 4], &[3, 4, 5]], 0).is_err());
    }

    #[test]
    fn test_validate_reshape() {
        assert!(validate_reshape(&[2, 3], &[6]).is_ok());
        assert!(validate_reshape(&[2, 3], &[5]).is_err());
    }
}
