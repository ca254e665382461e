use tracing::debug;

use super::{expect_inputs, LayerBuilder};
use crate::builder::{GraphBuilder, ParameterInit, Variable};
use crate::error::GraphError;
use crate::graph::DataType;
use crate::unimodel::{ConvolutionParams, LayerDescriptor, OpType};
use crate::weights::{dilated_kernel_shape, expand_dilated_kernel, split_groups};

/// Grouped, dilated convolution with optional bias
pub struct ConvolutionBuilder;

impl LayerBuilder for ConvolutionBuilder {
    fn op_type(&self) -> OpType {
        OpType::Convolution
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 1)?;
        let x = &inputs[0];
        let params = layer.convolution_params()?;
        let op = layer.op_name.as_str();

        let rank = x.shape().len();
        if params.kernel.len() + 1 != rank {
            return Err(GraphError::invalid_parameters(
                op,
                format!(
                    "kernel {:?} does not match the spatial axes of input {:?}",
                    params.kernel,
                    x.shape()
                ),
            ));
        }
        if !params.dilation.is_empty() && params.dilation.len() != params.kernel.len() {
            return Err(GraphError::invalid_parameters(
                op,
                format!(
                    "{} dilation factors for a {}-d kernel",
                    params.dilation.len(),
                    params.kernel.len()
                ),
            ));
        }
        let group = params.group;
        if group == 0 {
            return Err(GraphError::invalid_parameters(op, "group must be at least 1"));
        }
        let input_channels = x.shape()[0];
        if input_channels % group != 0 || params.output % group != 0 {
            return Err(GraphError::invalid_parameters(
                op,
                format!(
                    "{} input and {} output channels cannot be split into {} groups",
                    input_channels, params.output, group
                ),
            ));
        }

        let mut kernel_shape = vec![params.output as usize, (input_channels / group) as usize];
        kernel_shape.extend(params.kernel.iter().map(|k| *k as usize));
        let pretrained = layer.pretrained();
        let kernel_data = pretrained.map(|tensors| tensors[0].data.as_slice());

        let strides = params.stride.clone();
        let mut auto_padding = vec![false];
        auto_padding.extend(std::iter::repeat(params.auto_pad).take(params.kernel.len()));

        let convolved = if group == 1 {
            let w = weight_parameter(builder, params, kernel_data, &kernel_shape, &format!("{}.W", op))?;
            let conv_name = if params.need_bias { None } else { Some(layer.op_name.as_str()) };
            builder.convolution(&w, x, &strides, &auto_padding, conv_name)?
        } else {
            let sub_input_channels = input_channels / group;
            let mut part_shape = kernel_shape.clone();
            part_shape[0] /= group as usize;
            let parts: Vec<Option<Vec<f32>>> = match kernel_data {
                Some(data) => split_groups(data, &kernel_shape, group as usize)
                    .map_err(|e| GraphError::invalid_parameters(op, e.to_string()))?
                    .into_iter()
                    .map(|(values, _)| Some(values))
                    .collect(),
                None => vec![None; group as usize],
            };

            let mut outputs = Vec::with_capacity(group as usize);
            for (i, part) in parts.iter().enumerate() {
                let w = weight_parameter(
                    builder,
                    params,
                    part.as_deref(),
                    &part_shape,
                    &format!("{}.{}.W", op, i),
                )?;
                let begin = i as u32 * sub_input_channels;
                let data = builder.slice(x, 0, begin, begin + sub_input_channels, None)?;
                outputs.push(builder.convolution(&w, &data, &strides, &auto_padding, None)?);
            }
            debug!(layer = op, group, "split convolution into groups");
            let splice_name = if params.need_bias { None } else { Some(layer.op_name.as_str()) };
            builder.splice(&outputs, 0, splice_name)?
        };

        if !params.need_bias {
            return Ok(convolved);
        }

        let mut bias_shape = vec![params.output];
        bias_shape.extend(std::iter::repeat(1).take(rank - 1));
        let bias_init = match pretrained {
            Some(tensors) => {
                let bias = tensors.get(1).ok_or_else(|| {
                    GraphError::invalid_parameters(op, "bias requested but no bias tensor was exported")
                })?;
                if bias.data.len() != params.output as usize {
                    return Err(GraphError::invalid_parameters(
                        op,
                        format!(
                            "bias holds {} values for {} outputs",
                            bias.data.len(),
                            params.output
                        ),
                    ));
                }
                ParameterInit::Values(bias.data.clone())
            }
            None => ParameterInit::Fill(0.0),
        };
        let b = builder.parameter(bias_shape, DataType::Float32, bias_init, &format!("{}.b", op))?;
        builder.plus(&convolved, &b, Some(layer.op_name.as_str()))
    }
}

/// Weight parameter of shape `(O, C, dilated kernel..)`.
fn weight_parameter(
    builder: &mut GraphBuilder,
    params: &ConvolutionParams,
    pretrained: Option<&[f32]>,
    shape: &[usize],
    param_name: &str,
) -> Result<Variable, GraphError> {
    let dilation = params.dilation_factors();
    let (init, dilated_shape) = match pretrained {
        Some(data) => {
            let expected: usize = shape.iter().product();
            if data.len() != expected {
                return Err(GraphError::invalid_parameters(
                    param_name,
                    format!("kernel holds {} values, expected shape {:?}", data.len(), shape),
                ));
            }
            let (values, dilated) = expand_dilated_kernel(data, shape, &dilation)?;
            (ParameterInit::Values(values), dilated)
        }
        None => (
            ParameterInit::GlorotUniform,
            dilated_kernel_shape(shape, &dilation)?,
        ),
    };
    let dims = dilated_shape.iter().map(|d| *d as u32).collect();
    builder.parameter(dims, DataType::Float32, init, param_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unimodel::LayerParameters;

    fn conv_layer(group: u32, need_bias: bool, dilation: Vec<u32>) -> LayerDescriptor {
        LayerDescriptor::new("conv", OpType::Convolution, &["data"]).with_parameters(
            LayerParameters::Convolution(ConvolutionParams {
                output: 8,
                kernel: vec![3, 3],
                stride: vec![1, 1],
                auto_pad: false,
                need_bias,
                group,
                dilation,
            }),
        )
    }

    #[test]
    fn test_grouped_matches_ungrouped_shape() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("data", vec![4, 9, 9], DataType::Float32);
        let plain = ConvolutionBuilder
            .build(&mut builder, &conv_layer(1, true, vec![]), &[x.clone()])
            .unwrap();
        let mut builder = GraphBuilder::new();
        let x = builder.input("data", vec![4, 9, 9], DataType::Float32);
        let grouped = ConvolutionBuilder
            .build(&mut builder, &conv_layer(2, true, vec![]), &[x])
            .unwrap();
        assert_eq!(plain.shape(), &[8, 7, 7]);
        assert_eq!(grouped.shape(), plain.shape());
        assert_eq!(grouped.name.as_deref(), Some("conv"));

        let graph = builder.combine(&[grouped], "outputs");
        assert!(graph.operand_id_by_name("conv.0.W").is_some());
        assert!(graph.operand_id_by_name("conv.1.W").is_some());
        assert_eq!(
            graph.operand(graph.operand_id_by_name("conv.b").unwrap()).unwrap().descriptor.shape,
            vec![8, 1, 1]
        );
    }

    #[test]
    fn test_dilation_widens_receptive_field() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("data", vec![1, 9, 9], DataType::Float32);
        let layer = conv_layer(1, false, vec![2, 2]).with_tensors(vec![vec![0.1; 8 * 9]]);
        let y = ConvolutionBuilder.build(&mut builder, &layer, &[x]).unwrap();
        assert_eq!(y.shape(), &[8, 5, 5]);
    }

    #[test]
    fn test_indivisible_group_rejected() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("data", vec![3, 9, 9], DataType::Float32);
        let err = ConvolutionBuilder.build(&mut builder, &conv_layer(2, false, vec![]), &[x]);
        assert!(matches!(err, Err(GraphError::InvalidParameters { .. })));
    }

    #[test]
    fn test_missing_bias_tensor_rejected() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("data", vec![1, 5, 5], DataType::Float32);
        let layer = conv_layer(1, true, vec![]).with_tensors(vec![vec![0.0; 72]]);
        let err = ConvolutionBuilder.build(&mut builder, &layer, &[x]);
        assert!(matches!(err, Err(GraphError::InvalidParameters { .. })));
    }

    #[test]
    fn test_zero_group_rejected() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("data", vec![4, 9, 9], DataType::Float32);
        let err = ConvolutionBuilder.build(&mut builder, &conv_layer(0, false, vec![]), &[x]);
        assert!(matches!(err, Err(GraphError::InvalidParameters { .. })));
    }

    #[test]
    fn test_dilation_must_match_kernel_rank() {
        for dilation in [vec![2], vec![2, 2, 2]] {
            let mut builder = GraphBuilder::new();
            let x = builder.input("data", vec![1, 9, 9], DataType::Float32);
            let layer = conv_layer(1, false, dilation).with_tensors(vec![vec![0.1; 8 * 9]]);
            let err = ConvolutionBuilder.build(&mut builder, &layer, &[x]);
            assert!(matches!(err, Err(GraphError::InvalidParameters { .. })));
        }
    }
}
