use super::{expect_inputs, LayerBuilder};
use crate::builder::{GraphBuilder, ParameterInit, Variable};
use crate::error::GraphError;
use crate::graph::DataType;
use crate::unimodel::{LayerDescriptor, OpType};
use crate::weights::orient_dense_weights;

/// Fully connected layer: `times(x, sc) + b`
pub struct DenseBuilder;

impl LayerBuilder for DenseBuilder {
    fn op_type(&self) -> OpType {
        OpType::Dense
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 1)?;
        let x = &inputs[0];
        let params = layer.dense_params()?;
        let op = layer.op_name.as_str();

        let input_shape: Vec<usize> = x.shape().iter().map(|d| *d as usize).collect();
        let mut scale_shape = x.shape().to_vec();
        scale_shape.push(params.num_output);

        let (scale_init, bias_init) = match layer.pretrained() {
            Some(tensors) => {
                if tensors.len() != 2 {
                    return Err(GraphError::invalid_parameters(
                        op,
                        format!("dense layer takes two tensors (scale, bias), got {}", tensors.len()),
                    ));
                }
                let scale = orient_dense_weights(
                    &tensors[0].data,
                    &input_shape,
                    params.num_output as usize,
                    params.transpose,
                )
                .map_err(|e| GraphError::invalid_parameters(op, e.to_string()))?;
                if tensors[1].data.len() != params.num_output as usize {
                    return Err(GraphError::invalid_parameters(
                        op,
                        format!(
                            "bias holds {} values for {} outputs",
                            tensors[1].data.len(),
                            params.num_output
                        ),
                    ));
                }
                (
                    ParameterInit::Values(scale),
                    ParameterInit::Values(tensors[1].data.clone()),
                )
            }
            None => (ParameterInit::GlorotUniform, ParameterInit::Fill(0.0)),
        };

        let sc = builder.parameter(scale_shape, DataType::Float32, scale_init, &format!("{}.sc", op))?;
        let b = builder.parameter(
            vec![params.num_output],
            DataType::Float32,
            bias_init,
            &format!("{}.b", op),
        )?;
        let product = builder.times(x, &sc, None)?;
        builder.plus(&product, &b, Some(layer.op_name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unimodel::{DenseParams, LayerParameters};

    fn dense_layer(num_output: u32) -> LayerDescriptor {
        LayerDescriptor::new("fc", OpType::Dense, &["x"]).with_parameters(LayerParameters::Dense(
            DenseParams {
                num_output,
                transpose: true,
            },
        ))
    }

    #[test]
    fn test_scale_shape_keeps_input_axes() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x", vec![2, 3, 3], DataType::Float32);
        let y = DenseBuilder.build(&mut builder, &dense_layer(10), &[x]).unwrap();
        assert_eq!(y.shape(), &[10]);
        let graph = builder.combine(&[y], "outputs");
        let sc = graph.operand_id_by_name("fc.sc").unwrap();
        assert_eq!(graph.operand(sc).unwrap().descriptor.shape, vec![2, 3, 3, 10]);
    }

    #[test]
    fn test_requires_exactly_two_tensors() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x", vec![4], DataType::Float32);
        let layer = dense_layer(2).with_tensors(vec![vec![0.0; 8]]);
        let err = DenseBuilder.build(&mut builder, &layer, &[x]);
        assert!(matches!(err, Err(GraphError::InvalidParameters { .. })));
    }
}
