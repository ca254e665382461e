use super::{expect_inputs, LayerBuilder};
use crate::builder::{GraphBuilder, ParameterInit, Variable};
use crate::error::GraphError;
use crate::graph::DataType;
use crate::unimodel::{LayerDescriptor, OpType};
use crate::weights::BatchNormStatistics;

/// Per-channel batch normalization with running statistics
pub struct BatchNormBuilder;

impl LayerBuilder for BatchNormBuilder {
    fn op_type(&self) -> OpType {
        OpType::BatchNormalization
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 1)?;
        let x = &inputs[0];
        let params = layer.batch_norm_params()?;
        let op = layer.op_name.as_str();

        let channels = x.shape().first().copied().ok_or_else(|| {
            GraphError::invalid_parameters(op, "batch normalization needs a channel axis")
        })?;
        let stats =
            BatchNormStatistics::from_tensors(op, &layer.pretrained_data(), channels as usize)?;

        let mut parameter = |suffix: &str, values: Vec<f32>| {
            builder.parameter(
                vec![channels],
                DataType::Float32,
                ParameterInit::Values(values),
                &format!("{}.{}", op, suffix),
            )
        };
        let scale = parameter("scale", stats.scale)?;
        let bias = parameter("bias", stats.bias)?;
        let mean = parameter("mean", stats.mean)?;
        let variance = parameter("var", stats.variance)?;

        builder.batch_normalization(
            x,
            &scale,
            &bias,
            &mean,
            &variance,
            true,
            params.epsilon,
            Some(layer.op_name.as_str()),
        )
    }
}
