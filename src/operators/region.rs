use super::{expect_inputs, LayerBuilder};
use crate::builder::{GraphBuilder, Variable};
use crate::error::GraphError;
use crate::unimodel::{LayerDescriptor, OpType};

/// Position-sensitive region-of-interest pooling over `(conv_map, rois)`
pub struct PsroiPoolingBuilder;

impl LayerBuilder for PsroiPoolingBuilder {
    fn op_type(&self) -> OpType {
        OpType::PsroiPooling
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 2)?;
        let params = layer.psroi_pooling_params()?;
        builder.psroi_pooling(
            &inputs[0],
            &inputs[1],
            params.group_size,
            params.out_channel,
            Some(layer.op_name.as_str()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DataType;
    use crate::unimodel::{LayerParameters, PsroiPoolingParams};

    #[test]
    fn test_output_per_region() {
        let mut builder = GraphBuilder::new();
        let map = builder.input("map", vec![2 * 3 * 3, 12, 12], DataType::Float32);
        let rois = builder.input("rois", vec![5, 4], DataType::Float32);
        let layer = LayerDescriptor::new("psroi", OpType::PsroiPooling, &["map", "rois"])
            .with_parameters(LayerParameters::PsroiPooling(PsroiPoolingParams {
                group_size: 3,
                out_channel: 2,
            }));
        let y = PsroiPoolingBuilder
            .build(&mut builder, &layer, &[map, rois])
            .unwrap();
        assert_eq!(y.shape(), &[5, 2, 3, 3]);
    }
}
