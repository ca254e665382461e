use super::{expect_inputs, LayerBuilder};
use crate::builder::{GraphBuilder, PoolingKind, Variable};
use crate::error::GraphError;
use crate::unimodel::{LayerDescriptor, OpType, PoolingType};

/// Max or average pooling, output extent rounded up
pub struct PoolingBuilder;

impl LayerBuilder for PoolingBuilder {
    fn op_type(&self) -> OpType {
        OpType::Pooling
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 1)?;
        let params = layer.pooling_params()?;
        let kind = match params.pooling_type {
            PoolingType::Max => PoolingKind::Max,
            PoolingType::Average => PoolingKind::Average,
        };
        builder.pooling(
            &inputs[0],
            kind,
            &params.kernel,
            &params.stride,
            params.auto_pad,
            true,
            Some(layer.op_name.as_str()),
        )
    }
}
