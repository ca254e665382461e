//! Parameterless layers mapping onto a single native operation

use super::{expect_inputs, LayerBuilder};
use crate::builder::{GraphBuilder, Variable};
use crate::error::GraphError;
use crate::unimodel::{LayerDescriptor, OpType};

pub struct PlusBuilder;

impl LayerBuilder for PlusBuilder {
    fn op_type(&self) -> OpType {
        OpType::Plus
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 2)?;
        builder.plus(&inputs[0], &inputs[1], Some(layer.op_name.as_str()))
    }
}

pub struct ReluBuilder;

impl LayerBuilder for ReluBuilder {
    fn op_type(&self) -> OpType {
        OpType::Relu
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 1)?;
        Ok(builder.relu(&inputs[0], Some(layer.op_name.as_str())))
    }
}

pub struct SoftmaxBuilder;

impl LayerBuilder for SoftmaxBuilder {
    fn op_type(&self) -> OpType {
        OpType::Softmax
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 1)?;
        Ok(builder.softmax(&inputs[0], Some(layer.op_name.as_str())))
    }
}

/// Identity at inference time
pub struct DropoutBuilder;

impl LayerBuilder for DropoutBuilder {
    fn op_type(&self) -> OpType {
        OpType::Dropout
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 1)?;
        Ok(builder.dropout(&inputs[0], Some(layer.op_name.as_str())))
    }
}

/// Channel concatenation
pub struct SpliceBuilder;

impl LayerBuilder for SpliceBuilder {
    fn op_type(&self) -> OpType {
        OpType::Splice
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        if inputs.is_empty() {
            return Err(GraphError::invalid_parameters(
                &layer.op_name,
                "splice takes at least one input",
            ));
        }
        builder.splice(inputs, 0, Some(layer.op_name.as_str()))
    }
}
