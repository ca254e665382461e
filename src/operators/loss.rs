use super::{expect_inputs, LayerBuilder};
use crate::builder::{GraphBuilder, Variable};
use crate::error::GraphError;
use crate::unimodel::{LayerDescriptor, OpType};

/// Softmax cross entropy between `(output, label)`
pub struct CrossEntropyWithSoftmaxBuilder;

impl LayerBuilder for CrossEntropyWithSoftmaxBuilder {
    fn op_type(&self) -> OpType {
        OpType::CrossEntropyWithSoftmax
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 2)?;
        builder.cross_entropy_with_softmax(&inputs[0], &inputs[1], Some(layer.op_name.as_str()))
    }
}

/// Top-N classification error between `(output, label)`
pub struct ClassificationErrorBuilder;

impl LayerBuilder for ClassificationErrorBuilder {
    fn op_type(&self) -> OpType {
        OpType::ClassificationError
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 2)?;
        let params = layer.classification_error_params()?;
        builder.classification_error(&inputs[0], &inputs[1], params.top_n, Some(layer.op_name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DataType;
    use crate::unimodel::{ClassificationErrorParams, LayerParameters};

    #[test]
    fn test_metric_is_scalar() {
        let mut builder = GraphBuilder::new();
        let z = builder.input("z", vec![10], DataType::Float32);
        let label = builder.input("label", vec![10], DataType::Float32);
        let layer = LayerDescriptor::new("err", OpType::ClassificationError, &["z", "label"])
            .with_parameters(LayerParameters::ClassificationError(
                ClassificationErrorParams { top_n: 5 },
            ));
        let err = ClassificationErrorBuilder
            .build(&mut builder, &layer, &[z.clone(), label.clone()])
            .unwrap();
        assert_eq!(err.shape(), &[1]);

        let ce_layer = LayerDescriptor::new("ce", OpType::CrossEntropyWithSoftmax, &["z", "label"]);
        let ce = CrossEntropyWithSoftmaxBuilder
            .build(&mut builder, &ce_layer, &[z, label])
            .unwrap();
        assert_eq!(ce.shape(), &[1]);
    }
}
