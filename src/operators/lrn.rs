use super::{expect_inputs, LayerBuilder};
use crate::builder::{GraphBuilder, Variable};
use crate::error::GraphError;
use crate::unimodel::{LayerDescriptor, OpType};

/// Local response normalization across channels
///
/// `x / exp(beta * log(k + conv(x^2)))`, where the convolution sums
/// `alpha / (2n - 1)` weighted squares over a window of `2n - 1` channels.
pub struct LrnBuilder;

impl LayerBuilder for LrnBuilder {
    fn op_type(&self) -> OpType {
        OpType::Lrn
    }

    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let inputs = expect_inputs(layer, inputs, 1)?;
        let x = &inputs[0];
        let params = layer.lrn_params()?;
        if params.kernel_size == 0 {
            return Err(GraphError::invalid_parameters(
                &layer.op_name,
                "kernel_size must be at least 1",
            ));
        }
        let window = 2 * params.kernel_size - 1;

        let x2 = builder.square(x, None);
        // fake singleton reduction axis in front of the channels
        let mut lifted = vec![1];
        lifted.extend_from_slice(x.shape());
        let x2s = builder.reshape(&x2, lifted, None)?;

        let mut kernel_shape = vec![1, 1, window];
        kernel_shape.extend(std::iter::repeat(1).take(x.shape().len() - 1));
        let weights = vec![params.alpha / window as f32; window as usize];
        let w_name = format!("{}.W", layer.op_name);
        let w = builder.constant(kernel_shape, &weights, Some(w_name.as_str()))?;

        let mut padding = vec![false];
        padding.extend(std::iter::repeat(true).take(x.shape().len()));
        let summed = builder.convolution(&w, &x2s, &[1], &padding, None)?;
        let b = builder.reshape(&summed, x.shape().to_vec(), None)?;

        let k = builder.scalar(params.k)?;
        let beta = builder.scalar(params.beta)?;
        let shifted = builder.plus(&k, &b, None)?;
        let logged = builder.log(&shifted, None);
        let scaled = builder.element_times(&beta, &logged, None)?;
        let den = builder.exp(&scaled, None);
        builder.element_divide(x, &den, Some(layer.op_name.as_str()))
    }
}
