//! Layer builders: one per abstract layer type
//!
//! A builder turns one [`LayerDescriptor`] plus its already resolved input
//! handles into native operations. Builders never see the symbol table.

use std::collections::HashMap;

use crate::builder::{GraphBuilder, Variable};
use crate::error::GraphError;
use crate::unimodel::{LayerDescriptor, OpType};

pub mod batch_norm;
pub mod convolution;
pub mod dense;
pub mod elementwise;
pub mod loss;
pub mod lrn;
pub mod pooling;
pub mod region;

pub use batch_norm::BatchNormBuilder;
pub use convolution::ConvolutionBuilder;
pub use dense::DenseBuilder;
pub use elementwise::{DropoutBuilder, PlusBuilder, ReluBuilder, SoftmaxBuilder, SpliceBuilder};
pub use loss::{ClassificationErrorBuilder, CrossEntropyWithSoftmaxBuilder};
pub use lrn::LrnBuilder;
pub use pooling::PoolingBuilder;
pub use region::PsroiPoolingBuilder;

pub trait LayerBuilder {
    /// Layer type handled by this builder
    fn op_type(&self) -> OpType;

    /// Emit the layer's operations and return its output handle
    fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError>;
}

/// Dispatch table from layer type to builder
pub struct BuilderRegistry {
    builders: HashMap<OpType, Box<dyn LayerBuilder>>,
}

impl BuilderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry with a builder for every known layer type
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(ConvolutionBuilder));
        registry.register(Box::new(BatchNormBuilder));
        registry.register(Box::new(PoolingBuilder));
        registry.register(Box::new(DenseBuilder));
        registry.register(Box::new(LrnBuilder));
        registry.register(Box::new(PlusBuilder));
        registry.register(Box::new(ReluBuilder));
        registry.register(Box::new(SoftmaxBuilder));
        registry.register(Box::new(DropoutBuilder));
        registry.register(Box::new(SpliceBuilder));
        registry.register(Box::new(PsroiPoolingBuilder));
        registry.register(Box::new(CrossEntropyWithSoftmaxBuilder));
        registry.register(Box::new(ClassificationErrorBuilder));
        registry
    }

    /// Register a builder, replacing any previous one for the same type
    pub fn register(&mut self, builder: Box<dyn LayerBuilder>) {
        self.builders.insert(builder.op_type(), builder);
    }

    pub fn get(&self, op_type: OpType) -> Option<&dyn LayerBuilder> {
        self.builders.get(&op_type).map(|b| b.as_ref())
    }

    pub fn op_types(&self) -> Vec<OpType> {
        self.builders.keys().copied().collect()
    }

    /// Validate the layer's parameters and dispatch it to its builder
    pub fn build(
        &self,
        builder: &mut GraphBuilder,
        layer: &LayerDescriptor,
        inputs: &[Variable],
    ) -> Result<Variable, GraphError> {
        let handler = self
            .get(layer.op_type)
            .ok_or_else(|| GraphError::UnsupportedOperator {
                op_type: layer.op_type.to_string(),
            })?;
        layer.validate()?;
        handler.build(builder, layer, inputs)
    }
}

impl Default for BuilderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Require exactly `count` inputs.
pub(crate) fn expect_inputs<'a>(
    layer: &LayerDescriptor,
    inputs: &'a [Variable],
    count: usize,
) -> Result<&'a [Variable], GraphError> {
    if inputs.len() != count {
        return Err(GraphError::invalid_parameters(
            &layer.op_name,
            format!(
                "{} takes {} input(s), got {}",
                layer.op_type,
                count,
                inputs.len()
            ),
        ));
    }
    Ok(inputs)
}
