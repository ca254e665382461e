//! Construction API of the native runtime
//!
//! Every call appends operands and operations to the graph under
//! construction, infers the result shape eagerly and hands back a
//! [`Variable`] that later calls consume.

use std::collections::HashMap;

use serde_json::json;

use crate::error::GraphError;
use crate::graph::{
    ConstantData, DataType, GraphInfo, Initializer, Operand, OperandDescriptor, OperandKind,
    Operation,
};
use crate::shape_inference::{
    broadcast_shapes, infer_convolution_shape, infer_pooling_shape, infer_splice_shape,
    infer_times_shape, validate_reshape,
};

/// Handle to an operand of the graph under construction
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub id: u32,
    pub descriptor: OperandDescriptor,
    pub name: Option<String>,
}

impl Variable {
    pub fn shape(&self) -> &[u32] {
        &self.descriptor.shape
    }

    /// Product of all dimensions.
    pub fn feature_count(&self) -> usize {
        self.descriptor.element_count().unwrap_or(0)
    }
}

/// Initial value of a learnable parameter
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterInit {
    Values(Vec<f32>),
    Fill(f32),
    GlorotUniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolingKind {
    Max,
    Average,
}

impl PoolingKind {
    fn op_type(self) -> &'static str {
        match self {
            PoolingKind::Max => "maxPool",
            PoolingKind::Average => "averagePool",
        }
    }
}

const GLOROT_BASE_SEED: u64 = 0x5eed;

/// Builder for native computation graphs
pub struct GraphBuilder {
    operands: Vec<Operand>,
    operations: Vec<Operation>,
    input_operands: Vec<u32>,
    constant_data_map: HashMap<u32, ConstantData>,
    initializers: HashMap<u32, Initializer>,
    next_seed: u64,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            operands: Vec::new(),
            operations: Vec::new(),
            input_operands: Vec::new(),
            constant_data_map: HashMap::new(),
            initializers: HashMap::new(),
            next_seed: GLOROT_BASE_SEED,
        }
    }

    /// Reopen a finalized graph to append more operations.
    ///
    /// Former outputs become intermediates; `combine` picks the new outputs.
    pub fn from_graph(graph: GraphInfo) -> Self {
        let mut operands = graph.operands;
        for id in &graph.output_operands {
            if let Some(op) = operands.get_mut(*id as usize) {
                if op.kind == OperandKind::Output {
                    op.kind = OperandKind::Intermediate;
                }
            }
        }
        let next_seed = GLOROT_BASE_SEED + graph.initializers.len() as u64;
        Self {
            operands,
            operations: graph.operations,
            input_operands: graph.input_operands,
            constant_data_map: graph.constant_operand_ids_to_handles,
            initializers: graph.initializers,
            next_seed,
        }
    }

    /// Handle for an operand that already exists in the graph.
    pub fn variable(&self, id: u32) -> Result<Variable, GraphError> {
        let operand = self
            .operands
            .get(id as usize)
            .ok_or(GraphError::InvalidOperand { operand: id })?;
        Ok(Variable {
            id,
            descriptor: operand.descriptor.clone(),
            name: operand.name.clone(),
        })
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    fn push_operand(
        &mut self,
        kind: OperandKind,
        descriptor: OperandDescriptor,
        name: Option<&str>,
    ) -> Variable {
        let id = self.operands.len() as u32;
        self.operands.push(Operand {
            kind,
            descriptor: descriptor.clone(),
            name: name.map(str::to_string),
        });
        Variable {
            id,
            descriptor,
            name: name.map(str::to_string),
        }
    }

    fn push_operation(
        &mut self,
        op_type: &str,
        inputs: &[&Variable],
        descriptor: OperandDescriptor,
        attributes: serde_json::Value,
        name: Option<&str>,
    ) -> Variable {
        let output = self.push_operand(OperandKind::Intermediate, descriptor, name);
        self.operations.push(Operation {
            op_type: op_type.to_string(),
            input_operands: inputs.iter().map(|v| v.id).collect(),
            output_operand: output.id,
            attributes,
            label: name.map(str::to_string),
        });
        output
    }

    /// Create a named input placeholder
    pub fn input(&mut self, name: &str, shape: Vec<u32>, data_type: DataType) -> Variable {
        let input = self.push_operand(
            OperandKind::Input,
            OperandDescriptor::new(data_type, shape),
            Some(name),
        );
        self.input_operands.push(input.id);
        input
    }

    /// Create a learnable parameter
    pub fn parameter(
        &mut self,
        shape: Vec<u32>,
        data_type: DataType,
        init: ParameterInit,
        name: &str,
    ) -> Result<Variable, GraphError> {
        let descriptor = OperandDescriptor::new(data_type, shape);
        let expected = descriptor.element_count().unwrap_or(0);
        if let ParameterInit::Values(values) = &init {
            if values.len() != expected {
                return Err(GraphError::shape(format!(
                    "parameter `{}` of shape {:?} needs {} values, got {}",
                    name,
                    descriptor.shape,
                    expected,
                    values.len()
                )));
            }
        }

        let parameter = self.push_operand(OperandKind::Parameter, descriptor, Some(name));
        match init {
            ParameterInit::Values(values) => {
                self.constant_data_map.insert(
                    parameter.id,
                    ConstantData {
                        data: data_type.encode(&values),
                        label: Some(name.to_string()),
                    },
                );
            }
            ParameterInit::Fill(value) => {
                self.initializers
                    .insert(parameter.id, Initializer::Fill { value });
            }
            ParameterInit::GlorotUniform => {
                let seed = self.next_seed;
                self.next_seed += 1;
                self.initializers
                    .insert(parameter.id, Initializer::GlorotUniform { seed });
            }
        }
        Ok(parameter)
    }

    /// Create a constant tensor
    pub fn constant(
        &mut self,
        shape: Vec<u32>,
        values: &[f32],
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        let descriptor = OperandDescriptor::float32(shape);
        if descriptor.element_count() != Some(values.len()) {
            return Err(GraphError::shape(format!(
                "constant of shape {:?} cannot hold {} values",
                descriptor.shape,
                values.len()
            )));
        }
        let constant = self.push_operand(OperandKind::Constant, descriptor, name);
        self.constant_data_map.insert(
            constant.id,
            ConstantData {
                data: DataType::Float32.encode(values),
                label: name.map(str::to_string),
            },
        );
        Ok(constant)
    }

    /// Scalar constant broadcast against any operand
    pub fn scalar(&mut self, value: f32) -> Result<Variable, GraphError> {
        self.constant(Vec::new(), &[value], None)
    }

    /// N-d convolution; `weights` is `(O, kernel..)` over `data`
    pub fn convolution(
        &mut self,
        weights: &Variable,
        data: &Variable,
        strides: &[u32],
        auto_padding: &[bool],
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        let rank = data.shape().len();
        let strides = broadcast_axes(strides, rank, 1, data.shape().first().copied());
        let auto_padding = broadcast_axes(auto_padding, rank, false, None);
        let shape = infer_convolution_shape(data.shape(), weights.shape(), &strides, &auto_padding)?;
        Ok(self.push_operation(
            "convolution",
            &[data, weights],
            data.descriptor.with_shape(shape),
            json!({ "strides": strides, "autoPadding": auto_padding }),
            name,
        ))
    }

    /// Pooling over the trailing spatial axes of `(C, ..)`
    pub fn pooling(
        &mut self,
        x: &Variable,
        kind: PoolingKind,
        kernel: &[u32],
        strides: &[u32],
        auto_padding: bool,
        ceil_out_dim: bool,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        let strides = broadcast_axes(strides, kernel.len(), 1, None);
        let shape = infer_pooling_shape(x.shape(), kernel, &strides, auto_padding, ceil_out_dim)?;
        Ok(self.push_operation(
            kind.op_type(),
            &[x],
            x.descriptor.with_shape(shape),
            json!({
                "windowDimensions": kernel,
                "strides": strides,
                "autoPadding": auto_padding,
                "ceilOutDim": ceil_out_dim,
            }),
            name,
        ))
    }

    /// Batch normalization over the leading (channel) axis using running statistics
    #[allow(clippy::too_many_arguments)]
    pub fn batch_normalization(
        &mut self,
        x: &Variable,
        scale: &Variable,
        bias: &Variable,
        mean: &Variable,
        variance: &Variable,
        spatial: bool,
        epsilon: f32,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        let channels = x.shape().first().copied().unwrap_or(1);
        for param in [scale, bias, mean, variance] {
            if param.shape() != [channels] {
                return Err(GraphError::shape(format!(
                    "batch normalization statistics must be shaped [{}], got {:?}",
                    channels,
                    param.shape()
                )));
            }
        }
        Ok(self.push_operation(
            "batchNormalization",
            &[x, scale, bias, mean, variance],
            x.descriptor.clone(),
            json!({ "spatial": spatial, "epsilon": epsilon, "useRunningStatistics": true }),
            name,
        ))
    }

    /// Tensor product reducing over all axes of `x`
    pub fn times(
        &mut self,
        x: &Variable,
        weights: &Variable,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        let shape = infer_times_shape(x.shape(), weights.shape())?;
        Ok(self.push_operation(
            "times",
            &[x, weights],
            x.descriptor.with_shape(shape),
            json!({}),
            name,
        ))
    }

    pub fn plus(
        &mut self,
        a: &Variable,
        b: &Variable,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        self.broadcast_op("add", a, b, name)
    }

    pub fn element_times(
        &mut self,
        a: &Variable,
        b: &Variable,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        self.broadcast_op("mul", a, b, name)
    }

    pub fn element_divide(
        &mut self,
        a: &Variable,
        b: &Variable,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        self.broadcast_op("div", a, b, name)
    }

    pub fn relu(&mut self, x: &Variable, name: Option<&str>) -> Variable {
        self.unary_op("relu", x, name)
    }

    /// Softmax over all elements of the operand
    pub fn softmax(&mut self, x: &Variable, name: Option<&str>) -> Variable {
        self.unary_op("softmax", x, name)
    }

    /// Dropout is the identity outside training
    pub fn dropout(&mut self, x: &Variable, name: Option<&str>) -> Variable {
        self.unary_op("dropout", x, name)
    }

    pub fn square(&mut self, x: &Variable, name: Option<&str>) -> Variable {
        self.unary_op("square", x, name)
    }

    pub fn exp(&mut self, x: &Variable, name: Option<&str>) -> Variable {
        self.unary_op("exp", x, name)
    }

    pub fn log(&mut self, x: &Variable, name: Option<&str>) -> Variable {
        self.unary_op("log", x, name)
    }

    /// Concatenate along `axis`
    pub fn splice(
        &mut self,
        inputs: &[Variable],
        axis: usize,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        let shapes: Vec<&[u32]> = inputs.iter().map(|v| v.shape()).collect();
        let shape = infer_splice_shape(&shapes, axis)?;
        let refs: Vec<&Variable> = inputs.iter().collect();
        Ok(self.push_operation(
            "splice",
            &refs,
            inputs[0].descriptor.with_shape(shape),
            json!({ "axis": axis }),
            name,
        ))
    }

    /// Take `[begin, end)` along `axis`
    pub fn slice(
        &mut self,
        x: &Variable,
        axis: usize,
        begin: u32,
        end: u32,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        let extent = x.shape().get(axis).copied().ok_or_else(|| {
            GraphError::shape(format!("slice axis {} out of range for {:?}", axis, x.shape()))
        })?;
        if begin >= end || end > extent {
            return Err(GraphError::shape(format!(
                "slice [{}, {}) out of range for axis {} of extent {}",
                begin, end, axis, extent
            )));
        }
        let mut shape = x.shape().to_vec();
        shape[axis] = end - begin;
        Ok(self.push_operation(
            "slice",
            &[x],
            x.descriptor.with_shape(shape),
            json!({ "axis": axis, "begin": begin, "end": end }),
            name,
        ))
    }

    pub fn reshape(
        &mut self,
        x: &Variable,
        new_shape: Vec<u32>,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        validate_reshape(x.shape(), &new_shape)?;
        Ok(self.push_operation(
            "reshape",
            &[x],
            x.descriptor.with_shape(new_shape.clone()),
            json!({ "newShape": new_shape }),
            name,
        ))
    }

    /// Position-sensitive region pooling
    ///
    /// `conv_map` is `(out_channel * group_size^2, H, W)` and `rois` is
    /// `(num_rois, 4)` boxes `(x1, y1, x2, y2)` in feature-map coordinates.
    pub fn psroi_pooling(
        &mut self,
        conv_map: &Variable,
        rois: &Variable,
        group_size: u32,
        out_channel: u32,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        let map = conv_map.shape();
        if map.len() != 3 || map[0] != out_channel * group_size * group_size {
            return Err(GraphError::shape(format!(
                "psroi pooling needs a ({} x {}^2, H, W) map, got {:?}",
                out_channel, group_size, map
            )));
        }
        let boxes = rois.shape();
        if boxes.len() != 2 || boxes[1] != 4 {
            return Err(GraphError::shape(format!(
                "psroi pooling needs (num_rois, 4) regions, got {:?}",
                boxes
            )));
        }
        let shape = vec![boxes[0], out_channel, group_size, group_size];
        Ok(self.push_operation(
            "psroiPooling",
            &[conv_map, rois],
            conv_map.descriptor.with_shape(shape),
            json!({ "groupSize": group_size, "outChannel": out_channel }),
            name,
        ))
    }

    pub fn cross_entropy_with_softmax(
        &mut self,
        output: &Variable,
        label: &Variable,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        self.criterion("crossEntropyWithSoftmax", output, label, json!({}), name)
    }

    pub fn classification_error(
        &mut self,
        output: &Variable,
        label: &Variable,
        top_n: u32,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        if top_n == 0 {
            return Err(GraphError::shape("classification error needs top_n >= 1"));
        }
        self.criterion(
            "classificationError",
            output,
            label,
            json!({ "topN": top_n }),
            name,
        )
    }

    /// Finalize the graph with `outputs` as its external outputs
    pub fn combine(&mut self, outputs: &[Variable], name: &str) -> GraphInfo {
        let mut output_operands = Vec::with_capacity(outputs.len());
        for output in outputs {
            if let Some(op) = self.operands.get_mut(output.id as usize) {
                if op.kind == OperandKind::Intermediate {
                    op.kind = OperandKind::Output;
                }
            }
            if !output_operands.contains(&output.id) {
                output_operands.push(output.id);
            }
        }

        GraphInfo {
            name: Some(name.to_string()),
            operands: self.operands.clone(),
            input_operands: self.input_operands.clone(),
            output_operands,
            operations: self.operations.clone(),
            constant_operand_ids_to_handles: self.constant_data_map.clone(),
            initializers: self.initializers.clone(),
        }
    }

    fn criterion(
        &mut self,
        op_type: &str,
        output: &Variable,
        label: &Variable,
        attributes: serde_json::Value,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        if output.feature_count() != label.feature_count() {
            return Err(GraphError::shape(format!(
                "{} compares {:?} against label {:?}",
                op_type,
                output.shape(),
                label.shape()
            )));
        }
        Ok(self.push_operation(
            op_type,
            &[output, label],
            output.descriptor.with_shape(vec![1]),
            attributes,
            name,
        ))
    }

    fn broadcast_op(
        &mut self,
        op_type: &str,
        a: &Variable,
        b: &Variable,
        name: Option<&str>,
    ) -> Result<Variable, GraphError> {
        let shape = broadcast_shapes(a.shape(), b.shape())?;
        Ok(self.push_operation(
            op_type,
            &[a, b],
            a.descriptor.with_shape(shape),
            json!({}),
            name,
        ))
    }

    fn unary_op(&mut self, op_type: &str, x: &Variable, name: Option<&str>) -> Variable {
        self.push_operation(op_type, &[x], x.descriptor.clone(), json!({}), name)
    }
}

/// Expand a per-axis setting to `rank` axes.
///
/// A single value applies to every spatial axis. The leading axis takes
/// `leading` when given (a stride spanning the whole channel axis).
fn broadcast_axes<T: Copy>(values: &[T], rank: usize, default: T, leading: Option<T>) -> Vec<T> {
    let mut out = match values.len() {
        0 => vec![default; rank],
        1 => vec![values[0]; rank],
        n if n == rank => values.to_vec(),
        n if n + 1 == rank => {
            let mut v = vec![default];
            v.extend_from_slice(values);
            v
        }
        _ => {
            let mut v = values.to_vec();
            v.resize(rank, default);
            v
        }
    };
    if let (Some(lead), Some(first)) = (leading, out.first_mut()) {
        *first = lead;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_and_parameter_registration() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("data", vec![3, 8, 8], DataType::Float32);
        let w = builder
            .parameter(vec![4, 3, 3, 3], DataType::Float32, ParameterInit::GlorotUniform, "c.W")
            .unwrap();
        let y = builder
            .convolution(&w, &x, &[1, 1], &[true], Some("c"))
            .unwrap();
        assert_eq!(y.shape(), &[4, 8, 8]);

        let graph = builder.combine(&[y.clone()], "outputs");
        assert_eq!(graph.input_names(), vec!["data".to_string()]);
        assert_eq!(graph.output_names(), vec!["c".to_string()]);
        assert_eq!(graph.operand(y.id).unwrap().kind, OperandKind::Output);
        assert!(matches!(
            graph.initializers.get(&w.id),
            Some(Initializer::GlorotUniform { .. })
        ));
    }

    #[test]
    fn test_parameter_value_count_checked() {
        let mut builder = GraphBuilder::new();
        let err = builder.parameter(
            vec![2, 2],
            DataType::Float32,
            ParameterInit::Values(vec![1.0; 3]),
            "p",
        );
        assert!(matches!(err, Err(GraphError::ShapeInferenceFailed { .. })));
    }

    #[test]
    fn test_strides_cover_channel_axis() {
        assert_eq!(broadcast_axes(&[2, 2], 3, 1, Some(3)), vec![3, 2, 2]);
        assert_eq!(broadcast_axes(&[true], 3, false, None), vec![true, true, true]);
        assert_eq!(broadcast_axes::<u32>(&[], 2, 1, Some(5)), vec![5, 1]);
    }

    #[test]
    fn test_slice_and_splice() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x", vec![6, 4, 4], DataType::Float32);
        let a = builder.slice(&x, 0, 0, 2, None).unwrap();
        let b = builder.slice(&x, 0, 2, 6, None).unwrap();
        let joined = builder.splice(&[a, b], 0, Some("joined")).unwrap();
        assert_eq!(joined.shape(), &[6, 4, 4]);
        assert!(builder.slice(&x, 0, 4, 7, None).is_err());
    }

    #[test]
    fn test_reopened_graph_demotes_outputs() {
        let mut builder = GraphBuilder::new();
        let x = builder.input("x", vec![4], DataType::Float32);
        let y = builder.relu(&x, Some("y"));
        let graph = builder.combine(&[y.clone()], "outputs");

        let mut reopened = GraphBuilder::from_graph(graph);
        let y = reopened.variable(y.id).unwrap();
        let z = reopened.softmax(&y, Some("z"));
        let graph = reopened.combine(&[z], "eval");
        assert_eq!(graph.output_names(), vec!["z".to_string()]);
        assert_eq!(graph.operand(y.id).unwrap().kind, OperandKind::Intermediate);
    }

    #[test]
    fn test_criterion_requires_matching_label() {
        let mut builder = GraphBuilder::new();
        let z = builder.input("z", vec![10], DataType::Float32);
        let label = builder.input("label", vec![5], DataType::Float32);
        assert!(builder.cross_entropy_with_softmax(&z, &label, None).is_err());
    }
}
