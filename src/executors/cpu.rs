//! Reference CPU executor
//!
//! Evaluates a finalized graph on host `f32` data, one sample at a time.
//! Operations run in construction order, which is topological.

use std::collections::HashMap;

use ndarray::{concatenate, indices, Array1, Array2, ArrayD, ArrayViewD, Axis, IxDyn, Slice, Zip};
use rand::distr::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::error::GraphError;
use crate::graph::{GraphInfo, Initializer, OperandKind, Operation};
use crate::shape_inference::{
    broadcast_shapes, infer_convolution_shape, infer_pooling_shape, leading_padding,
};
use crate::tensor::HostTensor;

/// Executes a [`GraphInfo`] with parameters materialized up front
pub struct CpuExecutor {
    graph: GraphInfo,
    values: HashMap<u32, ArrayD<f32>>,
}

impl CpuExecutor {
    /// Materialize every constant and parameter of `graph`.
    pub fn new(graph: GraphInfo) -> Result<Self, GraphError> {
        let mut values = HashMap::new();
        for (id, operand) in graph.operands.iter().enumerate() {
            let id = id as u32;
            if !matches!(operand.kind, OperandKind::Constant | OperandKind::Parameter) {
                continue;
            }
            let shape = usize_shape(&operand.descriptor.shape);
            let count: usize = shape.iter().product();
            let data = match graph.constant_values(id)? {
                Some(data) => data,
                None => match graph.initializers.get(&id) {
                    Some(init) => materialize(init, &shape)?,
                    None => {
                        return Err(GraphError::execution(format!(
                            "operand {} ({}) has neither data nor an initializer",
                            id,
                            operand.name.as_deref().unwrap_or("unnamed")
                        )))
                    }
                },
            };
            if data.len() != count {
                return Err(GraphError::execution(format!(
                    "operand {} holds {} values for shape {:?}",
                    id,
                    data.len(),
                    shape
                )));
            }
            values.insert(id, ArrayD::from_shape_vec(IxDyn(&shape), data)?);
        }
        debug!(
            materialized = values.len(),
            operations = graph.operations.len(),
            "prepared cpu executor"
        );
        Ok(Self { graph, values })
    }

    pub fn graph(&self) -> &GraphInfo {
        &self.graph
    }

    /// Evaluate every graph output, in output order.
    pub fn compute(
        &self,
        inputs: &HashMap<String, HostTensor>,
    ) -> Result<Vec<HostTensor>, GraphError> {
        let tensor_map = self.evaluate(inputs)?;
        self.graph
            .output_operands
            .iter()
            .map(|id| {
                let array = tensor_map.get(id).ok_or_else(|| {
                    GraphError::execution(format!("output operand {} was never computed", id))
                })?;
                let dtype = self.graph.operands[*id as usize].descriptor.data_type;
                Ok(HostTensor::from_array(array.clone(), dtype))
            })
            .collect()
    }

    /// Evaluate the graph, keyed by output operand name.
    pub fn run(
        &self,
        inputs: &HashMap<String, HostTensor>,
    ) -> Result<HashMap<String, HostTensor>, GraphError> {
        let outputs = self.compute(inputs)?;
        Ok(self
            .graph
            .output_operands
            .iter()
            .zip(outputs)
            .map(|(id, tensor)| {
                let name = self.graph.operands[*id as usize]
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("output_{}", id));
                (name, tensor)
            })
            .collect())
    }

    fn evaluate(
        &self,
        inputs: &HashMap<String, HostTensor>,
    ) -> Result<HashMap<u32, ArrayD<f32>>, GraphError> {
        let mut tensor_map: HashMap<u32, ArrayD<f32>> = HashMap::new();

        for id in &self.graph.input_operands {
            let operand = self
                .graph
                .operand(*id)
                .ok_or(GraphError::InvalidOperand { operand: *id })?;
            let name = operand.name.as_deref().unwrap_or_default();
            let tensor = inputs
                .get(name)
                .ok_or_else(|| GraphError::execution(format!("missing input `{}`", name)))?;
            let shape = usize_shape(&operand.descriptor.shape);
            if tensor.data.len() != shape.iter().product::<usize>() {
                return Err(GraphError::execution(format!(
                    "input `{}` holds {} values for shape {:?}",
                    name,
                    tensor.data.len(),
                    shape
                )));
            }
            tensor_map.insert(*id, ArrayD::from_shape_vec(IxDyn(&shape), tensor.data.clone())?);
        }

        for operation in &self.graph.operations {
            let output = self.execute(operation, &tensor_map)?;
            tensor_map.insert(operation.output_operand, output);
        }
        Ok(tensor_map)
    }

    fn operand<'a>(
        &'a self,
        tensor_map: &'a HashMap<u32, ArrayD<f32>>,
        operation: &Operation,
        index: usize,
    ) -> Result<&'a ArrayD<f32>, GraphError> {
        let id = operation.input_operands.get(index).copied().ok_or_else(|| {
            GraphError::execution(format!(
                "{} is missing input {}",
                operation.display_name(),
                index
            ))
        })?;
        tensor_map
            .get(&id)
            .or_else(|| self.values.get(&id))
            .ok_or_else(|| GraphError::execution(format!("operand {} has no value", id)))
    }

    fn execute(
        &self,
        operation: &Operation,
        tensor_map: &HashMap<u32, ArrayD<f32>>,
    ) -> Result<ArrayD<f32>, GraphError> {
        let input = move |index: usize| self.operand(tensor_map, operation, index);
        match operation.op_type.as_str() {
            "add" => broadcast_binary(input(0)?, input(1)?, |a, b| a + b),
            "mul" => broadcast_binary(input(0)?, input(1)?, |a, b| a * b),
            "div" => broadcast_binary(input(0)?, input(1)?, |a, b| a / b),
            "relu" => Ok(input(0)?.mapv(|v| v.max(0.0))),
            "square" => Ok(input(0)?.mapv(|v| v * v)),
            "exp" => Ok(input(0)?.mapv(f32::exp)),
            "log" => Ok(input(0)?.mapv(f32::ln)),
            "dropout" => Ok(input(0)?.clone()),
            "softmax" => Ok(softmax(input(0)?)),
            "convolution" => convolution(
                input(0)?,
                input(1)?,
                &operation.attr_u32s("strides").unwrap_or_default(),
                &operation.attr_bools("autoPadding").unwrap_or_default(),
            ),
            "maxPool" | "averagePool" => pooling(
                input(0)?,
                operation.op_type == "maxPool",
                &operation.attr_u32s("windowDimensions").unwrap_or_default(),
                &operation.attr_u32s("strides").unwrap_or_default(),
                operation.attr_bool("autoPadding").unwrap_or(false),
                operation.attr_bool("ceilOutDim").unwrap_or(true),
            ),
            "batchNormalization" => batch_normalization(
                input(0)?,
                input(1)?,
                input(2)?,
                input(3)?,
                input(4)?,
                operation.attr_f32("epsilon").unwrap_or(1e-5),
            ),
            "times" => times(input(0)?, input(1)?),
            "splice" => {
                let axis = operation.attr_u32("axis").unwrap_or(0) as usize;
                let views: Vec<ArrayViewD<f32>> = (0..operation.input_operands.len())
                    .map(|i| input(i).map(|a| a.view()))
                    .collect::<Result<_, _>>()?;
                Ok(concatenate(Axis(axis), &views)?)
            }
            "slice" => {
                let x = input(0)?;
                let axis = operation.attr_u32("axis").unwrap_or(0) as usize;
                let begin = operation.attr_u32("begin").unwrap_or(0) as usize;
                let end = operation
                    .attr_u32("end")
                    .map(|e| e as usize)
                    .unwrap_or(x.shape()[axis]);
                Ok(x.slice_axis(Axis(axis), Slice::from(begin..end)).to_owned())
            }
            "reshape" => {
                let shape = usize_shape(&operation.attr_u32s("newShape").unwrap_or_default());
                Ok(ArrayD::from_shape_vec(
                    IxDyn(&shape),
                    input(0)?.iter().copied().collect(),
                )?)
            }
            "psroiPooling" => psroi_pooling(
                input(0)?,
                input(1)?,
                operation.attr_u32("groupSize").unwrap_or(1) as usize,
                operation.attr_u32("outChannel").unwrap_or(1) as usize,
            ),
            "crossEntropyWithSoftmax" => cross_entropy_with_softmax(input(0)?, input(1)?),
            "classificationError" => classification_error(
                input(0)?,
                input(1)?,
                operation.attr_u32("topN").unwrap_or(1) as usize,
            ),
            other => Err(GraphError::UnsupportedOperator {
                op_type: other.to_string(),
            }),
        }
    }
}

fn usize_shape(shape: &[u32]) -> Vec<usize> {
    shape.iter().map(|d| *d as usize).collect()
}

fn materialize(init: &Initializer, shape: &[usize]) -> Result<Vec<f32>, GraphError> {
    let count: usize = shape.iter().product();
    match init {
        Initializer::Fill { value } => Ok(vec![*value; count]),
        Initializer::GlorotUniform { seed } => {
            let (fan_in, fan_out) = fans(shape);
            let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
            let dist = Uniform::new(-limit, limit)
                .map_err(|e| GraphError::execution(format!("glorot initializer: {}", e)))?;
            let mut rng = StdRng::seed_from_u64(*seed);
            Ok((0..count).map(|_| dist.sample(&mut rng)).collect())
        }
    }
}

/// Fan-in and fan-out of a kernel `(O, I, receptive..)` or a vector.
fn fans(shape: &[usize]) -> (usize, usize) {
    match shape.len() {
        0 => (1, 1),
        1 => (shape[0], shape[0]),
        _ => {
            let receptive: usize = shape[2..].iter().product();
            (shape[1] * receptive, shape[0] * receptive)
        }
    }
}

fn broadcast_binary(
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>, GraphError> {
    let a_shape: Vec<u32> = a.shape().iter().map(|d| *d as u32).collect();
    let b_shape: Vec<u32> = b.shape().iter().map(|d| *d as u32).collect();
    let shape = IxDyn(&usize_shape(&broadcast_shapes(&a_shape, &b_shape)?));
    let av = a
        .broadcast(shape.clone())
        .ok_or_else(|| GraphError::execution("left operand does not broadcast"))?;
    let bv = b
        .broadcast(shape)
        .ok_or_else(|| GraphError::execution("right operand does not broadcast"))?;
    Ok(Zip::from(&av).and(&bv).map_collect(|x, y| f(*x, *y)))
}

fn softmax(x: &ArrayD<f32>) -> ArrayD<f32> {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = x.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp.mapv(|v| v / sum)
}

fn as_u32(shape: &[usize]) -> Vec<u32> {
    shape.iter().map(|d| *d as u32).collect()
}

/// Direct N-d convolution; `weights[o]` spans the full leading axis of `data`.
fn convolution(
    data: &ArrayD<f32>,
    weights: &ArrayD<f32>,
    strides: &[u32],
    auto_padding: &[bool],
) -> Result<ArrayD<f32>, GraphError> {
    let data_shape = as_u32(data.shape());
    let weight_shape = as_u32(weights.shape());
    let out_shape = infer_convolution_shape(&data_shape, &weight_shape, strides, auto_padding)?;
    let rank = data.ndim();

    let stride: Vec<isize> = (0..rank)
        .map(|a| strides.get(a).copied().unwrap_or(1) as isize)
        .collect();
    let offset: Vec<isize> = (0..rank)
        .map(|a| {
            if a == 0 {
                0
            } else {
                leading_padding(
                    data_shape[a],
                    weight_shape[a + 1],
                    stride[a] as u32,
                    auto_padding.get(a).copied().unwrap_or(false),
                ) as isize
            }
        })
        .collect();

    let mut out = ArrayD::<f32>::zeros(IxDyn(&usize_shape(&out_shape)));
    let mut position = vec![0usize; rank];
    for (out_index, value) in out.indexed_iter_mut() {
        let kernel = weights.index_axis(Axis(0), out_index[0]);
        let mut acc = 0.0f32;
        'taps: for (tap, w) in kernel.indexed_iter() {
            for a in 0..rank {
                let base = if a == 0 {
                    0
                } else {
                    out_index[a] as isize * stride[a] - offset[a]
                };
                let p = base + tap[a] as isize;
                if p < 0 || p >= data_shape[a] as isize {
                    continue 'taps;
                }
                position[a] = p as usize;
            }
            acc += w * data[position.as_slice()];
        }
        *value = acc;
    }
    Ok(out)
}

/// Pooling over the trailing axes; windows clipped to the input.
fn pooling(
    data: &ArrayD<f32>,
    max: bool,
    window: &[u32],
    strides: &[u32],
    auto_padding: bool,
    ceil_mode: bool,
) -> Result<ArrayD<f32>, GraphError> {
    let data_shape = as_u32(data.shape());
    let out_shape = infer_pooling_shape(&data_shape, window, strides, auto_padding, ceil_mode)?;
    let leading = data_shape.len() - window.len();
    let stride: Vec<u32> = (0..window.len())
        .map(|i| strides.get(i).copied().unwrap_or(1))
        .collect();
    let offset: Vec<isize> = window
        .iter()
        .enumerate()
        .map(|(i, k)| leading_padding(data_shape[leading + i], *k, stride[i], auto_padding) as isize)
        .collect();
    let window_dim = IxDyn(&usize_shape(window));

    let mut out = ArrayD::<f32>::zeros(IxDyn(&usize_shape(&out_shape)));
    let mut position = vec![0usize; data_shape.len()];
    for (out_index, value) in out.indexed_iter_mut() {
        for a in 0..leading {
            position[a] = out_index[a];
        }
        let mut best = f32::NEG_INFINITY;
        let mut sum = 0.0f32;
        let mut count = 0usize;
        'window: for tap in indices(window_dim.clone()) {
            for i in 0..window.len() {
                let axis = leading + i;
                let p = out_index[axis] as isize * stride[i] as isize - offset[i] + tap[i] as isize;
                if p < 0 || p >= data_shape[axis] as isize {
                    continue 'window;
                }
                position[axis] = p as usize;
            }
            let v = data[position.as_slice()];
            best = best.max(v);
            sum += v;
            count += 1;
        }
        *value = if count == 0 {
            0.0
        } else if max {
            best
        } else {
            sum / count as f32
        };
    }
    Ok(out)
}

fn batch_normalization(
    x: &ArrayD<f32>,
    scale: &ArrayD<f32>,
    bias: &ArrayD<f32>,
    mean: &ArrayD<f32>,
    variance: &ArrayD<f32>,
    epsilon: f32,
) -> Result<ArrayD<f32>, GraphError> {
    let channels = x.shape().first().copied().unwrap_or(0);
    for param in [scale, bias, mean, variance] {
        if param.len() != channels {
            return Err(GraphError::execution(format!(
                "batch normalization parameter of {} values for {} channels",
                param.len(),
                channels
            )));
        }
    }
    let (scale, bias, mean, variance): (Vec<f32>, Vec<f32>, Vec<f32>, Vec<f32>) = (
        scale.iter().copied().collect(),
        bias.iter().copied().collect(),
        mean.iter().copied().collect(),
        variance.iter().copied().collect(),
    );

    let mut out = x.clone();
    for (c, mut plane) in out.axis_iter_mut(Axis(0)).enumerate() {
        let inv_std = 1.0 / (variance[c] + epsilon).sqrt();
        plane.mapv_inplace(|v| (v - mean[c]) * inv_std * scale[c] + bias[c]);
    }
    Ok(out)
}

fn times(x: &ArrayD<f32>, weights: &ArrayD<f32>) -> Result<ArrayD<f32>, GraphError> {
    let n = x.len();
    if n == 0 || weights.len() % n != 0 {
        return Err(GraphError::execution(format!(
            "cannot multiply {} inputs by {} weights",
            n,
            weights.len()
        )));
    }
    let m = weights.len() / n;
    let out_shape = weights.shape()[x.ndim()..].to_vec();
    let v = Array1::from_shape_vec(n, x.iter().copied().collect())?;
    let w = Array2::from_shape_vec((n, m), weights.iter().copied().collect())?;
    let product = v.dot(&w);
    Ok(ArrayD::from_shape_vec(
        IxDyn(&out_shape),
        product.iter().copied().collect(),
    )?)
}

/// Average each `(group x group)` bin of every region from its own channel block.
fn psroi_pooling(
    map: &ArrayD<f32>,
    rois: &ArrayD<f32>,
    group: usize,
    out_channel: usize,
) -> Result<ArrayD<f32>, GraphError> {
    if map.ndim() != 3 || map.shape()[0] != out_channel * group * group {
        return Err(GraphError::execution(format!(
            "psroi pooling map of shape {:?}",
            map.shape()
        )));
    }
    let height = map.shape()[1] as f32;
    let width = map.shape()[2] as f32;
    let regions = rois.len() / 4;
    let boxes: Vec<f32> = rois.iter().copied().collect();

    let mut out = ArrayD::<f32>::zeros(IxDyn(&[regions, out_channel, group, group]));
    for r in 0..regions {
        let x1 = boxes[4 * r].round();
        let y1 = boxes[4 * r + 1].round();
        let x2 = boxes[4 * r + 2].round() + 1.0;
        let y2 = boxes[4 * r + 3].round() + 1.0;
        let bin_w = (x2 - x1).max(0.1) / group as f32;
        let bin_h = (y2 - y1).max(0.1) / group as f32;

        for c in 0..out_channel {
            for gy in 0..group {
                for gx in 0..group {
                    let h0 = (y1 + gy as f32 * bin_h).floor().clamp(0.0, height) as usize;
                    let h1 = (y1 + (gy + 1) as f32 * bin_h).ceil().clamp(0.0, height) as usize;
                    let w0 = (x1 + gx as f32 * bin_w).floor().clamp(0.0, width) as usize;
                    let w1 = (x1 + (gx + 1) as f32 * bin_w).ceil().clamp(0.0, width) as usize;
                    let channel = (c * group + gy) * group + gx;

                    let mut sum = 0.0f32;
                    let mut count = 0usize;
                    for h in h0..h1 {
                        for w in w0..w1 {
                            sum += map[[channel, h, w]];
                            count += 1;
                        }
                    }
                    if count > 0 {
                        out[[r, c, gy, gx]] = sum / count as f32;
                    }
                }
            }
        }
    }
    Ok(out)
}

fn cross_entropy_with_softmax(
    output: &ArrayD<f32>,
    label: &ArrayD<f32>,
) -> Result<ArrayD<f32>, GraphError> {
    if output.len() != label.len() {
        return Err(GraphError::execution("label and output sizes differ"));
    }
    let max = output.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = output.iter().map(|v| (v - max).exp()).sum::<f32>().ln() + max;
    let loss: f32 = output
        .iter()
        .zip(label.iter())
        .map(|(z, t)| -t * (z - log_sum))
        .sum();
    Ok(ArrayD::from_elem(IxDyn(&[1]), loss))
}

/// 1 when the labelled class is outside the `top_n` highest scores, ties favouring the label.
fn classification_error(
    output: &ArrayD<f32>,
    label: &ArrayD<f32>,
    top_n: usize,
) -> Result<ArrayD<f32>, GraphError> {
    if output.len() != label.len() {
        return Err(GraphError::execution("label and output sizes differ"));
    }
    let labels: Vec<f32> = label.iter().copied().collect();
    let target = HostTensor::from_data(labels, vec![label.len()], Default::default())
        .argmax()
        .ok_or_else(|| GraphError::execution("empty label"))?;
    let scores: Vec<f32> = output.iter().copied().collect();
    let better = scores.iter().filter(|v| **v > scores[target]).count();
    let error = if better >= top_n { 1.0 } else { 0.0 };
    Ok(ArrayD::from_elem(IxDyn(&[1]), error))
}
