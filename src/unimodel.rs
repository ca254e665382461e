//! Framework-independent model description consumed by the assembler

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Abstract layer type, selecting a builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Convolution,
    BatchNormalization,
    Pooling,
    Relu,
    Dense,
    Plus,
    ClassificationError,
    CrossEntropyWithSoftmax,
    Dropout,
    Lrn,
    Splice,
    PsroiPooling,
    Softmax,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Convolution => "convolution",
            OpType::BatchNormalization => "batch_normalization",
            OpType::Pooling => "pooling",
            OpType::Relu => "relu",
            OpType::Dense => "dense",
            OpType::Plus => "plus",
            OpType::ClassificationError => "classification_error",
            OpType::CrossEntropyWithSoftmax => "cross_entropy_with_softmax",
            OpType::Dropout => "dropout",
            OpType::Lrn => "lrn",
            OpType::Splice => "splice",
            OpType::PsroiPooling => "psroi_pooling",
            OpType::Softmax => "softmax",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn one() -> u32 {
    1
}

fn default_epsilon() -> f32 {
    1e-5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvolutionParams {
    pub output: u32,
    pub kernel: Vec<u32>,
    #[serde(default)]
    pub stride: Vec<u32>,
    #[serde(default)]
    pub auto_pad: bool,
    #[serde(default)]
    pub need_bias: bool,
    #[serde(default = "one")]
    pub group: u32,
    /// Empty means no dilation on any axis
    #[serde(default)]
    pub dilation: Vec<u32>,
}

impl ConvolutionParams {
    pub fn dilation_factors(&self) -> Vec<usize> {
        if self.dilation.is_empty() {
            vec![1; self.kernel.len()]
        } else {
            self.dilation.iter().map(|d| *d as usize).collect()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormParams {
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    #[default]
    Max,
    Average,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolingParams {
    pub kernel: Vec<u32>,
    #[serde(default)]
    pub stride: Vec<u32>,
    #[serde(default)]
    pub auto_pad: bool,
    #[serde(default)]
    pub pooling_type: PoolingType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseParams {
    pub num_output: u32,
    #[serde(default)]
    pub transpose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LrnParams {
    pub k: f32,
    pub kernel_size: u32,
    pub alpha: f32,
    pub beta: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationErrorParams {
    #[serde(default = "one")]
    pub top_n: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsroiPoolingParams {
    pub group_size: u32,
    pub out_channel: u32,
}

/// Hyperparameters of a layer, tagged by the layer type they belong to
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerParameters {
    Convolution(ConvolutionParams),
    BatchNormalization(BatchNormParams),
    Pooling(PoolingParams),
    Dense(DenseParams),
    Lrn(LrnParams),
    ClassificationError(ClassificationErrorParams),
    PsroiPooling(PsroiPoolingParams),
    #[default]
    None,
}

impl LayerParameters {
    /// Whether this parameter record can configure a layer of `op_type`.
    pub fn fits(&self, op_type: OpType) -> bool {
        matches!(
            (self, op_type),
            (LayerParameters::Convolution(_), OpType::Convolution)
                | (LayerParameters::BatchNormalization(_), OpType::BatchNormalization)
                | (LayerParameters::Pooling(_), OpType::Pooling)
                | (LayerParameters::Dense(_), OpType::Dense)
                | (LayerParameters::Lrn(_), OpType::Lrn)
                | (LayerParameters::ClassificationError(_), OpType::ClassificationError)
                | (LayerParameters::PsroiPooling(_), OpType::PsroiPooling)
                | (
                    LayerParameters::None,
                    OpType::Plus
                        | OpType::Relu
                        | OpType::Softmax
                        | OpType::Dropout
                        | OpType::Splice
                        | OpType::CrossEntropyWithSoftmax
                )
        )
    }
}

/// Raw numeric array exported from the source framework
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterTensor {
    #[serde(default)]
    pub data: Vec<f32>,
}

impl From<Vec<f32>> for ParameterTensor {
    fn from(data: Vec<f32>) -> Self {
        Self { data }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub op_name: String,
    pub op_type: OpType,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub parameters: LayerParameters,
    #[serde(default)]
    pub parameter_tensor: Option<Vec<ParameterTensor>>,
}

impl LayerDescriptor {
    pub fn new(op_name: &str, op_type: OpType, inputs: &[&str]) -> Self {
        Self {
            op_name: op_name.to_string(),
            op_type,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            parameters: LayerParameters::None,
            parameter_tensor: None,
        }
    }

    pub fn with_parameters(mut self, parameters: LayerParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_tensors(mut self, tensors: Vec<Vec<f32>>) -> Self {
        self.parameter_tensor = Some(tensors.into_iter().map(ParameterTensor::from).collect());
        self
    }

    /// Pretrained tensors; an empty list counts as none.
    pub fn pretrained(&self) -> Option<&[ParameterTensor]> {
        match &self.parameter_tensor {
            Some(tensors) if !tensors.is_empty() => Some(tensors.as_slice()),
            _ => None,
        }
    }

    pub fn pretrained_data(&self) -> Vec<Vec<f32>> {
        self.pretrained()
            .map(|tensors| tensors.iter().map(|t| t.data.clone()).collect())
            .unwrap_or_default()
    }

    fn mismatch(&self) -> GraphError {
        GraphError::invalid_parameters(
            &self.op_name,
            format!("parameters do not describe a {} layer", self.op_type),
        )
    }

    pub fn convolution_params(&self) -> Result<&ConvolutionParams, GraphError> {
        match &self.parameters {
            LayerParameters::Convolution(p) => Ok(p),
            _ => Err(self.mismatch()),
        }
    }

    pub fn batch_norm_params(&self) -> Result<&BatchNormParams, GraphError> {
        match &self.parameters {
            LayerParameters::BatchNormalization(p) => Ok(p),
            _ => Err(self.mismatch()),
        }
    }

    pub fn pooling_params(&self) -> Result<&PoolingParams, GraphError> {
        match &self.parameters {
            LayerParameters::Pooling(p) => Ok(p),
            _ => Err(self.mismatch()),
        }
    }

    pub fn dense_params(&self) -> Result<&DenseParams, GraphError> {
        match &self.parameters {
            LayerParameters::Dense(p) => Ok(p),
            _ => Err(self.mismatch()),
        }
    }

    pub fn lrn_params(&self) -> Result<&LrnParams, GraphError> {
        match &self.parameters {
            LayerParameters::Lrn(p) => Ok(p),
            _ => Err(self.mismatch()),
        }
    }

    pub fn classification_error_params(&self) -> Result<&ClassificationErrorParams, GraphError> {
        match &self.parameters {
            LayerParameters::ClassificationError(p) => Ok(p),
            _ => Err(self.mismatch()),
        }
    }

    pub fn psroi_pooling_params(&self) -> Result<&PsroiPoolingParams, GraphError> {
        match &self.parameters {
            LayerParameters::PsroiPooling(p) => Ok(p),
            _ => Err(self.mismatch()),
        }
    }

    /// Reject parameter records that belong to another layer type.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.parameters.fits(self.op_type) {
            Ok(())
        } else {
            Err(self.mismatch())
        }
    }
}

/// A declared model input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProvider {
    pub op_name: String,
    pub tensor: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UniModel {
    #[serde(default)]
    pub sorted_layers: Vec<String>,
    #[serde(default)]
    pub layers: HashMap<String, LayerDescriptor>,
    #[serde(default)]
    pub data_providers: Vec<DataProvider>,
}

impl UniModel {
    pub fn new(data_providers: Vec<DataProvider>) -> Self {
        Self {
            sorted_layers: Vec::new(),
            layers: HashMap::new(),
            data_providers,
        }
    }

    /// Append a layer after every layer added so far.
    pub fn push_layer(&mut self, layer: LayerDescriptor) {
        self.sorted_layers.push(layer.op_name.clone());
        self.layers.insert(layer.op_name.clone(), layer);
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_descriptor_from_json() {
        let json = r#"{
            "op_name": "conv1",
            "op_type": "convolution",
            "inputs": ["data"],
            "parameters": {"type": "convolution", "output": 8, "kernel": [3, 3], "need_bias": true},
            "parameter_tensor": []
        }"#;
        let layer: LayerDescriptor = serde_json::from_str(json).unwrap();
        let params = layer.convolution_params().unwrap();
        assert_eq!(params.group, 1);
        assert_eq!(params.dilation_factors(), vec![1, 1]);
        assert!(layer.pretrained().is_none());
        assert!(layer.validate().is_ok());
    }

    #[test]
    fn test_parameterless_layer_defaults() {
        let json = r#"{"op_name": "r", "op_type": "relu", "inputs": ["x"]}"#;
        let layer: LayerDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(layer.parameters, LayerParameters::None);
        assert!(layer.validate().is_ok());
    }

    #[test]
    fn test_mismatched_parameters_rejected() {
        let layer = LayerDescriptor::new("d", OpType::Dense, &["x"]).with_parameters(
            LayerParameters::Pooling(PoolingParams {
                kernel: vec![2, 2],
                stride: vec![2, 2],
                auto_pad: false,
                pooling_type: PoolingType::Max,
            }),
        );
        assert!(matches!(
            layer.validate(),
            Err(GraphError::InvalidParameters { .. })
        ));
        assert!(layer.dense_params().is_err());
    }

    #[test]
    fn test_push_layer_keeps_order() {
        let mut model = UniModel::new(vec![DataProvider {
            op_name: "data".to_string(),
            tensor: vec![3, 4, 4],
        }]);
        model.push_layer(LayerDescriptor::new("b", OpType::Relu, &["data"]));
        model.push_layer(LayerDescriptor::new("a", OpType::Softmax, &["b"]));
        assert_eq!(model.sorted_layers, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(OpType::PsroiPooling.to_string(), "psroi_pooling");
    }
}
