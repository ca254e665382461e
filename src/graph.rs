use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

use crate::error::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Float32,
    Float64,
}

impl DataType {
    pub fn bytes_per_element(self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float64 => 8,
        }
    }

    /// Encode host values into the byte layout of this data type.
    pub fn encode(self, values: &[f32]) -> Vec<u8> {
        match self {
            DataType::Float32 => bytemuck::cast_slice::<f32, u8>(values).to_vec(),
            DataType::Float64 => {
                let wide: Vec<f64> = values.iter().map(|v| *v as f64).collect();
                bytemuck::cast_slice::<f64, u8>(&wide).to_vec()
            }
        }
    }

    /// Decode bytes stored with this data type into host `f32` values.
    pub fn decode(self, bytes: &[u8]) -> Result<Vec<f32>, GraphError> {
        if bytes.len() % self.bytes_per_element() != 0 {
            return Err(GraphError::execution(format!(
                "{} bytes is not a whole number of {:?} elements",
                bytes.len(),
                self
            )));
        }
        Ok(match self {
            DataType::Float32 => bytemuck::pod_collect_to_vec::<u8, f32>(bytes),
            DataType::Float64 => bytemuck::pod_collect_to_vec::<u8, f64>(bytes)
                .into_iter()
                .map(|v| v as f32)
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandDescriptor {
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub shape: Vec<u32>,
}

impl OperandDescriptor {
    pub fn new(data_type: DataType, shape: Vec<u32>) -> Self {
        Self { data_type, shape }
    }

    pub fn float32(shape: Vec<u32>) -> Self {
        Self::new(DataType::Float32, shape)
    }

    pub fn element_count(&self) -> Option<usize> {
        if self.shape.is_empty() {
            return Some(1);
        }
        let mut count = 1usize;
        for dim in &self.shape {
            count = count.checked_mul(*dim as usize)?;
        }
        Some(count)
    }

    pub fn byte_length(&self) -> Option<usize> {
        let elements = self.element_count()?;
        elements.checked_mul(self.data_type.bytes_per_element())
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn with_shape(&self, shape: Vec<u32>) -> Self {
        Self {
            data_type: self.data_type,
            shape,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperandKind {
    Input,
    Parameter,
    Constant,
    Intermediate,
    Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    pub descriptor: OperandDescriptor,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub input_operands: Vec<u32>,
    pub output_operand: u32,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub label: Option<String>,
}

impl Operation {
    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.op_type.clone())
    }

    pub fn attr_u32s(&self, key: &str) -> Option<Vec<u32>> {
        self.attributes.get(key).and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .filter_map(|x| x.as_u64())
                .map(|x| x as u32)
                .collect()
        })
    }

    pub fn attr_bools(&self, key: &str) -> Option<Vec<bool>> {
        self.attributes
            .get(key)
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_bool()).collect())
    }

    pub fn attr_f32(&self, key: &str) -> Option<f32> {
        self.attributes
            .get(key)
            .and_then(|v| v.as_f64())
            .map(|v| v as f32)
    }

    pub fn attr_u32(&self, key: &str) -> Option<u32> {
        self.attributes
            .get(key)
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attributes.get(key).and_then(|v| v.as_bool())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantData {
    #[serde_as(as = "Base64")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub label: Option<String>,
}

/// Deferred initial value for a parameter that carries no pretrained data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    Fill { value: f32 },
    GlorotUniform { seed: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphInfo {
    #[serde(default)]
    pub name: Option<String>,
    pub operands: Vec<Operand>,
    #[serde(default)]
    pub input_operands: Vec<u32>,
    #[serde(default)]
    pub output_operands: Vec<u32>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub constant_operand_ids_to_handles: HashMap<u32, ConstantData>,
    #[serde(default)]
    pub initializers: HashMap<u32, Initializer>,
}

impl GraphInfo {
    pub fn operand(&self, id: u32) -> Option<&Operand> {
        self.operands.get(id as usize)
    }

    /// Look up the first operand carrying `name`.
    pub fn operand_id_by_name(&self, name: &str) -> Option<u32> {
        self.operands
            .iter()
            .position(|op| op.name.as_deref() == Some(name))
            .map(|idx| idx as u32)
    }

    pub fn input_names(&self) -> Vec<String> {
        self.input_operands
            .iter()
            .filter_map(|id| self.operand(*id).and_then(|op| op.name.clone()))
            .collect()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.output_operands
            .iter()
            .filter_map(|id| self.operand(*id).and_then(|op| op.name.clone()))
            .collect()
    }

    /// Operation producing `operand`, if any.
    pub fn producer(&self, operand: u32) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|op| op.output_operand == operand)
    }

    /// Decoded values of a constant or pretrained parameter operand.
    pub fn constant_values(&self, id: u32) -> Result<Option<Vec<f32>>, GraphError> {
        let operand = self
            .operand(id)
            .ok_or(GraphError::InvalidOperand { operand: id })?;
        match self.constant_operand_ids_to_handles.get(&id) {
            Some(constant) => operand.descriptor.data_type.decode(&constant.data).map(Some),
            None => Ok(None),
        }
    }

    /// Total number of scalar values held by parameters.
    pub fn parameter_count(&self) -> usize {
        self.operands
            .iter()
            .filter(|op| op.kind == OperandKind::Parameter)
            .filter_map(|op| op.descriptor.element_count())
            .sum()
    }

    /// Write the graph as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GraphError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Read a graph previously written by [`GraphInfo::save`].
pub fn load_graph_from_path(path: impl AsRef<Path>) -> Result<GraphInfo, GraphError> {
    let contents = fs::read_to_string(path)?;
    let graph = serde_json::from_str(&contents)?;
    Ok(graph)
}
