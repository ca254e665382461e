//! Host tensors exchanged with the reference executor

use ndarray::{ArrayD, IxDyn};

use crate::error::GraphError;
use crate::graph::{DataType, OperandDescriptor};

/// Host-resident tensor stored in CPU memory
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    /// Values in row-major order
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl HostTensor {
    /// Zero-filled tensor
    pub fn new(shape: Vec<usize>, dtype: DataType) -> Self {
        let total_elements: usize = shape.iter().product();
        let data = vec![0.0f32; total_elements];
        Self { data, shape, dtype }
    }

    /// Create a host tensor from existing data
    pub fn from_data(data: Vec<f32>, shape: Vec<usize>, dtype: DataType) -> Self {
        Self { data, shape, dtype }
    }

    /// Tensor matching an operand descriptor, checking the value count.
    pub fn for_descriptor(
        descriptor: &OperandDescriptor,
        data: Vec<f32>,
    ) -> Result<Self, GraphError> {
        let shape: Vec<usize> = descriptor.shape.iter().map(|d| *d as usize).collect();
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(GraphError::execution(format!(
                "tensor of shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self::from_data(data, shape, descriptor.data_type))
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Index of the largest value; ties resolve to the lowest index.
    pub fn argmax(&self) -> Option<usize> {
        let mut best: Option<(usize, f32)> = None;
        for (i, v) in self.data.iter().enumerate() {
            match best {
                Some((_, b)) if *v <= b => {}
                _ => best = Some((i, *v)),
            }
        }
        best.map(|(i, _)| i)
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>, GraphError> {
        Ok(ArrayD::from_shape_vec(
            IxDyn(&self.shape),
            self.data.clone(),
        )?)
    }

    pub fn from_array(array: ArrayD<f32>, dtype: DataType) -> Self {
        let shape = array.shape().to_vec();
        let data = array.iter().copied().collect();
        Self { data, shape, dtype }
    }
}
