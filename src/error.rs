use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("layer `{layer}` has invalid parameters: {reason}")]
    InvalidParameters { layer: String, reason: String },
    #[error("no builder registered for operator `{op_type}`")]
    UnsupportedOperator { op_type: String },
    #[error("layer `{layer}` is listed in the topological order but not in the layer registry")]
    UnknownLayer { layer: String },
    #[error("layer `{layer}` consumes `{input}` which has not been produced yet")]
    UnresolvedInput { layer: String, input: String },
    #[error("symbol `{name}` is already bound")]
    DuplicateSymbol { name: String },
    #[error("assembler is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("shape inference failed: {reason}")]
    ShapeInferenceFailed { reason: String },
    #[error("operand {operand} does not exist in the graph")]
    InvalidOperand { operand: u32 },
    #[error("execution failed: {reason}")]
    ExecutionFailed { reason: String },
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("tensor shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl GraphError {
    pub(crate) fn invalid_parameters(layer: &str, reason: impl Into<String>) -> Self {
        GraphError::InvalidParameters {
            layer: layer.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(reason: impl Into<String>) -> Self {
        GraphError::ShapeInferenceFailed {
            reason: reason.into(),
        }
    }

    pub(crate) fn execution(reason: impl Into<String>) -> Self {
        GraphError::ExecutionFailed {
            reason: reason.into(),
        }
    }
}
