pub mod assembler;
pub mod builder;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod executors;
pub mod graph;
pub mod operators;
pub mod reader;
pub mod shape_inference;
pub mod tensor;
pub mod unimodel;
pub mod weights;

pub use assembler::{AssemblerState, GraphAssembler, SymbolTable};
pub use builder::{GraphBuilder, ParameterInit, PoolingKind, Variable};
pub use config::{ClassifyEvalSolver, CropType, GlobalConfig, ModelSolver};
pub use error::GraphError;
pub use evaluator::{EvalGraph, Evaluator};
pub use executors::CpuExecutor;
pub use graph::{
    load_graph_from_path, ConstantData, DataType, GraphInfo, Initializer, Operand,
    OperandDescriptor, OperandKind, Operation,
};
pub use operators::{BuilderRegistry, LayerBuilder};
pub use reader::{ImageMinibatchSource, Minibatch, MinibatchSource};
pub use tensor::HostTensor;
pub use unimodel::{DataProvider, LayerDescriptor, LayerParameters, OpType, UniModel};
