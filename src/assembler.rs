//! Walks a uni-model in topological order and assembles one native graph

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::builder::{GraphBuilder, Variable};
use crate::config::{GlobalConfig, ModelSolver};
use crate::error::GraphError;
use crate::graph::{DataType, GraphInfo};
use crate::operators::BuilderRegistry;
use crate::unimodel::{DataProvider, LayerDescriptor, UniModel};

/// Name of the combined multi-output graph
pub const COMBINED_GRAPH_NAME: &str = "outputs";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Uninitialized,
    InputsBound,
    Assembling,
    Finalized,
}

impl AssemblerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblerState::Uninitialized => "uninitialized",
            AssemblerState::InputsBound => "inputs-bound",
            AssemblerState::Assembling => "assembling",
            AssemblerState::Finalized => "finalized",
        }
    }
}

/// Named graph handles plus the outputs nobody has consumed yet
///
/// Both collections keep insertion order.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Variable>,
    order: Vec<String>,
    terminal: Vec<String>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an input placeholder.
    pub fn bind(&mut self, name: &str, handle: Variable) -> Result<(), GraphError> {
        if self.symbols.contains_key(name) {
            return Err(GraphError::DuplicateSymbol {
                name: name.to_string(),
            });
        }
        self.symbols.insert(name.to_string(), handle);
        self.order.push(name.to_string());
        Ok(())
    }

    /// Bind a layer output; it stays terminal until consumed.
    pub fn bind_output(&mut self, name: &str, handle: Variable) -> Result<(), GraphError> {
        self.bind(name, handle)?;
        self.terminal.push(name.to_string());
        Ok(())
    }

    /// Look up every input of `layer` and drop them from the terminal set.
    pub fn consume_inputs(&mut self, layer: &LayerDescriptor) -> Result<Vec<Variable>, GraphError> {
        let mut resolved = Vec::with_capacity(layer.inputs.len());
        for input in &layer.inputs {
            let handle = self
                .symbols
                .get(input)
                .cloned()
                .ok_or_else(|| GraphError::UnresolvedInput {
                    layer: layer.op_name.clone(),
                    input: input.clone(),
                })?;
            resolved.push(handle);
        }
        self.terminal.retain(|name| !layer.inputs.contains(name));
        Ok(resolved)
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.symbols.get(name)
    }

    /// Bound names in binding order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn terminal_names(&self) -> &[String] {
        &self.terminal
    }

    pub fn terminal_handles(&self) -> Vec<Variable> {
        self.terminal
            .iter()
            .filter_map(|name| self.symbols.get(name).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Converts a uni-model into a native graph
pub struct GraphAssembler {
    model_solver: ModelSolver,
    registry: BuilderRegistry,
    builder: GraphBuilder,
    symbols: SymbolTable,
    state: AssemblerState,
    output: Option<GraphInfo>,
}

impl GraphAssembler {
    pub fn new(config: &GlobalConfig) -> Self {
        Self::with_registry(config, BuilderRegistry::with_defaults())
    }

    /// Assembler dispatching through a caller-provided registry
    pub fn with_registry(config: &GlobalConfig, registry: BuilderRegistry) -> Self {
        Self {
            model_solver: config.model_solver.clone(),
            registry,
            builder: GraphBuilder::new(),
            symbols: SymbolTable::new(),
            state: AssemblerState::Uninitialized,
            output: None,
        }
    }

    /// Run the whole conversion for `model`.
    pub fn from_model(model: &UniModel, config: &GlobalConfig) -> Result<Self, GraphError> {
        let mut assembler = Self::new(config);
        assembler.bind_inputs(&model.data_providers)?;
        assembler.assemble(&model.sorted_layers, &model.layers)?;
        assembler.finalize()?;
        Ok(assembler)
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    fn expect_state(&self, allowed: &[AssemblerState], expected: &'static str) -> Result<(), GraphError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(GraphError::InvalidState {
                expected,
                actual: self.state.as_str(),
            })
        }
    }

    /// Create one input placeholder per declared input.
    ///
    /// A configured input-shape override replaces the data providers entirely.
    pub fn bind_inputs(&mut self, data_providers: &[DataProvider]) -> Result<(), GraphError> {
        self.expect_state(&[AssemblerState::Uninitialized], "uninitialized")?;

        let declared: Vec<(String, Vec<u32>)> = match &self.model_solver.cntk_tensor {
            Some(overrides) => {
                info!(count = overrides.len(), "binding inputs from configured tensor shapes");
                overrides
                    .iter()
                    .map(|(name, shape)| (name.clone(), shape.clone()))
                    .collect()
            }
            None => data_providers
                .iter()
                .map(|p| (p.op_name.clone(), p.tensor.clone()))
                .collect(),
        };

        for (name, shape) in declared {
            debug!(input = %name, ?shape, "bind input");
            let handle = self.builder.input(&name, shape, DataType::Float32);
            self.symbols.bind(&name, handle)?;
        }
        self.state = AssemblerState::InputsBound;
        Ok(())
    }

    /// Build every layer of `sorted_layers` in order.
    pub fn assemble(
        &mut self,
        sorted_layers: &[String],
        layers: &HashMap<String, LayerDescriptor>,
    ) -> Result<(), GraphError> {
        self.expect_state(
            &[AssemblerState::InputsBound, AssemblerState::Assembling],
            "inputs-bound",
        )?;
        self.state = AssemblerState::Assembling;

        for layer_name in sorted_layers {
            let layer = layers.get(layer_name).ok_or_else(|| GraphError::UnknownLayer {
                layer: layer_name.clone(),
            })?;
            let inputs = self.symbols.consume_inputs(layer)?;
            let output = self.registry.build(&mut self.builder, layer, &inputs)?;
            debug!(
                layer = %layer.op_name,
                op_type = %layer.op_type,
                shape = ?output.shape(),
                "built layer"
            );
            self.symbols.bind_output(&layer.op_name, output)?;
        }
        Ok(())
    }

    /// Combine every terminal output into one graph.
    pub fn finalize(&mut self) -> Result<&GraphInfo, GraphError> {
        self.expect_state(
            &[
                AssemblerState::InputsBound,
                AssemblerState::Assembling,
                AssemblerState::Finalized,
            ],
            "assembling",
        )?;
        if self.output.is_none() {
            let outputs = self.symbols.terminal_handles();
            info!(
                outputs = ?self.symbols.terminal_names(),
                operations = self.builder.operation_count(),
                "combining terminal outputs"
            );
            self.output = Some(self.builder.combine(&outputs, COMBINED_GRAPH_NAME));
        }
        self.state = AssemblerState::Finalized;
        self.output
            .as_ref()
            .ok_or(GraphError::InvalidState {
                expected: "finalized",
                actual: "assembling",
            })
    }

    /// The combined graph once finalized
    pub fn model(&self) -> Option<&GraphInfo> {
        self.output.as_ref()
    }

    pub fn into_model(self) -> Option<GraphInfo> {
        self.output
    }

    /// Every bound name and its graph handle
    pub fn functions(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Save the combined graph to the configured model path.
    pub fn export_model(&self) -> Result<PathBuf, GraphError> {
        let graph = self.output.as_ref().ok_or(GraphError::InvalidState {
            expected: "finalized",
            actual: self.state.as_str(),
        })?;
        let path = self
            .model_solver
            .cntk_model_path
            .clone()
            .ok_or_else(|| GraphError::Config {
                reason: "model_solver.cntk_model_path is not set".to_string(),
            })?;
        graph.save(&path)?;
        info!(path = %path.display(), "exported model");
        Ok(path)
    }
}
