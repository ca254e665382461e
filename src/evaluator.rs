//! Classification accuracy of a converted model over a labelled dataset

use std::collections::HashMap;
use std::io::Write;

use tracing::{info, warn};

use crate::builder::GraphBuilder;
use crate::config::{ClassifyEvalSolver, GlobalConfig};
use crate::error::GraphError;
use crate::executors::CpuExecutor;
use crate::graph::{DataType, GraphInfo};
use crate::reader::{load_mean_file, ImageMinibatchSource, ImageTransforms, MinibatchSource};

const LABEL_INPUT: &str = "label";
const PROGRESS_INTERVAL: usize = 100;

/// Evaluation graph built around a converted model
pub struct EvalGraph {
    pub graph: GraphInfo,
    /// Name of the model input fed with images
    pub data_input: String,
    /// Position of the classification error among the graph outputs
    pub error_output: usize,
}

pub struct Evaluator {
    eval_solver: ClassifyEvalSolver,
    model: GraphInfo,
}

impl Evaluator {
    pub fn new(config: &GlobalConfig, model: GraphInfo) -> Self {
        Self {
            eval_solver: config.classify_eval_solver.clone(),
            model,
        }
    }

    /// Attach a label input, loss and top-N error to the model's first output.
    pub fn build_eval_graph(&self) -> Result<EvalGraph, GraphError> {
        let data_id = *self.model.input_operands.first().ok_or_else(|| GraphError::Config {
            reason: "model has no inputs to feed images into".to_string(),
        })?;
        let output_id = *self.model.output_operands.first().ok_or_else(|| GraphError::Config {
            reason: "model has no outputs to evaluate".to_string(),
        })?;
        let data_input = self
            .model
            .operand(data_id)
            .and_then(|op| op.name.clone())
            .ok_or(GraphError::InvalidOperand { operand: data_id })?;

        let mut builder = GraphBuilder::from_graph(self.model.clone());
        let label = builder.input(
            LABEL_INPUT,
            self.eval_solver.label_tensor.clone(),
            DataType::Float32,
        );
        let output = builder.variable(output_id)?;
        let flattened = builder.reshape(&output, vec![output.feature_count() as u32], None)?;
        let ce = builder.cross_entropy_with_softmax(&flattened, &label, Some("ce"))?;
        let pe = builder.classification_error(
            &flattened,
            &label,
            self.eval_solver.top_n,
            Some("pe"),
        )?;

        Ok(EvalGraph {
            graph: builder.combine(&[ce, pe], "eval"),
            data_input,
            error_output: 1,
        })
    }

    /// Evaluate over the configured image dataset.
    ///
    /// Returns `Ok(None)` without touching the model when the index map or a
    /// configured mean file does not exist.
    pub fn eval_model(&self, out: &mut impl Write) -> Result<Option<f32>, GraphError> {
        out.flush()?;
        writeln!(out, "start eval...")?;
        writeln!(out, "launch map and mean files")?;

        let map_file = match &self.eval_solver.index_map {
            Some(path) if path.exists() => path.clone(),
            _ => return Self::missing_files(out),
        };
        if let Some(mean_file) = &self.eval_solver.mean_file {
            if !mean_file.exists() {
                warn!(mean = %mean_file.display(), "mean file not found");
                return Self::missing_files(out);
            }
        }

        let eval = self.build_eval_graph()?;
        let data = eval
            .graph
            .operand_id_by_name(&eval.data_input)
            .and_then(|id| eval.graph.operand(id))
            .ok_or_else(|| GraphError::Config {
                reason: format!("input `{}` disappeared from the graph", eval.data_input),
            })?;
        let shape = match data.descriptor.shape.as_slice() {
            [c, h, w] => [*c as usize, *h as usize, *w as usize],
            other => {
                return Err(GraphError::Config {
                    reason: format!("image input must be (C, H, W), got {:?}", other),
                })
            }
        };

        let mean = match &self.eval_solver.mean_file {
            Some(path) => Some(load_mean_file(path, shape)?),
            None => {
                warn!("no mean file configured, images are fed without mean subtraction");
                None
            }
        };
        let num_classes: usize = self
            .eval_solver
            .label_tensor
            .iter()
            .map(|d| *d as usize)
            .product();
        let mut source = ImageMinibatchSource::new(
            &map_file,
            num_classes,
            ImageTransforms {
                shape,
                crop: self.eval_solver.crop_type,
                crop_ratio: self.eval_solver.crop_ratio,
                mean,
            },
        )?;

        self.eval_with_source(out, eval, &mut source).map(Some)
    }

    fn missing_files(out: &mut impl Write) -> Result<Option<f32>, GraphError> {
        writeln!(out, "fail to locate index files, eval exit.")?;
        Ok(None)
    }

    /// Run `dataset_size / batch_size` batches from `source` and report the mean error.
    pub fn eval_with_source(
        &self,
        out: &mut impl Write,
        eval: EvalGraph,
        source: &mut dyn MinibatchSource,
    ) -> Result<f32, GraphError> {
        self.eval_solver.validate()?;
        let batch_size = self.eval_solver.batch_size;
        let num_batches = self.eval_solver.dataset_size / batch_size;
        let error_output = eval.error_output;
        let data_input = eval.data_input.clone();
        let executor = CpuExecutor::new(eval.graph)?;
        info!(num_batches, batch_size, "evaluating");

        let mut total = 0.0f32;
        for i in 0..num_batches {
            let batch = source.next_minibatch(batch_size)?;
            let mut batch_error = 0.0f32;
            for (features, label) in batch.features.into_iter().zip(batch.labels) {
                let mut inputs = HashMap::new();
                inputs.insert(data_input.clone(), features);
                inputs.insert(LABEL_INPUT.to_string(), label);
                let outputs = executor.compute(&inputs)?;
                batch_error += outputs[error_output].data.first().copied().unwrap_or(0.0);
            }
            total += batch_error / batch_size as f32;

            if i % PROGRESS_INTERVAL == 0 {
                writeln!(
                    out,
                    "Evaluate error with {} with test range {}...",
                    total / (i + 1) as f32,
                    i * batch_size
                )?;
                out.flush()?;
            }
        }

        let average = if num_batches == 0 {
            0.0
        } else {
            total / num_batches as f32
        };
        writeln!(out, "Final evaluate error with {}", average)?;
        Ok(average)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ParameterInit;
    use crate::reader::Minibatch;
    use crate::tensor::HostTensor;

    /// Scores equal the input, so the argmax of the features is the prediction.
    fn identity_model(classes: u32) -> GraphInfo {
        let mut builder = GraphBuilder::new();
        let x = builder.input("data", vec![classes], DataType::Float32);
        let zero = builder
            .parameter(vec![classes], DataType::Float32, ParameterInit::Fill(0.0), "b")
            .unwrap();
        let z = builder.plus(&x, &zero, Some("z")).unwrap();
        builder.combine(&[z], "outputs")
    }

    struct FixedSource {
        samples: Vec<(Vec<f32>, usize)>,
        cursor: usize,
    }

    impl MinibatchSource for FixedSource {
        fn next_minibatch(&mut self, size: usize) -> Result<Minibatch, GraphError> {
            let mut batch = Minibatch::default();
            for _ in 0..size {
                let (features, label) = self.samples[self.cursor].clone();
                self.cursor = (self.cursor + 1) % self.samples.len();
                let mut one_hot = vec![0.0; features.len()];
                one_hot[label] = 1.0;
                let n = features.len();
                batch
                    .features
                    .push(HostTensor::from_data(features, vec![n], DataType::Float32));
                batch
                    .labels
                    .push(HostTensor::from_data(one_hot, vec![n], DataType::Float32));
            }
            Ok(batch)
        }
    }

    fn config(dataset_size: usize, batch_size: usize) -> GlobalConfig {
        let mut config = GlobalConfig::default();
        config.classify_eval_solver.label_tensor = vec![3];
        config.classify_eval_solver.dataset_size = dataset_size;
        config.classify_eval_solver.batch_size = batch_size;
        config
    }

    #[test]
    fn test_missing_index_map_returns_early() {
        let evaluator = Evaluator::new(&config(4, 2), identity_model(3));
        let mut out = Vec::new();
        assert_eq!(evaluator.eval_model(&mut out).unwrap(), None);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "start eval...\nlaunch map and mean files\nfail to locate index files, eval exit.\n"
        );
    }

    #[test]
    fn test_missing_mean_file_returns_early() {
        let dir = tempfile::tempdir().unwrap();
        let map = dir.path().join("map.txt");
        std::fs::write(&map, "a.png\t0\n").unwrap();
        let mut config = config(4, 2);
        config.classify_eval_solver.index_map = Some(map);
        config.classify_eval_solver.mean_file = Some(dir.path().join("absent_mean.xml"));

        let evaluator = Evaluator::new(&config, identity_model(3));
        let mut out = Vec::new();
        assert_eq!(evaluator.eval_model(&mut out).unwrap(), None);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "start eval...\nlaunch map and mean files\nfail to locate index files, eval exit.\n"
        );
    }

    #[test]
    fn test_average_error_over_batches() {
        let evaluator = Evaluator::new(&config(4, 2), identity_model(3));
        let mut source = FixedSource {
            samples: vec![
                (vec![0.9, 0.05, 0.05], 0),
                (vec![0.1, 0.8, 0.1], 0),
                (vec![0.2, 0.2, 0.6], 2),
                (vec![0.3, 0.6, 0.1], 1),
            ],
            cursor: 0,
        };
        let eval = evaluator.build_eval_graph().unwrap();
        let mut out = Vec::new();
        let error = evaluator
            .eval_with_source(&mut out, eval, &mut source)
            .unwrap();
        assert!((error - 0.25).abs() < 1e-6);

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Evaluate error with 0.5 with test range 0..."));
        assert!(text.ends_with("Final evaluate error with 0.25\n"));
    }

    #[test]
    fn test_eval_graph_outputs_loss_and_error() {
        let evaluator = Evaluator::new(&config(1, 1), identity_model(3));
        let eval = evaluator.build_eval_graph().unwrap();
        assert_eq!(eval.data_input, "data");
        assert_eq!(
            eval.graph.output_names(),
            vec!["ce".to_string(), "pe".to_string()]
        );
        assert_eq!(eval.graph.input_names(), vec!["data".to_string(), "label".to_string()]);
    }
}
