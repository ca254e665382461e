//! Uni-model conversion integration tests
//!
//! These tests load uni-models from JSON, assemble them into native graphs,
//! save and reload the result and run it on the CPU executor.

use std::collections::HashMap;
use std::fs;

use approx::assert_abs_diff_eq;
use unigraph::{
    load_graph_from_path, CpuExecutor, DataType, GlobalConfig, GraphAssembler, GraphError,
    HostTensor, OperandKind, UniModel,
};

/// conv(1 -> 2, 2x2, bias) -> relu -> dense(2) with every weight pretrained
const SMALL_MODEL: &str = r#"{
    "sorted_layers": ["conv", "relu", "fc"],
    "data_providers": [{"op_name": "data", "tensor": [1, 3, 3]}],
    "layers": {
        "conv": {
            "op_name": "conv",
            "op_type": "convolution",
            "inputs": ["data"],
            "parameters": {
                "type": "convolution",
                "output": 2,
                "kernel": [2, 2],
                "stride": [1, 1],
                "auto_pad": false,
                "need_bias": true
            },
            "parameter_tensor": [
                {"data": [1, 0, 0, 1, -1, 0, 0, -1]},
                {"data": [0.5, 0.0]}
            ]
        },
        "relu": {
            "op_name": "relu",
            "op_type": "relu",
            "inputs": ["conv"]
        },
        "fc": {
            "op_name": "fc",
            "op_type": "dense",
            "inputs": ["relu"],
            "parameters": {"type": "dense", "num_output": 2, "transpose": true},
            "parameter_tensor": [
                {"data": [1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1]},
                {"data": [0.0, 1.0]}
            ]
        }
    }
}"#;

fn run(graph: unigraph::GraphInfo, data: Vec<f32>) -> Vec<HostTensor> {
    let executor = CpuExecutor::new(graph).unwrap();
    let mut inputs = HashMap::new();
    inputs.insert(
        "data".to_string(),
        HostTensor::from_data(data, vec![1, 3, 3], DataType::Float32),
    );
    executor.compute(&inputs).unwrap()
}

#[test]
fn test_convert_save_load_and_execute() {
    let dir = tempfile::tempdir().unwrap();
    let model_path = dir.path().join("model.json");
    fs::write(&model_path, SMALL_MODEL).unwrap();
    let export_path = dir.path().join("out").join("graph.json");

    let model = UniModel::from_path(&model_path).unwrap();
    let mut config = GlobalConfig::default();
    config.model_solver.cntk_model_path = Some(export_path.clone());

    let assembler = GraphAssembler::from_model(&model, &config).unwrap();
    assert_eq!(assembler.export_model().unwrap(), export_path);

    let original = assembler.into_model().unwrap();
    let restored = load_graph_from_path(&export_path).unwrap();
    assert_eq!(restored.name.as_deref(), Some("outputs"));
    assert_eq!(restored.output_names(), vec!["fc".to_string()]);
    assert_eq!(restored.operations.len(), original.operations.len());
    assert_eq!(restored.parameter_count(), original.parameter_count());

    let data: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    let out = run(restored, data);
    assert_eq!(out[0].shape, vec![2]);
    // conv map 0 is x[i,j] + x[i+1,j+1] + 0.5, map 1 is negative and clipped
    // by relu; fc output 0 sums map 0, output 1 sums map 1 plus 1.
    assert_abs_diff_eq!(out[0].data[0], 6.5 + 8.5 + 12.5 + 14.5, epsilon = 1e-5);
    assert_abs_diff_eq!(out[0].data[1], 1.0, epsilon = 1e-5);
}

#[test]
fn test_parameters_named_after_layers() {
    let model: UniModel = serde_json::from_str(SMALL_MODEL).unwrap();
    let assembler = GraphAssembler::from_model(&model, &GlobalConfig::default()).unwrap();
    let graph = assembler.model().unwrap();
    for name in ["conv.W", "conv.b", "fc.sc", "fc.b"] {
        let id = graph.operand_id_by_name(name).unwrap();
        assert_eq!(graph.operand(id).unwrap().kind, OperandKind::Parameter);
    }
    let fc_sc = graph.operand_id_by_name("fc.sc").unwrap();
    assert_eq!(
        graph.operand(fc_sc).unwrap().descriptor.shape,
        vec![2, 2, 2, 2]
    );
    assert_eq!(
        assembler.functions().names(),
        &["data".to_string(), "conv".to_string(), "relu".to_string(), "fc".to_string()]
    );
}

#[test]
fn test_unsupported_parameters_abort_conversion() {
    let broken = SMALL_MODEL.replace(
        r#""parameters": {"type": "dense", "num_output": 2, "transpose": true}"#,
        r#""parameters": {"type": "lrn", "k": 1, "kernel_size": 2, "alpha": 1, "beta": 1}"#,
    );
    let model: UniModel = serde_json::from_str(&broken).unwrap();
    let err = GraphAssembler::from_model(&model, &GlobalConfig::default());
    assert!(matches!(err, Err(GraphError::InvalidParameters { .. })));
}

#[test]
fn test_export_requires_model_path() {
    let model: UniModel = serde_json::from_str(SMALL_MODEL).unwrap();
    let assembler = GraphAssembler::from_model(&model, &GlobalConfig::default()).unwrap();
    assert!(matches!(
        assembler.export_model(),
        Err(GraphError::Config { .. })
    ));
}

#[test]
fn test_untrained_layers_still_execute() {
    let json = r#"{
        "sorted_layers": ["conv", "pool", "bn", "fc", "prob"],
        "data_providers": [{"op_name": "data", "tensor": [1, 3, 3]}],
        "layers": {
            "conv": {"op_name": "conv", "op_type": "convolution", "inputs": ["data"],
                     "parameters": {"type": "convolution", "output": 4, "kernel": [3, 3],
                                    "stride": [1, 1], "auto_pad": true, "need_bias": true}},
            "pool": {"op_name": "pool", "op_type": "pooling", "inputs": ["conv"],
                     "parameters": {"type": "pooling", "kernel": [2, 2], "stride": [2, 2],
                                    "pooling_type": "average"}},
            "bn": {"op_name": "bn", "op_type": "batch_normalization", "inputs": ["pool"],
                   "parameters": {"type": "batch_normalization", "epsilon": 1e-5}},
            "fc": {"op_name": "fc", "op_type": "dense", "inputs": ["bn"],
                   "parameters": {"type": "dense", "num_output": 3}},
            "prob": {"op_name": "prob", "op_type": "softmax", "inputs": ["fc"]}
        }
    }"#;
    let model: UniModel = serde_json::from_str(json).unwrap();
    let assembler = GraphAssembler::from_model(&model, &GlobalConfig::default()).unwrap();
    let graph = assembler.into_model().unwrap();
    let out = run(graph, vec![0.5; 9]);
    assert_eq!(out[0].shape, vec![3]);
    assert_abs_diff_eq!(out[0].data.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
}
