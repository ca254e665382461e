use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Everything a conversion run is configured with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub model_solver: ModelSolver,
    #[serde(default)]
    pub classify_eval_solver: ClassifyEvalSolver,
}

impl GlobalConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        let config: GlobalConfig = serde_json::from_str(json)?;
        config.classify_eval_solver.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSolver {
    /// Input shapes replacing the model's declared data providers
    #[serde(default)]
    pub cntk_tensor: Option<BTreeMap<String, Vec<u32>>>,
    /// Where the converted graph is saved
    #[serde(default)]
    pub cntk_model_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropType {
    Center,
    Random,
}

fn default_crop_ratio() -> f32 {
    1.0
}

fn default_top_n() -> u32 {
    1
}

fn default_batch_size() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyEvalSolver {
    #[serde(default)]
    pub crop_type: Option<CropType>,
    /// Side of the crop relative to the shorter image side
    #[serde(default = "default_crop_ratio")]
    pub crop_ratio: f32,
    /// Map file listing `<path>\t<label>` per line
    #[serde(default)]
    pub index_map: Option<PathBuf>,
    #[serde(default)]
    pub mean_file: Option<PathBuf>,
    #[serde(default)]
    pub label_tensor: Vec<u32>,
    #[serde(default = "default_top_n")]
    pub top_n: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub dataset_size: usize,
}

impl Default for ClassifyEvalSolver {
    fn default() -> Self {
        Self {
            crop_type: None,
            crop_ratio: default_crop_ratio(),
            index_map: None,
            mean_file: None,
            label_tensor: Vec::new(),
            top_n: default_top_n(),
            batch_size: default_batch_size(),
            dataset_size: 0,
        }
    }
}

impl ClassifyEvalSolver {
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.batch_size == 0 {
            return Err(GraphError::Config {
                reason: "batch_size must be positive".to_string(),
            });
        }
        if !(self.crop_ratio > 0.0 && self.crop_ratio <= 1.0) {
            return Err(GraphError::Config {
                reason: format!("crop_ratio {} must lie in (0, 1]", self.crop_ratio),
            });
        }
        if self.top_n == 0 {
            return Err(GraphError::Config {
                reason: "top_n must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = GlobalConfig::from_json("{}").unwrap();
        assert!(config.model_solver.cntk_tensor.is_none());
        assert_eq!(config.classify_eval_solver.top_n, 1);
        assert_eq!(config.classify_eval_solver.batch_size, 1);
        assert!(config.classify_eval_solver.index_map.is_none());
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "model_solver": {
                "cntk_tensor": {"data": [3, 224, 224]},
                "cntk_model_path": "out/model.json"
            },
            "classify_eval_solver": {
                "crop_type": "center",
                "crop_ratio": 0.875,
                "index_map": "val_map.txt",
                "mean_file": "mean.xml",
                "label_tensor": [1000],
                "top_n": 5,
                "batch_size": 50,
                "dataset_size": 50000
            }
        }"#;
        let config = GlobalConfig::from_json(json).unwrap();
        let inputs = config.model_solver.cntk_tensor.unwrap();
        assert_eq!(inputs["data"], vec![3, 224, 224]);
        let eval = config.classify_eval_solver;
        assert_eq!(eval.crop_type, Some(CropType::Center));
        assert_eq!(eval.label_tensor, vec![1000]);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let json = r#"{"classify_eval_solver": {"batch_size": 0}}"#;
        assert!(matches!(
            GlobalConfig::from_json(json),
            Err(GraphError::Config { .. })
        ));
    }
}
