//! Labelled image minibatches for evaluation

use std::fs;
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::config::CropType;
use crate::error::GraphError;
use crate::graph::DataType;
use crate::tensor::HostTensor;

/// One batch of samples with their labels
#[derive(Debug, Clone, Default)]
pub struct Minibatch {
    pub features: Vec<HostTensor>,
    pub labels: Vec<HostTensor>,
}

impl Minibatch {
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

pub trait MinibatchSource {
    /// Read the next `size` samples, wrapping around at the end of the data.
    fn next_minibatch(&mut self, size: usize) -> Result<Minibatch, GraphError>;
}

/// Image transforms applied before a sample reaches the graph
#[derive(Debug, Clone)]
pub struct ImageTransforms {
    /// Channel-first target shape `(C, H, W)`
    pub shape: [usize; 3],
    pub crop: Option<CropType>,
    pub crop_ratio: f32,
    /// Mean image in `(C, H, W)` order
    pub mean: Option<Vec<f32>>,
}

/// Reads `<path>\t<label>` map files and decodes images with `image`
pub struct ImageMinibatchSource {
    entries: Vec<(PathBuf, usize)>,
    cursor: usize,
    num_classes: usize,
    transforms: ImageTransforms,
    rng: StdRng,
}

impl ImageMinibatchSource {
    pub fn new(
        map_file: &Path,
        num_classes: usize,
        transforms: ImageTransforms,
    ) -> Result<Self, GraphError> {
        if num_classes == 0 {
            return Err(GraphError::Config {
                reason: "label tensor must hold at least one class".to_string(),
            });
        }
        if !matches!(transforms.shape[0], 1 | 3) {
            return Err(GraphError::Config {
                reason: format!("images have 1 or 3 channels, not {}", transforms.shape[0]),
            });
        }
        let entries = parse_map_file(map_file, num_classes)?;
        info!(
            map = %map_file.display(),
            samples = entries.len(),
            "opened image map"
        );
        Ok(Self {
            entries,
            cursor: 0,
            num_classes,
            transforms,
            rng: StdRng::seed_from_u64(0),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn load_features(&mut self, path: &Path) -> Result<HostTensor, GraphError> {
        let [channels, height, width] = self.transforms.shape;
        let mut img = image::open(path)?;

        if let Some(crop) = self.transforms.crop {
            img = self.crop(img, crop);
        }
        let img = img.resize_exact(width as u32, height as u32, FilterType::Triangle);

        let plane = height * width;
        let mut data = vec![0.0f32; channels * plane];
        if channels == 1 {
            for (i, v) in img.to_luma8().as_raw().iter().enumerate() {
                data[i] = *v as f32;
            }
        } else {
            // channel-first, blue green red
            let rgb = img.to_rgb8();
            for (i, px) in rgb.as_raw().chunks_exact(3).enumerate() {
                data[i] = px[2] as f32;
                data[plane + i] = px[1] as f32;
                data[2 * plane + i] = px[0] as f32;
            }
        }

        if let Some(mean) = &self.transforms.mean {
            for (v, m) in data.iter_mut().zip(mean) {
                *v -= m;
            }
        }
        Ok(HostTensor::from_data(
            data,
            vec![channels, height, width],
            DataType::Float32,
        ))
    }

    /// Square crop with side `crop_ratio * min(width, height)`.
    fn crop(&mut self, img: DynamicImage, crop: CropType) -> DynamicImage {
        let (w, h) = img.dimensions();
        let side = ((w.min(h) as f32 * self.transforms.crop_ratio).round() as u32).clamp(1, w.min(h).max(1));
        let (x, y) = match crop {
            CropType::Center => ((w - side) / 2, (h - side) / 2),
            CropType::Random => (
                self.rng.random_range(0..=w - side),
                self.rng.random_range(0..=h - side),
            ),
        };
        img.crop_imm(x, y, side, side)
    }

    fn one_hot(&self, label: usize) -> HostTensor {
        let mut data = vec![0.0f32; self.num_classes];
        data[label] = 1.0;
        HostTensor::from_data(data, vec![self.num_classes], DataType::Float32)
    }
}

impl MinibatchSource for ImageMinibatchSource {
    fn next_minibatch(&mut self, size: usize) -> Result<Minibatch, GraphError> {
        let mut batch = Minibatch::default();
        for _ in 0..size {
            let (path, label) = self.entries[self.cursor].clone();
            self.cursor = (self.cursor + 1) % self.entries.len();
            batch.features.push(self.load_features(&path)?);
            batch.labels.push(self.one_hot(label));
        }
        debug!(size, cursor = self.cursor, "read minibatch");
        Ok(batch)
    }
}

fn parse_map_file(map_file: &Path, num_classes: usize) -> Result<Vec<(PathBuf, usize)>, GraphError> {
    let contents = fs::read_to_string(map_file)?;
    let base = map_file.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut entries = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (path, label) = line
            .rsplit_once('\t')
            .or_else(|| line.rsplit_once(char::is_whitespace))
            .ok_or_else(|| GraphError::Config {
                reason: format!("map line {} has no label: `{}`", line_no + 1, line),
            })?;
        let label: usize = label.trim().parse().map_err(|_| GraphError::Config {
            reason: format!("map line {} has a non-numeric label `{}`", line_no + 1, label),
        })?;
        if label >= num_classes {
            return Err(GraphError::Config {
                reason: format!(
                    "map line {} has label {} but only {} classes",
                    line_no + 1,
                    label,
                    num_classes
                ),
            });
        }
        let mut path = PathBuf::from(path.trim());
        if path.is_relative() && !path.exists() {
            path = base.join(path);
        }
        entries.push((path, label));
    }

    if entries.is_empty() {
        return Err(GraphError::Config {
            reason: format!("map file {} lists no images", map_file.display()),
        });
    }
    Ok(entries)
}

/// Read a mean image stored as an OpenCV XML matrix and return it channel-first.
///
/// The `<data>` element holds `H * W * C` values in `(H, W, C)` order.
pub fn load_mean_file(path: &Path, shape: [usize; 3]) -> Result<Vec<f32>, GraphError> {
    let contents = fs::read_to_string(path)?;
    let start = contents.find("<data>").ok_or_else(|| GraphError::Config {
        reason: format!("mean file {} has no <data> element", path.display()),
    })? + "<data>".len();
    let end = contents[start..]
        .find("</data>")
        .map(|offset| start + offset)
        .ok_or_else(|| GraphError::Config {
            reason: format!("mean file {} has an unterminated <data> element", path.display()),
        })?;

    let values = contents[start..end]
        .split_whitespace()
        .map(|token| {
            token.parse::<f32>().map_err(|_| GraphError::Config {
                reason: format!("mean file value `{}` is not a number", token),
            })
        })
        .collect::<Result<Vec<f32>, GraphError>>()?;

    let [channels, height, width] = shape;
    if values.len() != channels * height * width {
        return Err(GraphError::Config {
            reason: format!(
                "mean file holds {} values for a {}x{}x{} image",
                values.len(),
                channels,
                height,
                width
            ),
        });
    }

    let mut chw = vec![0.0f32; values.len()];
    for h in 0..height {
        for w in 0..width {
            for c in 0..channels {
                chw[(c * height + h) * width + w] = values[(h * width + w) * channels + c];
            }
        }
    }
    Ok(chw)
}
