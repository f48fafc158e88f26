//! Model catalog and model resolution
//!
//! A model is either one of the named segmentation models that can be downloaded into the
//! cache, or an external ONNX file supplied by the operator. Either way it resolves into a
//! [`ModelManager`] that knows where the weights live and how inputs must be preprocessed.

use crate::cache::ModelCache;
use crate::error::{BgRemovalError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Model used when nothing else is configured
pub const DEFAULT_MODEL: &str = "u2net";

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Preprocessing parameters a model expects for its input tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// Input width and height in pixels
    pub target_size: [u32; 2],
    /// Per-channel mean subtracted after scaling to 0..1
    pub normalization_mean: [f32; 3],
    /// Per-channel standard deviation divided after mean subtraction
    pub normalization_std: [f32; 3],
}

impl PreprocessingConfig {
    /// Square input with `ImageNet` normalisation
    #[must_use]
    pub const fn imagenet(size: u32) -> Self {
        Self {
            target_size: [size, size],
            normalization_mean: IMAGENET_MEAN,
            normalization_std: IMAGENET_STD,
        }
    }

    /// Check the parameters can produce a usable tensor
    ///
    /// # Errors
    /// - Zero target size
    /// - Non-positive or non-finite standard deviation
    pub fn validate(&self) -> Result<()> {
        if self.target_size.contains(&0) {
            return Err(BgRemovalError::invalid_config(format!(
                "Model input size must be positive, got {}x{}",
                self.target_size[0], self.target_size[1]
            )));
        }
        if self
            .normalization_std
            .iter()
            .any(|std| !std.is_finite() || *std <= 0.0)
        {
            return Err(BgRemovalError::invalid_config(format!(
                "Normalization std must be positive, got {:?}",
                self.normalization_std
            )));
        }
        Ok(())
    }
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self::imagenet(320)
    }
}

/// A named model that can be fetched into the cache
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KnownModel {
    pub name: &'static str,
    pub url: &'static str,
    /// Expected SHA-256 of the ONNX file, when pinned
    pub sha256: Option<&'static str>,
    pub input_size: u32,
    pub normalization_mean: [f32; 3],
    pub normalization_std: [f32; 3],
    pub description: &'static str,
}

impl KnownModel {
    /// Preprocessing parameters for this model
    #[must_use]
    pub fn preprocessing(&self) -> PreprocessingConfig {
        PreprocessingConfig {
            target_size: [self.input_size, self.input_size],
            normalization_mean: self.normalization_mean,
            normalization_std: self.normalization_std,
        }
    }

    /// File name of the model inside the cache
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.onnx", self.name)
    }
}

/// Segmentation models published alongside the `rembg` project
pub const MODEL_CATALOG: &[KnownModel] = &[
    KnownModel {
        name: "u2net",
        url: "https://github.com/danielgatis/rembg/releases/download/v0.0.0/u2net.onnx",
        sha256: None,
        input_size: 320,
        normalization_mean: IMAGENET_MEAN,
        normalization_std: IMAGENET_STD,
        description: "General purpose salient object segmentation (176 MB)",
    },
    KnownModel {
        name: "u2netp",
        url: "https://github.com/danielgatis/rembg/releases/download/v0.0.0/u2netp.onnx",
        sha256: None,
        input_size: 320,
        normalization_mean: IMAGENET_MEAN,
        normalization_std: IMAGENET_STD,
        description: "Lightweight u2net (4.7 MB)",
    },
    KnownModel {
        name: "silueta",
        url: "https://github.com/danielgatis/rembg/releases/download/v0.0.0/silueta.onnx",
        sha256: None,
        input_size: 320,
        normalization_mean: IMAGENET_MEAN,
        normalization_std: IMAGENET_STD,
        description: "Pruned u2net with comparable quality (43 MB)",
    },
    KnownModel {
        name: "isnet-general-use",
        url: "https://github.com/danielgatis/rembg/releases/download/v0.0.0/isnet-general-use.onnx",
        sha256: None,
        input_size: 1024,
        normalization_mean: [0.5, 0.5, 0.5],
        normalization_std: [1.0, 1.0, 1.0],
        description: "IS-Net trained for general use (176 MB)",
    },
];

/// Look up a catalog entry by name (case-insensitive)
#[must_use]
pub fn find_known_model(name: &str) -> Option<&'static KnownModel> {
    MODEL_CATALOG
        .iter()
        .find(|model| model.name.eq_ignore_ascii_case(name))
}

/// Model source specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelSource {
    /// External model from filesystem path
    External(PathBuf),
    /// Catalog model stored in the cache, downloaded on first use
    Downloaded(String),
}

impl ModelSource {
    /// Get a display name for tracing and logging
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            ModelSource::External(path) => {
                format!(
                    "external:{}",
                    path.file_name().unwrap_or_default().to_string_lossy()
                )
            },
            ModelSource::Downloaded(name) => name.clone(),
        }
    }
}

/// Complete model specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub source: ModelSource,
}

impl Default for ModelSpec {
    fn default() -> Self {
        Self {
            source: ModelSource::Downloaded(DEFAULT_MODEL.to_string()),
        }
    }
}

/// Parses model arguments from configuration into a [`ModelSpec`]
pub struct ModelSpecParser;

impl ModelSpecParser {
    /// Interpret a model argument
    ///
    /// Existing paths, anything containing a path separator and names ending in `.onnx`
    /// are external models. Everything else must name a catalog model.
    ///
    /// # Errors
    /// - Empty argument
    /// - Name that is neither a path nor a catalog model
    pub fn parse(value: &str) -> Result<ModelSpec> {
        let value = value.trim();
        if value.is_empty() {
            return Err(BgRemovalError::invalid_config("Model name must not be empty"));
        }

        let path = Path::new(value);
        let looks_like_path = path.exists()
            || value.contains('/')
            || value.contains('\\')
            || path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));

        if looks_like_path {
            return Ok(ModelSpec {
                source: ModelSource::External(path.to_path_buf()),
            });
        }

        match find_known_model(value) {
            Some(model) => Ok(ModelSpec {
                source: ModelSource::Downloaded(model.name.to_string()),
            }),
            None => {
                let known: Vec<&str> = MODEL_CATALOG.iter().map(|model| model.name).collect();
                Err(BgRemovalError::invalid_config(format!(
                    "Unknown model '{value}'. Available models: {}",
                    known.join(", ")
                )))
            },
        }
    }
}

/// Model information and metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub precision: String,
    pub size_bytes: usize,
    pub input_shape: (usize, usize, usize, usize), // NCHW format
    pub output_shape: (usize, usize, usize, usize),
}

/// Optional JSON overrides next to an external model
///
/// ```json
/// { "name": "my-model", "input_size": 1024, "mean": [0.5, 0.5, 0.5], "std": [1.0, 1.0, 1.0] }
/// ```
#[derive(Debug, Default, Deserialize)]
struct ExternalModelConfig {
    name: Option<String>,
    input_size: Option<u32>,
    mean: Option<[f32; 3]>,
    std: Option<[f32; 3]>,
}

/// Resolved model: where the weights are and how to feed them
#[derive(Debug, Clone)]
pub struct ModelManager {
    model_path: PathBuf,
    info: ModelInfo,
    preprocessing: PreprocessingConfig,
}

impl ModelManager {
    /// Resolve a model specification
    ///
    /// Catalog models must already be present in `cache`; downloading is the caller's job.
    ///
    /// # Errors
    /// - External path missing, unreadable or without `model.onnx`
    /// - Invalid sidecar JSON
    /// - Catalog model unknown or not cached
    pub fn from_spec(spec: &ModelSpec, cache: &ModelCache) -> Result<Self> {
        match &spec.source {
            ModelSource::External(path) => Self::with_external_model(path),
            ModelSource::Downloaded(name) => Self::with_downloaded_model(name, cache),
        }
    }

    /// Create model manager for an external ONNX file or model directory
    ///
    /// # Errors
    /// - Path does not exist
    /// - Directory without `model.onnx`
    /// - Sidecar JSON that cannot be parsed or yields invalid preprocessing
    pub fn with_external_model<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BgRemovalError::model_error_with_context(
                "load",
                path,
                "path does not exist",
                &["check BGREMOVER_MODEL", "use a catalog model name such as u2net"],
            ));
        }

        let (model_path, sidecar_path) = if path.is_dir() {
            (path.join("model.onnx"), path.join("model.json"))
        } else {
            (path.to_path_buf(), path.with_extension("json"))
        };

        if !model_path.is_file() {
            return Err(BgRemovalError::model_error_with_context(
                "load",
                &model_path,
                "model file not found",
                &["model directories must contain model.onnx"],
            ));
        }

        let stem = model_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "external".to_string());

        let overrides = if sidecar_path.is_file() {
            let raw = fs::read_to_string(&sidecar_path).map_err(|e| {
                BgRemovalError::file_io_error("read model config", &sidecar_path, &e)
            })?;
            serde_json::from_str::<ExternalModelConfig>(&raw).map_err(|e| {
                BgRemovalError::invalid_config(format!(
                    "Invalid model config '{}': {e}",
                    sidecar_path.display()
                ))
            })?
        } else {
            ExternalModelConfig::default()
        };

        let mut preprocessing = find_known_model(&stem)
            .map(KnownModel::preprocessing)
            .unwrap_or_default();
        if let Some(size) = overrides.input_size {
            preprocessing.target_size = [size, size];
        }
        if let Some(mean) = overrides.mean {
            preprocessing.normalization_mean = mean;
        }
        if let Some(std) = overrides.std {
            preprocessing.normalization_std = std;
        }
        preprocessing.validate()?;

        let name = overrides.name.unwrap_or(stem);
        Self::new(model_path, name, preprocessing)
    }

    /// Create model manager for a catalog model stored in the cache
    ///
    /// # Errors
    /// - Model name not in the catalog
    /// - Model file not yet downloaded
    pub fn with_downloaded_model(name: &str, cache: &ModelCache) -> Result<Self> {
        let known = find_known_model(name).ok_or_else(|| {
            BgRemovalError::invalid_config(format!("Unknown model '{name}'"))
        })?;

        if !cache.is_model_cached(known.name) {
            return Err(BgRemovalError::model_error_with_context(
                "load",
                cache.get_model_path(known.name),
                "model is not cached",
                &["run with --only-download", "allow network access at startup"],
            ));
        }

        Self::new(
            cache.get_model_path(known.name),
            known.name.to_string(),
            known.preprocessing(),
        )
    }

    fn new(model_path: PathBuf, name: String, preprocessing: PreprocessingConfig) -> Result<Self> {
        let size_bytes = fs::metadata(&model_path)
            .map_err(|e| BgRemovalError::file_io_error("inspect model file", &model_path, &e))?
            .len() as usize;

        let [width, height] = preprocessing.target_size;
        let (width, height) = (width as usize, height as usize);
        let info = ModelInfo {
            name,
            precision: "fp32".to_string(),
            size_bytes,
            input_shape: (1, 3, height, width),
            output_shape: (1, 1, height, width),
        };

        Ok(Self {
            model_path,
            info,
            preprocessing,
        })
    }

    /// Load model data
    ///
    /// # Errors
    /// - Model file removed or unreadable since resolution
    pub fn load_model(&self) -> Result<Vec<u8>> {
        fs::read(&self.model_path)
            .map_err(|e| BgRemovalError::file_io_error("read model file", &self.model_path, &e))
    }

    /// Get model information
    ///
    /// # Errors
    /// Currently infallible; kept fallible for backends that probe the file lazily
    pub fn get_info(&self) -> Result<ModelInfo> {
        Ok(self.info.clone())
    }

    /// Get preprocessing configuration
    ///
    /// # Errors
    /// Currently infallible; kept fallible for backends that probe the file lazily
    pub fn get_preprocessing_config(&self) -> Result<PreprocessingConfig> {
        Ok(self.preprocessing.clone())
    }

    /// Get the model file path
    #[must_use]
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}
