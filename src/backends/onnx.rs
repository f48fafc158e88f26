//! ONNX Runtime backend
//!
//! Runs segmentation models through ONNX Runtime with CPU, CUDA or `CoreML` execution
//! providers. Unavailable accelerators fall back to CPU with a warning.

use crate::config::{ExecutionProvider, RemovalConfig};
use crate::error::{BgRemovalError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelInfo, ModelManager, PreprocessingConfig};
use instant::Instant;
use ndarray::Array4;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::time::Duration;

/// ONNX Runtime backend for running background removal models
#[derive(Debug)]
pub struct OnnxBackend {
    session: Option<Session>,
    model_manager: ModelManager,
    initialized: bool,
}

impl OnnxBackend {
    /// Create a new ONNX backend for the given model
    #[must_use]
    pub fn with_model_manager(model_manager: ModelManager) -> Self {
        Self {
            session: None,
            model_manager,
            initialized: false,
        }
    }

    /// Execution providers to register, in priority order
    fn select_providers(requested: ExecutionProvider) -> Vec<ExecutionProviderDispatch> {
        let cuda_available =
            OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
        let coreml_available =
            OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default())
                .unwrap_or(false);

        let mut providers = Vec::new();
        match requested {
            ExecutionProvider::Auto => {
                if cuda_available {
                    providers.push(CUDAExecutionProvider::default().build());
                }
                if coreml_available {
                    providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
                }
                if providers.is_empty() {
                    log::info!("No hardware acceleration available, using CPU");
                }
            },
            ExecutionProvider::Cuda => {
                if cuda_available {
                    providers.push(CUDAExecutionProvider::default().build());
                } else {
                    log::warn!("CUDA execution provider requested but not available, falling back to CPU");
                }
            },
            ExecutionProvider::CoreMl => {
                if coreml_available {
                    providers.push(CoreMLExecutionProvider::default().with_subgraphs(true).build());
                } else {
                    log::warn!("CoreML execution provider requested but not available, falling back to CPU");
                }
            },
            ExecutionProvider::Cpu => {},
        }
        providers
    }

    fn thread_counts(config: &RemovalConfig) -> (usize, usize) {
        let cores = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(4);

        let intra = if config.intra_threads > 0 {
            config.intra_threads
        } else {
            cores
        };
        let inter = if config.inter_threads > 0 {
            config.inter_threads
        } else {
            (cores / 4).max(1)
        };
        (intra, inter)
    }

    fn load_model(&mut self, config: &RemovalConfig) -> Result<Duration> {
        let model_load_start = Instant::now();
        let model_data = self.model_manager.load_model()?;

        let mut session_builder = Session::builder()
            .map_err(|e| BgRemovalError::inference(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| BgRemovalError::inference(format!("Failed to set optimization level: {e}")))?;

        let providers = Self::select_providers(config.execution_provider);
        let provider_count = providers.len();
        if !providers.is_empty() {
            session_builder = session_builder
                .with_execution_providers(providers)
                .map_err(|e| {
                    BgRemovalError::inference(format!("Failed to set execution providers: {e}"))
                })?;
        }

        let (intra_threads, inter_threads) = Self::thread_counts(config);
        let session = session_builder
            .with_intra_threads(intra_threads)
            .map_err(|e| BgRemovalError::inference(format!("Failed to set intra threads: {e}")))?
            .with_inter_threads(inter_threads)
            .map_err(|e| BgRemovalError::inference(format!("Failed to set inter threads: {e}")))?
            .commit_from_memory(&model_data)
            .map_err(|e| {
                BgRemovalError::model_error_with_context(
                    "load",
                    self.model_manager.model_path(),
                    &e.to_string(),
                    &["verify the file is a valid ONNX model"],
                )
            })?;

        let model_info = self.model_manager.get_info()?;
        log::debug!(
            "ONNX session ready: model={} provider={} accelerators={} threads={}/{}",
            model_info.name,
            config.execution_provider,
            provider_count,
            intra_threads,
            inter_threads
        );

        self.session = Some(session);
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "Model {} loaded in {:.0}ms",
            model_info.name,
            model_load_time.as_secs_f64() * 1000.0
        );
        Ok(model_load_time)
    }
}

impl InferenceBackend for OnnxBackend {
    fn initialize(&mut self, config: &RemovalConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }

        let model_load_time = self.load_model(config)?;
        Ok(Some(model_load_time))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        if !self.initialized {
            return Err(BgRemovalError::internal("Backend not initialized"));
        }

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BgRemovalError::internal("ONNX session not initialized"))?;

        let inference_start = Instant::now();
        let input_value = Value::from_array(input.clone()).map_err(|e| {
            BgRemovalError::processing(format!("Failed to convert input tensor: {e}"))
        })?;

        // Positional input; rembg models name their input differently
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| BgRemovalError::inference(format!("ONNX inference failed: {e}")))?;

        // u2net-family models emit several side outputs; the fused mask comes first
        let first_key = outputs
            .keys()
            .next()
            .ok_or_else(|| BgRemovalError::processing("No output tensors found"))?;
        let output_tensor = outputs
            .get(first_key)
            .ok_or_else(|| BgRemovalError::processing("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| {
                BgRemovalError::processing(format!("Failed to extract output tensor: {e}"))
            })?;

        let output_shape = output_tensor.shape().to_vec();
        let result = match output_shape.as_slice() {
            [n, c, h, w] => Array4::from_shape_vec(
                (*n, *c, *h, *w),
                output_tensor.view().to_owned().into_raw_vec_and_offset().0,
            )
            .map_err(|e| {
                BgRemovalError::processing(format!("Failed to reshape output tensor: {e}"))
            }),
            _ => Err(BgRemovalError::processing(format!(
                "Expected 4D output tensor, got {}D",
                output_shape.len()
            ))),
        };

        log::debug!(
            "ONNX inference complete: {:.2}ms",
            inference_start.elapsed().as_secs_f64() * 1000.0
        );
        result
    }

    fn input_shape(&self) -> (usize, usize, usize, usize) {
        self.model_manager
            .get_info()
            .map_or((1, 3, 320, 320), |info| info.input_shape)
    }

    fn output_shape(&self) -> (usize, usize, usize, usize) {
        self.model_manager
            .get_info()
            .map_or((1, 1, 320, 320), |info| info.output_shape)
    }

    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig> {
        self.model_manager.get_preprocessing_config()
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        self.model_manager.get_info()
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}
