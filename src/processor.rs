//! Background removal processor
//!
//! `BackgroundRemovalProcessor` owns one inference backend and runs the pipeline for a
//! decoded image: letterbox preprocessing, inference, mask reconstruction at the original
//! resolution and alpha application.

use crate::{
    backends::MockBackend,
    cache::ModelCache,
    config::{ExecutionProvider, RemovalConfig},
    error::{BgRemovalError, Result},
    inference::InferenceBackend,
    models::{ModelManager, ModelSpec},
    types::{ProcessingTimings, RemovalResult, SegmentationMask},
    utils::{ImagePreprocessor, Letterbox},
};
use image::{DynamicImage, GenericImageView, RgbaImage};
use instant::Instant;
use log::{debug, info};
use ndarray::Array4;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{instrument, span, Level};

/// Backend type enumeration for runtime selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendType {
    /// ONNX Runtime backend (supports GPU acceleration)
    Onnx,
    /// Tract backend (pure Rust, no external dependencies)
    Tract,
    /// Deterministic edge-detection backend, no model file
    Mock,
}

impl BackendType {
    /// Whether this backend needs model weights
    #[must_use]
    pub fn requires_model(self) -> bool {
        !matches!(self, Self::Mock)
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::Tract => write!(f, "tract"),
            Self::Mock => write!(f, "mock"),
        }
    }
}

/// Factory trait for creating inference backends
pub trait BackendFactory: Send + Sync {
    /// Create a backend instance of the specified type
    ///
    /// `model_manager` is `None` for backends that do not load weights.
    ///
    /// # Errors
    /// - Backend type not compiled in
    /// - Missing model for a backend that needs one
    fn create_backend(
        &self,
        backend_type: BackendType,
        model_manager: Option<ModelManager>,
    ) -> Result<Box<dyn InferenceBackend>>;

    /// List available backend types
    fn available_backends(&self) -> Vec<BackendType>;
}

/// Backend factory for the backends compiled into this build
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl DefaultBackendFactory {
    #[allow(dead_code)]
    fn require_model(
        backend_type: BackendType,
        model_manager: Option<ModelManager>,
    ) -> Result<ModelManager> {
        model_manager.ok_or_else(|| {
            BgRemovalError::invalid_config(format!("The {backend_type} backend requires a model"))
        })
    }
}

impl BackendFactory for DefaultBackendFactory {
    fn create_backend(
        &self,
        backend_type: BackendType,
        model_manager: Option<ModelManager>,
    ) -> Result<Box<dyn InferenceBackend>> {
        match backend_type {
            #[cfg(feature = "onnx")]
            BackendType::Onnx => Ok(Box::new(crate::backends::OnnxBackend::with_model_manager(
                Self::require_model(backend_type, model_manager)?,
            ))),
            #[cfg(feature = "tract")]
            BackendType::Tract => Ok(Box::new(crate::backends::TractBackend::with_model_manager(
                Self::require_model(backend_type, model_manager)?,
            ))),
            BackendType::Mock => Ok(Box::new(MockBackend::new())),
            #[allow(unreachable_patterns)]
            other => Err(BgRemovalError::invalid_config(format!(
                "The {other} backend is not compiled into this build"
            ))),
        }
    }

    fn available_backends(&self) -> Vec<BackendType> {
        let mut backends = Vec::new();
        #[cfg(feature = "onnx")]
        backends.push(BackendType::Onnx);
        #[cfg(feature = "tract")]
        backends.push(BackendType::Tract);
        backends.push(BackendType::Mock);
        backends
    }
}

/// Configuration for the background removal processor
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Model specification
    pub model_spec: ModelSpec,
    /// Backend type to use for inference
    pub backend_type: BackendType,
    /// Execution provider for the backend
    pub execution_provider: ExecutionProvider,
    /// Enable debug mode
    pub debug: bool,
    /// Number of intra-op threads (0 = auto)
    pub intra_threads: usize,
    /// Number of inter-op threads (0 = auto)
    pub inter_threads: usize,
    /// Model cache root; `None` uses the default location
    pub cache_dir: Option<PathBuf>,
}

impl ProcessorConfig {
    /// Create a new processor configuration builder
    #[must_use]
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder::new()
    }

    /// Backend-facing subset of this configuration
    #[must_use]
    pub fn to_removal_config(&self) -> RemovalConfig {
        RemovalConfig {
            execution_provider: self.execution_provider,
            debug: self.debug,
            intra_threads: self.intra_threads,
            inter_threads: self.inter_threads,
            model_spec: self.model_spec.clone(),
        }
    }

    /// Open the model cache this configuration points at
    ///
    /// # Errors
    /// - Cache directory cannot be determined or created
    pub fn model_cache(&self) -> Result<ModelCache> {
        match &self.cache_dir {
            Some(dir) => ModelCache::with_dir(dir),
            None => ModelCache::new(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            model_spec: ModelSpec::default(),
            backend_type: BackendType::Onnx,
            execution_provider: ExecutionProvider::Auto,
            debug: false,
            intra_threads: 0,
            inter_threads: 0,
            cache_dir: None,
        }
    }
}

/// Builder for `ProcessorConfig`
#[derive(Debug, Default)]
pub struct ProcessorConfigBuilder {
    config: ProcessorConfig,
}

impl ProcessorConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn model_spec(mut self, model_spec: ModelSpec) -> Self {
        self.config.model_spec = model_spec;
        self
    }

    #[must_use]
    pub fn backend_type(mut self, backend_type: BackendType) -> Self {
        self.config.backend_type = backend_type;
        self
    }

    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    #[must_use]
    pub fn intra_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self
    }

    #[must_use]
    pub fn inter_threads(mut self, threads: usize) -> Self {
        self.config.inter_threads = threads;
        self
    }

    #[must_use]
    pub fn cache_dir(mut self, cache_dir: Option<PathBuf>) -> Self {
        self.config.cache_dir = cache_dir;
        self
    }

    /// Build the processor configuration
    ///
    /// # Errors
    /// - Execution provider not supported by the selected backend
    pub fn build(self) -> Result<ProcessorConfig> {
        let provider = self.config.execution_provider;
        if self.config.backend_type != BackendType::Onnx
            && !matches!(provider, ExecutionProvider::Cpu | ExecutionProvider::Auto)
        {
            return Err(BgRemovalError::invalid_config(format!(
                "Execution provider '{provider}' is only available with the onnx backend"
            )));
        }

        Ok(self.config)
    }
}

/// Background removal processor bound to a single model
pub struct BackgroundRemovalProcessor {
    config: ProcessorConfig,
    backend_factory: Arc<dyn BackendFactory>,
    backend: Option<Box<dyn InferenceBackend>>,
    model_name: String,
    model_load_ms: Option<u64>,
}

impl std::fmt::Debug for BackgroundRemovalProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundRemovalProcessor")
            .field("config", &self.config)
            .field("model_name", &self.model_name)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl BackgroundRemovalProcessor {
    /// Create a new processor with the default backend factory
    #[must_use]
    pub fn new(config: ProcessorConfig) -> Self {
        Self::with_factory(config, Arc::new(DefaultBackendFactory))
    }

    /// Create a new processor with a custom backend factory
    #[must_use]
    pub fn with_factory(config: ProcessorConfig, backend_factory: Arc<dyn BackendFactory>) -> Self {
        let model_name = if config.backend_type.requires_model() {
            config.model_spec.source.display_name()
        } else {
            "mock".to_string()
        };

        Self {
            config,
            backend_factory,
            backend: None,
            model_name,
            model_load_ms: None,
        }
    }

    /// Resolve the model and load it into the backend
    ///
    /// Catalog models must already be in the cache.
    ///
    /// # Errors
    /// - Model resolution failures
    /// - Backend creation or initialization errors
    pub fn initialize(&mut self) -> Result<()> {
        if self.backend.is_some() {
            return Ok(());
        }

        info!(
            "Initializing {} backend with model {}",
            self.config.backend_type, self.model_name
        );
        debug!("Execution provider: {}", self.config.execution_provider);

        let model_manager = if self.config.backend_type.requires_model() {
            let cache = self.config.model_cache()?;
            Some(ModelManager::from_spec(&self.config.model_spec, &cache)?)
        } else {
            None
        };

        let mut backend = self
            .backend_factory
            .create_backend(self.config.backend_type, model_manager)?;
        let load_time = backend.initialize(&self.config.to_removal_config())?;

        if let Ok(info) = backend.get_model_info() {
            self.model_name = info.name;
        }
        self.model_load_ms = load_time.map(|elapsed| elapsed.as_millis() as u64);
        self.backend = Some(backend);

        info!("Background removal processor ready ({})", self.model_name);
        Ok(())
    }

    /// Remove the background of a decoded image
    ///
    /// The result has the same width and height as `image`.
    ///
    /// # Errors
    /// - Initialization failures
    /// - Preprocessing, inference or mask errors
    #[instrument(
        skip(self, image),
        fields(
            backend = %self.config.backend_type,
            model = %self.model_name,
            dimensions = %format!("{}x{}", image.width(), image.height())
        )
    )]
    pub fn process_image(&mut self, image: &DynamicImage) -> Result<RemovalResult> {
        self.initialize()?;

        let total_start = Instant::now();
        let original_dimensions = image.dimensions();
        let mut timings = ProcessingTimings {
            model_load_ms: self.model_load_ms.take().unwrap_or(0),
            ..ProcessingTimings::default()
        };

        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| BgRemovalError::processing("Backend not initialized"))?;

        let prepared = {
            let _span = span!(Level::DEBUG, "preprocessing").entered();
            let start = Instant::now();
            let config = backend.get_preprocessing_config()?;
            let prepared = ImagePreprocessor::preprocess_for_inference(image, &config)?;
            timings.preprocessing_ms = start.elapsed().as_millis() as u64;
            prepared
        };

        let output_tensor = {
            let _span = span!(Level::DEBUG, "inference").entered();
            let start = Instant::now();
            let output = backend.infer(&prepared.tensor)?;
            timings.inference_ms = start.elapsed().as_millis() as u64;
            output
        };

        let (mask, result_image) = {
            let _span = span!(Level::DEBUG, "background_removal").entered();
            let start = Instant::now();
            let (_, _, canvas_height, canvas_width) = prepared.tensor.dim();
            let mask = Self::tensor_to_mask(
                &output_tensor,
                original_dimensions,
                &prepared.letterbox,
                (canvas_width as u32, canvas_height as u32),
            )?;
            let result_image = Self::apply_background_removal(image, &mask);
            timings.postprocessing_ms = start.elapsed().as_millis() as u64;
            (mask, result_image)
        };

        timings.total_ms = total_start.elapsed().as_millis() as u64;
        debug!("Processed {}x{} image: {}", original_dimensions.0, original_dimensions.1, timings.summary());

        Ok(RemovalResult::new(
            DynamicImage::ImageRgba8(result_image),
            mask,
            original_dimensions,
            timings,
        ))
    }

    /// Get the current configuration
    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Name of the loaded model (or the configured one before loading)
    #[must_use]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Check if the processor is initialized
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    /// Get available backends from the factory
    #[must_use]
    pub fn available_backends(&self) -> Vec<BackendType> {
        self.backend_factory.available_backends()
    }

    /// Map the model output back onto the original image, interpolating bilinearly
    ///
    /// Predictions are min-max normalised before quantising to 0..=255, so the strongest
    /// response is always fully opaque. A constant prediction is only clamped.
    fn tensor_to_mask(
        tensor: &Array4<f32>,
        original_dimensions: (u32, u32),
        letterbox: &Letterbox,
        canvas_dimensions: (u32, u32),
    ) -> Result<SegmentationMask> {
        let (batch, channels, mask_height, mask_width) = tensor.dim();
        if batch != 1 || channels != 1 || mask_height == 0 || mask_width == 0 {
            return Err(BgRemovalError::processing(format!(
                "Invalid output tensor shape: {:?}",
                tensor.shape()
            )));
        }

        let (min, max) = tensor
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        let range = max - min;
        let normalise = |value: f32| {
            if range > 1e-6 {
                (value - min) / range
            } else {
                value.clamp(0.0, 1.0)
            }
        };

        // Output may be coarser or finer than the canvas the input was drawn on
        let x_factor = mask_width as f32 / canvas_dimensions.0.max(1) as f32;
        let y_factor = mask_height as f32 / canvas_dimensions.1.max(1) as f32;
        let sample = |x: usize, y: usize| tensor.get([0, 0, y, x]).copied().unwrap_or(0.0);

        let (orig_width, orig_height) = original_dimensions;
        let mut mask_data = Vec::with_capacity(orig_width as usize * orig_height as usize);
        for y in 0..orig_height {
            for x in 0..orig_width {
                let (canvas_x, canvas_y) = letterbox.map_to_canvas(x, y);
                let tensor_x = ((canvas_x + 0.5) * x_factor - 0.5).clamp(0.0, (mask_width - 1) as f32);
                let tensor_y =
                    ((canvas_y + 0.5) * y_factor - 0.5).clamp(0.0, (mask_height - 1) as f32);

                // Bilinear between the four surrounding outputs
                let (x0, y0) = (tensor_x.floor() as usize, tensor_y.floor() as usize);
                let (x1, y1) = ((x0 + 1).min(mask_width - 1), (y0 + 1).min(mask_height - 1));
                let (fx, fy) = (tensor_x - x0 as f32, tensor_y - y0 as f32);
                let top = sample(x0, y0) * (1.0 - fx) + sample(x1, y0) * fx;
                let bottom = sample(x0, y1) * (1.0 - fx) + sample(x1, y1) * fx;
                let value = top * (1.0 - fy) + bottom * fy;

                mask_data.push((normalise(value) * 255.0).round() as u8);
            }
        }

        Ok(SegmentationMask::new(mask_data, original_dimensions))
    }

    /// Keep foreground pixels with the mask as alpha; background becomes transparent black
    fn apply_background_removal(image: &DynamicImage, mask: &SegmentationMask) -> RgbaImage {
        let mut result = image.to_rgba8();
        for (pixel, alpha) in result.pixels_mut().zip(mask.data.iter().copied()) {
            if alpha > 0 {
                pixel.0[3] = alpha;
            } else {
                pixel.0 = [0, 0, 0, 0];
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelSource;
    use image::{ImageBuffer, Rgb};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mock_config() -> ProcessorConfig {
        ProcessorConfig::builder()
            .backend_type(BackendType::Mock)
            .execution_provider(ExecutionProvider::Cpu)
            .build()
            .unwrap()
    }

    #[test]
    fn test_processor_config_builder_chain() {
        let config = ProcessorConfigBuilder::new()
            .model_spec(ModelSpec {
                source: ModelSource::Downloaded("u2netp".to_string()),
            })
            .backend_type(BackendType::Tract)
            .execution_provider(ExecutionProvider::Cpu)
            .intra_threads(2)
            .debug(true)
            .build()
            .unwrap();

        assert_eq!(config.backend_type, BackendType::Tract);
        assert!(config.debug);
        let removal_config = config.to_removal_config();
        assert_eq!(removal_config.intra_threads, 2);
        assert_eq!(removal_config.execution_provider, ExecutionProvider::Cpu);
    }

    #[test]
    fn test_processor_config_rejects_gpu_without_onnx() {
        let result = ProcessorConfig::builder()
            .backend_type(BackendType::Tract)
            .execution_provider(ExecutionProvider::Cuda)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_default_factory_lists_mock() {
        let factory = DefaultBackendFactory;
        assert!(factory.available_backends().contains(&BackendType::Mock));
        assert!(factory.create_backend(BackendType::Mock, None).is_ok());
        #[cfg(feature = "onnx")]
        assert!(factory.create_backend(BackendType::Onnx, None).is_err());
    }

    #[test]
    fn test_mock_pipeline_preserves_dimensions() {
        let mut processor = BackgroundRemovalProcessor::new(mock_config());
        assert!(!processor.is_initialized());

        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(64, 64, Rgb([255, 0, 0])));
        let result = processor.process_image(&image).unwrap();

        assert!(processor.is_initialized());
        assert_eq!(processor.model_name(), "mock");
        assert_eq!(result.dimensions(), (64, 64));
        assert_eq!(result.original_dimensions, (64, 64));
        assert!(result.image.color().has_alpha());
        // Uniform square input has no edges, so everything is background
        assert!(result.mask.data.iter().all(|v| *v == 0));
        assert!(result.image.to_rgba8().pixels().all(|p| p.0 == [0, 0, 0, 0]));
    }

    #[test]
    fn test_mock_pipeline_keeps_object_edges() {
        let mut processor = BackgroundRemovalProcessor::new(mock_config());
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_fn(120, 80, |x, y| {
            if (40..80).contains(&x) && (20..60).contains(&y) {
                Rgb([250, 250, 250])
            } else {
                Rgb([5, 5, 5])
            }
        }));

        let result = processor.process_image(&image).unwrap();
        assert_eq!(result.dimensions(), (120, 80));
        assert!(result.mask.statistics().foreground_pixels > 0);
        assert!(result.mask.data.len() == 120 * 80);
    }

    #[test]
    fn test_tensor_to_mask_normalises_and_maps() {
        let letterbox = Letterbox::compute((4, 2), [4, 4]).unwrap();
        let mut tensor = Array4::<f32>::from_elem((1, 1, 4, 4), 0.2);
        // Rows 1..3 hold the image; make its left half strong
        for y in 1..3 {
            for x in 0..2 {
                tensor[[0, 0, y, x]] = 0.6;
            }
        }

        let mask = BackgroundRemovalProcessor::tensor_to_mask(&tensor, (4, 2), &letterbox, (4, 4))
            .unwrap();
        assert_eq!(mask.dimensions, (4, 2));
        assert_eq!(mask.data, vec![255, 255, 0, 0, 255, 255, 0, 0]);

        let bad = Array4::<f32>::zeros((1, 2, 4, 4));
        assert!(
            BackgroundRemovalProcessor::tensor_to_mask(&bad, (4, 2), &letterbox, (4, 4)).is_err()
        );
    }

    #[test]
    fn test_tensor_to_mask_interpolates_edges() {
        // 4x4 image on a 2x2 canvas: left output column background, right foreground
        let letterbox = Letterbox::compute((4, 4), [2, 2]).unwrap();
        let mut tensor = Array4::<f32>::zeros((1, 1, 2, 2));
        tensor[[0, 0, 0, 1]] = 1.0;
        tensor[[0, 0, 1, 1]] = 1.0;

        let mask = BackgroundRemovalProcessor::tensor_to_mask(&tensor, (4, 4), &letterbox, (2, 2))
            .unwrap();
        for row in mask.data.chunks(4) {
            assert_eq!(row, [0, 64, 191, 255]);
        }
    }

    #[test]
    fn test_apply_background_removal() {
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(2, 1, Rgb([10, 20, 30])));
        let mask = SegmentationMask::new(vec![0, 200], (2, 1));
        let result = BackgroundRemovalProcessor::apply_background_removal(&image, &mask);
        assert_eq!(result.get_pixel(0, 0).0, [0, 0, 0, 0]);
        assert_eq!(result.get_pixel(1, 0).0, [10, 20, 30, 200]);
    }

    struct CountingFactory {
        created: AtomicUsize,
    }

    impl BackendFactory for CountingFactory {
        fn create_backend(
            &self,
            backend_type: BackendType,
            model_manager: Option<ModelManager>,
        ) -> Result<Box<dyn InferenceBackend>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            DefaultBackendFactory.create_backend(backend_type, model_manager)
        }

        fn available_backends(&self) -> Vec<BackendType> {
            vec![BackendType::Mock]
        }
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let factory = Arc::new(CountingFactory {
            created: AtomicUsize::new(0),
        });
        let mut processor = BackgroundRemovalProcessor::with_factory(mock_config(), factory.clone());

        processor.initialize().unwrap();
        processor.initialize().unwrap();
        let image = DynamicImage::new_rgb8(8, 8);
        processor.process_image(&image).unwrap();

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(processor.available_backends(), vec![BackendType::Mock]);
    }
}
