//! Shared segmentation engine
//!
//! One engine exists per process. It owns the model and loads it at most once: concurrent
//! first callers wait on the same load, and a load keeps running when the request that
//! started it times out. Requests are admitted up to a limit and bounded by a timeout. Inference runs on the blocking thread pool and is serialised
//! on the single loaded model.

use crate::{
    error::{BgRemovalError, Result},
    models::{find_known_model, ModelSource},
    processor::{BackendFactory, BackgroundRemovalProcessor, ProcessorConfig},
    download::ModelDownloader,
    services::UploadedImage,
    types::ProcessingTimings,
};
use chrono::{DateTime, Utc};
use image::DynamicImage;
use instant::Instant;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OnceCell, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};

/// Default number of requests admitted at once (running plus waiting)
pub const DEFAULT_MAX_PENDING: usize = 8;

/// Default bound on a single request
pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(120);

/// Engine limits and the model it serves
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub processor: ProcessorConfig,
    /// Requests admitted concurrently; further requests are rejected as busy
    pub max_pending: usize,
    /// Upper bound on one request's wait for the model plus decode, inference and encode.
    /// A model load outlives the requests that time out waiting for it.
    pub inference_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            max_pending: DEFAULT_MAX_PENDING,
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Validate engine limits
    ///
    /// # Errors
    /// - Zero admission limit
    /// - Zero timeout
    pub fn validate(&self) -> Result<()> {
        if self.max_pending == 0 {
            return Err(BgRemovalError::config_value_error(
                "max pending requests",
                self.max_pending,
                "1 or more",
                Some(DEFAULT_MAX_PENDING),
            ));
        }
        if self.inference_timeout.is_zero() {
            return Err(BgRemovalError::invalid_config(
                "Inference timeout must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Lifecycle of the shared model
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    /// Nothing has tried to load the model yet
    Cold,
    /// A load is in progress
    Loading,
    /// The model is loaded and serving
    Ready { loaded_at: DateTime<Utc> },
    /// The last load attempt failed; the next request retries
    Failed { reason: String },
}

impl ModelState {
    /// Status label used by the readiness endpoint
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Self::Cold => "COLD",
            Self::Loading => "LOADING",
            Self::Ready { .. } => "READY",
            Self::Failed { .. } => "FAILED",
        }
    }
}

/// Why a request did not produce an image
#[derive(Debug, Error)]
pub enum EngineError {
    /// Admission limit reached
    #[error("engine is at capacity")]
    Busy,

    /// The request exceeded the inference timeout
    #[error("processing exceeded {0:?}")]
    Timeout(Duration),

    /// Model loading, decoding, inference or encoding failed
    #[error(transparent)]
    Failed(#[from] BgRemovalError),
}

/// PNG produced for one request
#[derive(Debug, Clone)]
pub struct RemovedBackground {
    pub png: Vec<u8>,
    pub dimensions: (u32, u32),
    pub timings: ProcessingTimings,
}

type SharedProcessor = Arc<Mutex<BackgroundRemovalProcessor>>;

/// Process-wide segmentation engine
pub struct SegmentationEngine {
    model: Arc<ModelSlot>,
    admission: Arc<Semaphore>,
    inference_timeout: Duration,
}

impl std::fmt::Debug for SegmentationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentationEngine")
            .field("config", &self.model.config)
            .field("state", &self.state())
            .field("available_permits", &self.admission.available_permits())
            .finish_non_exhaustive()
    }
}

/// The loaded model and its lifecycle, shared with the load task
struct ModelSlot {
    config: EngineConfig,
    factory: Arc<dyn BackendFactory>,
    processor: OnceCell<SharedProcessor>,
    state: RwLock<ModelState>,
}

/// Resets `Loading` to `Cold` if a load task is torn down before it finished
struct LoadingGuard<'a> {
    state: &'a RwLock<ModelState>,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut state) = self.state.write() {
                if *state == ModelState::Loading {
                    *state = ModelState::Cold;
                }
            }
        }
    }
}

impl ModelSlot {
    fn model_name(&self) -> String {
        if self.config.processor.backend_type.requires_model() {
            self.config.processor.model_spec.source.display_name()
        } else {
            "mock".to_string()
        }
    }

    fn state(&self) -> ModelState {
        self.state
            .read()
            .map_or(ModelState::Cold, |state| state.clone())
    }

    fn set_state(&self, next: ModelState) {
        if let Ok(mut state) = self.state.write() {
            *state = next;
        }
    }

    /// Loaded processor, loading it on first use
    ///
    /// The load runs in its own task: a caller that stops waiting does not cancel it, and
    /// later callers pick up the same load instead of starting another.
    async fn processor(self: &Arc<Self>) -> Result<SharedProcessor> {
        if let Some(processor) = self.processor.get() {
            return Ok(Arc::clone(processor));
        }

        let slot = Arc::clone(self);
        tokio::spawn(async move {
            slot.processor
                .get_or_try_init(|| slot.load())
                .await
                .map(Arc::clone)
        })
        .await
        .map_err(|e| BgRemovalError::internal(format!("Model loading task failed: {e}")))?
    }

    async fn load(&self) -> Result<SharedProcessor> {
        self.set_state(ModelState::Loading);
        let mut guard = LoadingGuard {
            state: &self.state,
            armed: true,
        };

        let outcome = self.load_processor().await;
        guard.armed = false;

        match &outcome {
            Ok(_) => self.set_state(ModelState::Ready {
                loaded_at: Utc::now(),
            }),
            Err(e) => {
                error!(error = %e, model = %self.model_name(), "Model failed to load");
                self.set_state(ModelState::Failed {
                    reason: e.to_string(),
                });
            },
        }
        outcome
    }

    async fn load_processor(&self) -> Result<SharedProcessor> {
        let start = Instant::now();
        let config = self.config.processor.clone();

        if config.backend_type.requires_model() {
            if let ModelSource::Downloaded(name) = &config.model_spec.source {
                let known = find_known_model(name).ok_or_else(|| {
                    BgRemovalError::invalid_config(format!("Unknown model '{name}'"))
                })?;
                let cache = config.model_cache()?;
                if !cache.is_model_cached(known.name) {
                    info!(model = known.name, "Model not cached, downloading");
                    ModelDownloader::new(cache)?.download_model(known).await?;
                }
            }
        }

        let factory = Arc::clone(&self.factory);
        let processor = tokio::task::spawn_blocking(move || {
            let mut processor = BackgroundRemovalProcessor::with_factory(config, factory);
            processor.initialize()?;
            Ok::<_, BgRemovalError>(processor)
        })
        .await
        .map_err(|e| BgRemovalError::internal(format!("Model loading task failed: {e}")))??;

        info!(
            model = processor.model_name(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model loaded"
        );
        Ok(Arc::new(Mutex::new(processor)))
    }
}

impl SegmentationEngine {
    /// Create an engine; the model is not loaded until first use or warm-up
    ///
    /// # Errors
    /// - Invalid engine limits
    pub fn new(config: EngineConfig, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        config.validate()?;
        let admission = Arc::new(Semaphore::new(config.max_pending));
        let inference_timeout = config.inference_timeout;

        Ok(Self {
            model: Arc::new(ModelSlot {
                config,
                factory,
                processor: OnceCell::new(),
                state: RwLock::new(ModelState::Cold),
            }),
            admission,
            inference_timeout,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.model.config
    }

    /// Configured model name, for reporting
    #[must_use]
    pub fn model_name(&self) -> String {
        self.model.model_name()
    }

    /// Current model state
    #[must_use]
    pub fn state(&self) -> ModelState {
        self.model.state()
    }

    /// Remove the background of an uploaded image and encode the result as PNG
    ///
    /// # Errors
    /// - [`EngineError::Busy`] when the admission limit is reached
    /// - [`EngineError::Timeout`] when the whole operation exceeds the timeout
    /// - [`EngineError::Failed`] for load, decode, inference or encode failures
    pub async fn remove_background(
        &self,
        upload: UploadedImage,
    ) -> std::result::Result<RemovedBackground, EngineError> {
        let permit = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|_| EngineError::Busy)?;

        let timeout = self.inference_timeout;
        match tokio::time::timeout(timeout, self.run_admitted(upload, permit)).await {
            Ok(outcome) => outcome.map_err(EngineError::from),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(EngineError::Timeout(timeout))
            },
        }
    }

    async fn run_admitted(
        &self,
        upload: UploadedImage,
        permit: OwnedSemaphorePermit,
    ) -> Result<RemovedBackground> {
        let processor = self.model.processor().await?;

        // The permit travels with the blocking job: a timed-out request keeps its slot
        // until the work it started has actually finished.
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let decode_start = Instant::now();
            let image = upload.decode()?;
            let decode_ms = decode_start.elapsed().as_millis() as u64;

            let mut removed = Self::process_blocking(&processor, &image)?;
            removed.timings.image_decode_ms = decode_ms;
            Ok(removed)
        })
        .await
        .map_err(|e| BgRemovalError::internal(format!("Processing task failed: {e}")))?
    }

    /// Run `image` through the loaded model, bypassing admission and timeout
    ///
    /// # Errors
    /// - Model loading failures
    /// - Inference or encoding failures
    pub async fn warm_up(&self, image: DynamicImage) -> Result<ProcessingTimings> {
        let processor = self.model.processor().await?;
        let removed =
            tokio::task::spawn_blocking(move || Self::process_blocking(&processor, &image))
                .await
                .map_err(|e| BgRemovalError::internal(format!("Warm-up task failed: {e}")))??;
        Ok(removed.timings)
    }

    fn process_blocking(
        processor: &SharedProcessor,
        image: &DynamicImage,
    ) -> Result<RemovedBackground> {
        let mut result = {
            let mut processor = processor
                .lock()
                .map_err(|_| BgRemovalError::internal("Model lock poisoned"))?;
            processor.process_image(image)?
        };

        let encode_start = Instant::now();
        let png = result.to_png_bytes()?;
        result.timings.image_encode_ms = Some(encode_start.elapsed().as_millis() as u64);

        Ok(RemovedBackground {
            png,
            dimensions: result.dimensions(),
            timings: result.timings,
        })
    }
}
