#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # Introibrotech Background Removal API
//!
//! HTTP service that removes image backgrounds with salient-object segmentation models
//! running in-process on ONNX Runtime or the pure-Rust Tract backend.
//!
//! ## Endpoints
//!
//! - `POST /remove-bg`: multipart upload in field `image` (`.png`, `.jpg`, `.jpeg`, `.webp`),
//!   answered with a PNG attachment whose background is transparent
//! - `GET /`: liveness check
//! - `GET /ready`: 200 once the model is loaded, 503 before
//!
//! ## Processing
//!
//! One model is loaded per process, at startup by the warm-up task or by the first request.
//! A bounded number of requests is admitted at a time (further requests get 503) and each
//! request is bounded by a timeout (504). Decoding, inference and PNG encoding run on the
//! blocking thread pool.
//!
//! ## Library usage
//!
//! ```rust,no_run
//! use introibrotech_bg_remover::{
//!     config::ServerConfig, processor::DefaultBackendFactory, server::Application,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let app = Application::build(ServerConfig::default(), Arc::new(DefaultBackendFactory)).await?;
//! println!("listening on {}", app.port());
//! app.run_until_stopped().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime backend with CUDA and `CoreML` execution providers
//! - `tract` (default): pure Rust backend
//! - `webp-support` (default): WebP decoding
//! - `tracing-json`: JSON log output

pub mod backends;
pub mod cache;
pub mod cli;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod inference;
pub mod models;
pub mod processor;
pub mod server;
pub mod services;
pub mod tracing_config;
pub mod types;
pub mod utils;
pub mod warmup;

pub use backends::*;
pub use cache::{format_size, CachedModelInfo, ModelCache};
pub use config::{CorsPolicy, ExecutionProvider, RemovalConfig, ServerConfig};
pub use download::ModelDownloader;
pub use engine::{EngineConfig, EngineError, ModelState, RemovedBackground, SegmentationEngine};
pub use error::{BgRemovalError, Result};
pub use inference::InferenceBackend;
pub use models::{
    KnownModel, ModelInfo, ModelManager, ModelSource, ModelSpec, ModelSpecParser,
    PreprocessingConfig, MODEL_CATALOG,
};
pub use processor::{
    BackendFactory, BackendType, BackgroundRemovalProcessor, DefaultBackendFactory,
    ProcessorConfig, ProcessorConfigBuilder,
};
pub use server::{AppState, Application};
pub use services::UploadedImage;
pub use tracing_config::{TracingConfig, TracingFormat};
pub use types::{ProcessingTimings, RemovalResult, SegmentationMask};
pub use utils::{ImagePreprocessor, PreprocessingOptions};
