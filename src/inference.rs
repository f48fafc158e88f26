//! Inference backend abstraction

use crate::{
    config::RemovalConfig,
    error::Result,
    models::{ModelInfo, PreprocessingConfig},
};
use instant::Duration;
use ndarray::Array4;

/// Trait for inference backends
///
/// Backends are moved onto the blocking pool and shared behind a mutex, so they must be
/// `Send`. Calls are never concurrent on one instance.
pub trait InferenceBackend: Send {
    /// Initialize the backend with the given configuration
    ///
    /// Returns the model load time when a model was actually loaded, `None` when the backend
    /// was already initialized.
    ///
    /// # Errors
    /// - Model loading or validation errors
    /// - Execution provider setup failures
    fn initialize(&mut self, config: &RemovalConfig) -> Result<Option<Duration>>;

    /// Run inference on an NCHW input tensor, returning a `1x1xHxW` mask tensor
    ///
    /// # Errors
    /// - Backend not initialized
    /// - Model inference failures
    /// - Invalid input tensor dimensions
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Get the expected input shape for this backend
    fn input_shape(&self) -> (usize, usize, usize, usize);

    /// Get the expected output shape for this backend
    fn output_shape(&self) -> (usize, usize, usize, usize);

    /// Get preprocessing configuration for this backend
    ///
    /// # Errors
    /// - Invalid or missing preprocessing configuration
    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig>;

    /// Get model information for this backend
    ///
    /// # Errors
    /// - Model metadata unavailable
    fn get_model_info(&self) -> Result<ModelInfo>;

    /// Check if backend is initialized
    fn is_initialized(&self) -> bool;
}
