//! Mock backend for testing and debugging
//!
//! Produces a deterministic mask from a simple edge detector so the full pipeline can run
//! without model files or a native runtime.

use crate::config::RemovalConfig;
use crate::error::{BgRemovalError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelInfo, PreprocessingConfig};
use instant::{Duration, Instant};
use ndarray::Array4;

/// Input edge length used by the mock model
pub const MOCK_INPUT_SIZE: usize = 320;

/// Mock backend for testing and debugging purposes
///
/// Pixels whose red channel differs from their 4-neighbourhood by more than `0.1` (in
/// normalised units) are foreground, everything else is background. A uniform image
/// therefore yields an empty mask.
#[derive(Debug)]
pub struct MockBackend {
    input_shape: (usize, usize, usize, usize),
    output_shape: (usize, usize, usize, usize),
    initialized: bool,
}

impl MockBackend {
    /// Create a new mock backend
    #[must_use]
    pub fn new() -> Self {
        Self {
            input_shape: (1, 3, MOCK_INPUT_SIZE, MOCK_INPUT_SIZE),
            output_shape: (1, 1, MOCK_INPUT_SIZE, MOCK_INPUT_SIZE),
            initialized: false,
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for MockBackend {
    fn initialize(&mut self, _config: &RemovalConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }
        let start = Instant::now();
        self.initialized = true;
        Ok(Some(start.elapsed()))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        if !self.initialized {
            return Err(BgRemovalError::internal("Backend not initialized"));
        }

        let (n, _c, h, w) = input.dim();
        let mut output = Array4::<f32>::zeros((n, 1, h, w));

        for batch in 0..n {
            for y in 1..h.saturating_sub(1) {
                for x in 1..w.saturating_sub(1) {
                    let value = |yy: usize, xx: usize| {
                        input.get([batch, 0, yy, xx]).copied().unwrap_or(0.0)
                    };
                    let center = value(y, x);
                    let edge_strength = ((center - value(y, x - 1)).abs()
                        + (center - value(y, x + 1)).abs()
                        + (center - value(y - 1, x)).abs()
                        + (center - value(y + 1, x)).abs())
                        / 4.0;

                    if let Some(elem) = output.get_mut([batch, 0, y, x]) {
                        *elem = if edge_strength > 0.1 { 1.0 } else { 0.0 };
                    }
                }
            }
        }

        Ok(output)
    }

    fn input_shape(&self) -> (usize, usize, usize, usize) {
        self.input_shape
    }

    fn output_shape(&self) -> (usize, usize, usize, usize) {
        self.output_shape
    }

    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig> {
        Ok(PreprocessingConfig::imagenet(MOCK_INPUT_SIZE as u32))
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        Ok(ModelInfo {
            name: "mock".to_string(),
            precision: "mock".to_string(),
            size_bytes: 0,
            input_shape: self.input_shape,
            output_shape: self.output_shape,
        })
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_input_yields_empty_mask() {
        let mut backend = MockBackend::new();
        backend.initialize(&RemovalConfig::default()).unwrap();

        let input = Array4::<f32>::from_elem((1, 3, 32, 32), 0.7);
        let output = backend.infer(&input).unwrap();
        assert_eq!(output.dim(), (1, 1, 32, 32));
        assert!(output.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_edges_are_foreground() {
        let mut backend = MockBackend::new();
        backend.initialize(&RemovalConfig::default()).unwrap();

        let mut input = Array4::<f32>::zeros((1, 3, 16, 16));
        for y in 4..12 {
            for x in 4..12 {
                input[[0, 0, y, x]] = 2.0;
            }
        }

        let output = backend.infer(&input).unwrap();
        assert_eq!(output[[0, 0, 4, 4]], 1.0);
        assert_eq!(output[[0, 0, 8, 8]], 0.0);
        assert_eq!(output[[0, 0, 1, 1]], 0.0);
    }
}
