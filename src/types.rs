//! Core types for background removal operations

use crate::error::{BgRemovalError, Result};
use crate::services::io::encode_png;
use image::{DynamicImage, GenericImageView, ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

/// Result of a background removal operation
#[derive(Debug, Clone)]
pub struct RemovalResult {
    /// RGBA image with the background made transparent
    pub image: DynamicImage,

    /// The segmentation mask used for removal
    pub mask: SegmentationMask,

    /// Original image dimensions
    pub original_dimensions: (u32, u32),

    /// Stage timings for this request
    pub timings: ProcessingTimings,
}

impl RemovalResult {
    /// Create a new removal result
    #[must_use]
    pub fn new(
        image: DynamicImage,
        mask: SegmentationMask,
        original_dimensions: (u32, u32),
        timings: ProcessingTimings,
    ) -> Self {
        Self {
            image,
            mask,
            original_dimensions,
            timings,
        }
    }

    /// Encode the result as PNG with alpha channel
    ///
    /// # Errors
    /// - PNG encoder failure
    pub fn to_png_bytes(&self) -> Result<Vec<u8>> {
        encode_png(&self.image)
    }

    /// Output dimensions
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Single-channel foreground mask at the original image resolution
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    /// Row-major alpha values, 0 = background, 255 = foreground
    pub data: Vec<u8>,

    /// Width and height
    pub dimensions: (u32, u32),
}

impl SegmentationMask {
    /// Create a new segmentation mask
    #[must_use]
    pub fn new(data: Vec<u8>, dimensions: (u32, u32)) -> Self {
        Self { data, dimensions }
    }

    /// Convert mask to a grayscale image
    ///
    /// # Errors
    /// - Data length does not match the dimensions
    pub fn to_image(&self) -> Result<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (width, height) = self.dimensions;
        ImageBuffer::from_raw(width, height, self.data.clone())
            .ok_or_else(|| BgRemovalError::processing("Failed to create image from mask data"))
    }

    /// Get mask statistics
    #[must_use]
    pub fn statistics(&self) -> MaskStatistics {
        let total_pixels = self.data.len();
        let foreground_pixels = self.data.iter().filter(|&&x| x > 127).count();
        let foreground_ratio = if total_pixels == 0 {
            0.0
        } else {
            foreground_pixels as f32 / total_pixels as f32
        };

        MaskStatistics {
            total_pixels,
            foreground_pixels,
            background_pixels: total_pixels - foreground_pixels,
            foreground_ratio,
        }
    }
}

/// Statistics about a segmentation mask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskStatistics {
    pub total_pixels: usize,
    pub foreground_pixels: usize,
    pub background_pixels: usize,
    pub foreground_ratio: f32,
}

/// Per-stage timings in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    /// Model loading time (first call only)
    pub model_load_ms: u64,

    /// Upload decoding
    pub image_decode_ms: u64,

    /// Resize, normalise, tensor conversion
    pub preprocessing_ms: u64,

    /// Backend inference
    pub inference_ms: u64,

    /// Mask generation and alpha application
    pub postprocessing_ms: u64,

    /// PNG encoding of the response
    pub image_encode_ms: Option<u64>,

    /// Total end-to-end processing time
    pub total_ms: u64,
}

impl ProcessingTimings {
    /// One-line summary for logs
    #[must_use]
    pub fn summary(&self) -> String {
        let encode = self
            .image_encode_ms
            .map_or_else(String::new, |ms| format!(" encode={ms}ms"));
        format!(
            "decode={}ms preprocess={}ms inference={}ms postprocess={}ms{} total={}ms",
            self.image_decode_ms,
            self.preprocessing_ms,
            self.inference_ms,
            self.postprocessing_ms,
            encode,
            self.total_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_statistics() {
        let mask = SegmentationMask::new(vec![0, 255, 200, 10], (2, 2));
        let stats = mask.statistics();
        assert_eq!(stats.total_pixels, 4);
        assert_eq!(stats.foreground_pixels, 2);
        assert_eq!(stats.background_pixels, 2);
        assert!((stats.foreground_ratio - 0.5).abs() < f32::EPSILON);

        let empty = SegmentationMask::new(Vec::new(), (0, 0));
        assert!(empty.statistics().foreground_ratio.abs() < f32::EPSILON);
    }

    #[test]
    fn test_mask_to_image() {
        let mask = SegmentationMask::new(vec![0, 255, 128, 64], (2, 2));
        let image = mask.to_image().unwrap();
        assert_eq!(image.get_pixel(1, 0).0, [255]);

        let broken = SegmentationMask::new(vec![0; 3], (2, 2));
        assert!(broken.to_image().is_err());
    }

    #[test]
    fn test_result_png_bytes() {
        let image = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(
            3,
            2,
            image::Rgba([10, 20, 30, 0]),
        ));
        let result = RemovalResult::new(
            image,
            SegmentationMask::new(vec![0; 6], (3, 2)),
            (3, 2),
            ProcessingTimings::default(),
        );

        let bytes = result.to_png_bytes().unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.dimensions(), (3, 2));
        assert_eq!(result.dimensions(), (3, 2));
    }

    #[test]
    fn test_timings_summary() {
        let timings = ProcessingTimings {
            inference_ms: 12,
            image_encode_ms: Some(3),
            total_ms: 20,
            ..ProcessingTimings::default()
        };
        let summary = timings.summary();
        assert!(summary.contains("inference=12ms"));
        assert!(summary.contains("encode=3ms"));
        assert!(summary.ends_with("total=20ms"));
    }
}
