//! Image preprocessing for segmentation models
//!
//! Images are letterboxed: resized to fit the model input while keeping the aspect ratio,
//! centred on a padded canvas, and converted to a normalised NCHW tensor. The resulting
//! [`Letterbox`] is what maps the model's mask back onto the original pixels.

use crate::{
    error::{BgRemovalError, Result},
    models::PreprocessingConfig,
};
use image::{DynamicImage, ImageBuffer, RgbImage};
use ndarray::Array4;

/// Placement of the resized image on the model canvas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Scale from original pixels to canvas pixels
    pub scale: f32,
    /// Left padding on the canvas
    pub offset_x: u32,
    /// Top padding on the canvas
    pub offset_y: u32,
    /// Size of the resized image on the canvas
    pub scaled_width: u32,
    pub scaled_height: u32,
}

impl Letterbox {
    /// Compute the letterbox for an image of `original` size on a `target` canvas
    ///
    /// # Errors
    /// - Zero-sized image or canvas
    pub fn compute(original: (u32, u32), target: [u32; 2]) -> Result<Self> {
        let (orig_width, orig_height) = original;
        let [target_width, target_height] = target;
        if orig_width == 0 || orig_height == 0 {
            return Err(BgRemovalError::processing_stage_error(
                "preprocess",
                "image has no pixels",
                Some(&format!("{orig_width}x{orig_height}")),
            ));
        }
        if target_width == 0 || target_height == 0 {
            return Err(BgRemovalError::invalid_config("Model input size must be positive"));
        }

        let scale = (target_width as f32 / orig_width as f32)
            .min(target_height as f32 / orig_height as f32);
        let scaled_width = ((orig_width as f32 * scale).round() as u32).clamp(1, target_width);
        let scaled_height = ((orig_height as f32 * scale).round() as u32).clamp(1, target_height);

        Ok(Self {
            scale,
            offset_x: (target_width - scaled_width) / 2,
            offset_y: (target_height - scaled_height) / 2,
            scaled_width,
            scaled_height,
        })
    }

    /// Canvas position of an original pixel's centre, clamped to the resized area
    ///
    /// Positions are in canvas pixel units with pixel centres on whole numbers, so they can
    /// be interpolated between neighbouring canvas pixels.
    #[must_use]
    pub fn map_to_canvas(&self, x: u32, y: u32) -> (f32, f32) {
        let project = |value: u32, extent: u32, offset: u32| {
            ((value as f32 + 0.5) * self.scale - 0.5).clamp(0.0, extent.saturating_sub(1) as f32)
                + offset as f32
        };
        (
            project(x, self.scaled_width, self.offset_x),
            project(y, self.scaled_height, self.offset_y),
        )
    }
}

/// Configuration for preprocessing behavior
#[derive(Debug, Clone)]
pub struct PreprocessingOptions {
    /// Padding color for aspect ratio preservation (RGB)
    pub padding_color: [u8; 3],
}

impl Default for PreprocessingOptions {
    fn default() -> Self {
        Self {
            padding_color: [255, 255, 255],
        }
    }
}

/// A model-ready tensor and how it was laid out
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub tensor: Array4<f32>,
    pub letterbox: Letterbox,
}

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Letterbox and normalise an image into an NCHW tensor
    ///
    /// # Errors
    /// - Zero-sized image
    /// - Invalid preprocessing configuration
    pub fn preprocess_image(
        image: &DynamicImage,
        preprocessing_config: &PreprocessingConfig,
        options: &PreprocessingOptions,
    ) -> Result<PreparedInput> {
        let [target_width, target_height] = preprocessing_config.target_size;
        let rgb_image = image.to_rgb8();
        let letterbox = Letterbox::compute(rgb_image.dimensions(), preprocessing_config.target_size)?;

        let resized = image::imageops::resize(
            &rgb_image,
            letterbox.scaled_width,
            letterbox.scaled_height,
            image::imageops::FilterType::Triangle,
        );

        let mut canvas =
            ImageBuffer::from_pixel(target_width, target_height, image::Rgb(options.padding_color));
        image::imageops::replace(
            &mut canvas,
            &resized,
            i64::from(letterbox.offset_x),
            i64::from(letterbox.offset_y),
        );

        let tensor = Self::canvas_to_tensor(&canvas, preprocessing_config);
        Ok(PreparedInput { tensor, letterbox })
    }

    /// Convert canvas to normalized tensor
    fn canvas_to_tensor(canvas: &RgbImage, preprocessing_config: &PreprocessingConfig) -> Array4<f32> {
        let (width, height) = canvas.dimensions();
        let mean = preprocessing_config.normalization_mean;
        let std = preprocessing_config.normalization_std;
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in canvas.enumerate_pixels() {
            for (channel, ((value, mean), std)) in
                pixel.0.iter().zip(mean.iter()).zip(std.iter()).enumerate()
            {
                if let Some(slot) = tensor.get_mut([0, channel, y as usize, x as usize]) {
                    *slot = (f32::from(*value) / 255.0 - mean) / std;
                }
            }
        }

        tensor
    }

    /// Preprocess with default options
    ///
    /// # Errors
    /// - Zero-sized image
    /// - Invalid preprocessing configuration
    pub fn preprocess_for_inference(
        image: &DynamicImage,
        preprocessing_config: &PreprocessingConfig,
    ) -> Result<PreparedInput> {
        Self::preprocess_image(image, preprocessing_config, &PreprocessingOptions::default())
    }
}
