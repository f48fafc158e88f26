//! Image decoding and encoding for uploaded files
//!
//! Keeps byte-level I/O out of the processor so the pipeline only ever sees decoded images.

use crate::error::{BgRemovalError, Result};
use image::{codecs::png::PngEncoder, DynamicImage, ImageEncoder, ImageFormat, ImageReader};
use std::io::Cursor;
use std::path::Path;

/// An uploaded image file, not yet decoded
#[derive(Debug, Clone)]
pub struct UploadedImage {
    /// Client-supplied file name
    pub file_name: String,
    /// Raw file contents
    pub bytes: Vec<u8>,
}

impl UploadedImage {
    #[must_use]
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }

    /// Format implied by the file extension, if recognised
    #[must_use]
    pub fn extension_format(&self) -> Option<ImageFormat> {
        Path::new(&self.file_name)
            .extension()
            .and_then(ImageFormat::from_extension)
    }

    /// Decode the upload
    ///
    /// The container is sniffed from the content first; the file extension is only a
    /// fallback for data whose magic bytes are not recognised.
    ///
    /// # Errors
    /// - Empty file
    /// - Data that no enabled decoder accepts
    /// - [`BgRemovalError::UnsupportedFormat`] when neither content nor extension names a format
    pub fn decode(&self) -> Result<DynamicImage> {
        if self.bytes.is_empty() {
            return Err(BgRemovalError::processing_stage_error(
                "decode",
                "uploaded file is empty",
                Some(&self.file_name),
            ));
        }

        let reader = ImageReader::new(Cursor::new(self.bytes.as_slice())).with_guessed_format()?;
        if reader.format().is_some() {
            return reader.decode().map_err(|e| self.decode_error(&e));
        }

        let format = self.extension_format().ok_or_else(|| {
            BgRemovalError::unsupported_format(format!(
                "unrecognised image data in {}",
                self.file_name
            ))
        })?;
        log::debug!(
            "Content sniffing failed for {}, decoding as {:?}",
            self.file_name,
            format
        );
        image::load_from_memory_with_format(&self.bytes, format).map_err(|e| self.decode_error(&e))
    }

    fn decode_error(&self, error: &image::ImageError) -> BgRemovalError {
        BgRemovalError::processing_stage_error(
            "decode",
            &error.to_string(),
            Some(&format!("{} ({} bytes)", self.file_name, self.bytes.len())),
        )
    }
}

/// Encode an image as PNG, preserving the alpha channel
///
/// # Errors
/// - Encoder failure
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut buffer = Vec::with_capacity(rgba.as_raw().len() / 2);

    PngEncoder::new(&mut buffer).write_image(
        rgba.as_raw(),
        width,
        height,
        image::ExtendedColorType::Rgba8,
    )?;

    Ok(buffer)
}
