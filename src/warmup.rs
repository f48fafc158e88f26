//! Startup warm-up
//!
//! Loads the model and pushes one tiny image through the pipeline before the first real
//! request arrives. Failures are logged; the server keeps running and requests retry the load.

use crate::engine::SegmentationEngine;
use image::{DynamicImage, ImageBuffer, Rgb};
use instant::Instant;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, Instrument};

/// Side length of the synthetic warm-up image
pub const WARMUP_IMAGE_SIZE: u32 = 10;

/// Solid red square used to exercise the pipeline
#[must_use]
pub fn warmup_image() -> DynamicImage {
    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(
        WARMUP_IMAGE_SIZE,
        WARMUP_IMAGE_SIZE,
        Rgb([255, 0, 0]),
    ))
}

/// Spawn the warm-up task
///
/// The handle may be dropped; the task runs to completion on its own.
pub fn spawn_warmup(engine: Arc<SegmentationEngine>) -> JoinHandle<()> {
    let span = tracing::info_span!("warmup", model = %engine.model_name());
    tokio::spawn(
        async move {
            let start = Instant::now();
            info!("Warming up model");

            match engine.warm_up(warmup_image()).await {
                Ok(timings) => info!(
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    timings = %timings.summary(),
                    "Model warmed up"
                ),
                Err(e) => error!(error = %e, "Model warm-up failed"),
            }
        }
        .instrument(span),
    )
}
