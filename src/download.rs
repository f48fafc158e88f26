//! Model downloading into the local cache
//!
//! Downloads stream into a `.part` file inside the cache directory and are renamed into
//! place only after the body completed and the optional checksum matched, so a reader never
//! observes a half-written model.

use crate::cache::{ModelCache, PARTIAL_SUFFIX};
use crate::error::{BgRemovalError, Result};
use crate::models::KnownModel;
use futures_util::stream::TryStreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

/// Log download progress every this many bytes
const PROGRESS_LOG_INTERVAL: u64 = 16 * 1024 * 1024;

/// A `.part` file that is deleted when dropped unless it was moved into the cache
///
/// Covers failed downloads and download futures dropped mid-stream.
struct PartialDownload {
    path: PathBuf,
    persisted: bool,
}

impl PartialDownload {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }
}

impl Drop for PartialDownload {
    fn drop(&mut self) {
        if self.persisted || !self.path.exists() {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!(
                "Failed to remove partial download {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// Model downloader
#[derive(Debug, Clone)]
pub struct ModelDownloader {
    client: Client,
    cache: ModelCache,
}

impl ModelDownloader {
    /// Create a new model downloader writing into `cache`
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new(cache: ModelCache) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BgRemovalError::network_error("Failed to create HTTP client", e))?;

        Ok(Self { client, cache })
    }

    /// Ensure a catalog model is present in the cache, downloading it if needed
    ///
    /// Returns the path of the cached model file.
    ///
    /// # Errors
    /// - Network errors or non-success HTTP status
    /// - File system errors while writing the cache
    /// - Checksum mismatch against the pinned hash
    pub async fn download_model(&self, model: &KnownModel) -> Result<PathBuf> {
        let final_path = self.cache.get_model_path(model.name);
        if self.cache.is_model_cached(model.name) {
            log::debug!("Model already cached: {}", final_path.display());
            return Ok(final_path);
        }

        // Leftovers of runs that were killed mid-download
        match self.cache.cleanup_partial_downloads() {
            Ok(removed) if !removed.is_empty() => {
                log::info!("Removed {} stale partial download(s)", removed.len());
            },
            Ok(_) => {},
            Err(e) => log::warn!("Failed to clean up partial downloads: {}", e),
        }

        log::info!("Downloading model {} from {}", model.name, model.url);
        let mut partial = PartialDownload::new(self.cache.cache_dir().join(format!(
            "{}.{}{PARTIAL_SUFFIX}",
            model.file_name(),
            uuid::Uuid::new_v4().simple()
        )));

        let bytes = self.download_verified(model, &partial.path).await?;
        fs::rename(&partial.path, &final_path).map_err(|e| {
            BgRemovalError::file_io_error("move downloaded model to cache", &final_path, &e)
        })?;
        partial.persisted = true;

        log::info!(
            "Downloaded model {} ({} bytes) to {}",
            model.name,
            bytes,
            final_path.display()
        );
        Ok(final_path)
    }

    async fn download_verified(&self, model: &KnownModel, partial_path: &Path) -> Result<u64> {
        let bytes = self.download_file(model.url, partial_path).await?;

        if let Some(expected) = model.sha256 {
            if !Self::verify_file_integrity(partial_path, Some(expected))? {
                return Err(BgRemovalError::network_error(
                    format!("Checksum mismatch for {}", model.name),
                    format!("expected sha256 {expected}"),
                ));
            }
        }

        Ok(bytes)
    }

    /// Stream a single URL to `local_path`, returning the number of bytes written
    async fn download_file(&self, url: &str, local_path: &Path) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BgRemovalError::network_error(format!("Failed to download {url}"), e))?;

        if !response.status().is_success() {
            return Err(BgRemovalError::network_error(
                format!("Failed to download {url}"),
                format!("HTTP status {}", response.status()),
            ));
        }

        let total_size = response.content_length();
        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| BgRemovalError::file_io_error("create file", local_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut next_report = PROGRESS_LOG_INTERVAL;
        let mut buffer = vec![0; 64 * 1024];

        loop {
            let bytes_read = stream
                .read(&mut buffer)
                .await
                .map_err(|e| BgRemovalError::network_error("Failed to read download stream", e))?;

            if bytes_read == 0 {
                break;
            }

            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| BgRemovalError::file_io_error("write to file", local_path, &e))?;

            downloaded += bytes_read as u64;
            if downloaded >= next_report {
                match total_size {
                    Some(total) => log::info!(
                        "Downloaded {:.1} of {:.1} MB",
                        downloaded as f64 / 1_048_576.0,
                        total as f64 / 1_048_576.0
                    ),
                    None => log::info!("Downloaded {:.1} MB", downloaded as f64 / 1_048_576.0),
                }
                next_report += PROGRESS_LOG_INTERVAL;
            }
        }

        file.flush()
            .await
            .map_err(|e| BgRemovalError::file_io_error("flush file", local_path, &e))?;

        if let Some(total) = total_size {
            if downloaded != total {
                return Err(BgRemovalError::network_error(
                    format!("Incomplete download from {url}"),
                    format!("received {downloaded} of {total} bytes"),
                ));
            }
        }

        Ok(downloaded)
    }

    /// Verify the integrity of a file using SHA-256
    ///
    /// Returns `true` when no hash is expected.
    ///
    /// # Errors
    /// - File cannot be read
    pub fn verify_file_integrity(file_path: &Path, expected_hash: Option<&str>) -> Result<bool> {
        let Some(expected) = expected_hash else {
            return Ok(true);
        };

        let contents = fs::read(file_path).map_err(|e| {
            BgRemovalError::file_io_error("read file for verification", file_path, &e)
        })?;

        let actual_hash = format!("{:x}", Sha256::digest(&contents));
        if actual_hash.eq_ignore_ascii_case(expected) {
            Ok(true)
        } else {
            log::warn!(
                "File integrity check failed for {}: expected {}, got {}",
                file_path.display(),
                expected,
                actual_hash
            );
            Ok(false)
        }
    }

    /// Get the model cache for other operations
    #[must_use]
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }
}
