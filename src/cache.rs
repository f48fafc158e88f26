//! Model cache management for downloaded models
//!
//! Catalog models are stored as single ONNX files under an XDG-compliant cache directory.
//! The location can be overridden with `BGREMOVER_CACHE_DIR`.

use crate::error::{BgRemovalError, Result};
use crate::models::find_known_model;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache location
pub const CACHE_DIR_ENV: &str = "BGREMOVER_CACHE_DIR";

/// Suffix of in-flight downloads
pub(crate) const PARTIAL_SUFFIX: &str = ".part";

/// Information about a cached model
#[derive(Debug, Clone)]
pub struct CachedModelInfo {
    /// Model identifier (file stem)
    pub model_id: String,
    /// Path to the cached model file
    pub path: PathBuf,
    /// Whether the model belongs to the built-in catalog
    pub in_catalog: bool,
    /// Size of the model file in bytes
    pub size_bytes: u64,
}

/// Model cache manager
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a cache in the default location
    ///
    /// Uses `BGREMOVER_CACHE_DIR` when set, otherwise:
    /// - Linux: `~/.cache/introibrotech-bg-remover/models/`
    /// - macOS: `~/Library/Caches/introibrotech-bg-remover/models/`
    /// - Windows: `%LOCALAPPDATA%/introibrotech-bg-remover/models/`
    ///
    /// # Errors
    /// - Failed to determine cache directory
    /// - Failed to create cache directory
    pub fn new() -> Result<Self> {
        Self::with_dir(Self::get_cache_dir()?)
    }

    /// Create a cache rooted at `base_dir`; models go into its `models` subdirectory
    ///
    /// # Errors
    /// - Failed to create cache directory
    pub fn with_dir<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let cache_dir = base_dir.as_ref().join("models");

        if !cache_dir.exists() {
            fs::create_dir_all(&cache_dir).map_err(|e| {
                BgRemovalError::file_io_error("create cache directory", &cache_dir, &e)
            })?;
        }

        Ok(Self { cache_dir })
    }

    fn get_cache_dir() -> Result<PathBuf> {
        if let Ok(cache_override) = std::env::var(CACHE_DIR_ENV) {
            if !cache_override.trim().is_empty() {
                return Ok(PathBuf::from(cache_override));
            }
        }

        Ok(dirs::cache_dir()
            .ok_or_else(|| {
                BgRemovalError::invalid_config(format!(
                    "Failed to determine cache directory. Set {CACHE_DIR_ENV} environment variable."
                ))
            })?
            .join("introibrotech-bg-remover"))
    }

    /// Directory holding the model files
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Check if a model is cached
    ///
    /// Empty files left behind by interrupted writes do not count.
    #[must_use]
    pub fn is_model_cached(&self, model_id: &str) -> bool {
        fs::metadata(self.get_model_path(model_id))
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false)
    }

    /// Path of a cached model file (may not exist)
    #[must_use]
    pub fn get_model_path(&self, model_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{model_id}.onnx"))
    }

    /// Scan cache directory and return all available models
    ///
    /// # Errors
    /// - Failed to read cache directory
    pub fn scan_cached_models(&self) -> Result<Vec<CachedModelInfo>> {
        let mut models = Vec::new();

        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            BgRemovalError::file_io_error("read cache directory", &self.cache_dir, &e)
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let is_onnx = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
            if !is_onnx || !path.is_file() {
                continue;
            }

            let Some(model_id) = path.file_stem().and_then(|stem| stem.to_str()) else {
                log::debug!("Skipping cache entry with non UTF-8 name: {}", path.display());
                continue;
            };

            let size_bytes = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            models.push(CachedModelInfo {
                model_id: model_id.to_string(),
                in_catalog: find_known_model(model_id).is_some(),
                path: path.clone(),
                size_bytes,
            });
        }

        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    /// Remove partial downloads left behind by interrupted runs
    ///
    /// # Errors
    /// - Failed to read cache directory
    /// - Failed to remove a partial file
    pub fn cleanup_partial_downloads(&self) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();

        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            BgRemovalError::file_io_error("read cache directory", &self.cache_dir, &e)
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            let is_partial = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX));
            if is_partial && path.is_file() {
                log::warn!("Removing partial download: {}", path.display());
                fs::remove_file(&path).map_err(|e| {
                    BgRemovalError::file_io_error("remove partial download", &path, &e)
                })?;
                removed.push(path);
            }
        }

        Ok(removed)
    }
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS.get(unit_index).copied().unwrap_or("B");
    if unit_index == 0 {
        format!("{bytes} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}
