//! Configuration types for the background removal service

use crate::error::{BgRemovalError, Result};
use crate::models::ModelSpec;
use crate::engine::EngineConfig;
use crate::processor::BackendType;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Default listen port when `PORT` is not set
pub const DEFAULT_PORT: u16 = 5000;

/// Origin allowed to call the API from a browser unless configured otherwise
pub const DEFAULT_ALLOWED_ORIGIN: &str = "https://ibrahimwebflow.github.io";

/// Default upload size limit (25 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon GPU acceleration
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

/// Parse a provider string in `backend:provider` form
///
/// Accepted values: `onnx:auto`, `onnx:cpu`, `onnx:cuda`, `onnx:coreml`, `tract:cpu`
/// and `mock`. A bare backend name uses that backend's default provider.
///
/// # Errors
/// - Unknown backend or provider name
/// - Provider not supported by the backend (e.g. `tract:cuda`)
pub fn parse_provider_string(value: &str) -> Result<(BackendType, ExecutionProvider)> {
    let normalized = value.trim().to_lowercase();
    let (backend, provider) = match normalized.split_once(':') {
        Some((backend, provider)) => (backend, Some(provider)),
        None => (normalized.as_str(), None),
    };

    let backend_type = match backend {
        "onnx" => BackendType::Onnx,
        "tract" => BackendType::Tract,
        "mock" => BackendType::Mock,
        other => {
            return Err(BgRemovalError::invalid_config(format!(
                "Unknown backend '{other}'. Expected one of: onnx, tract, mock"
            )))
        },
    };

    let execution_provider = match (&backend_type, provider) {
        (BackendType::Onnx, None | Some("auto")) => ExecutionProvider::Auto,
        (BackendType::Onnx, Some("cpu")) => ExecutionProvider::Cpu,
        (BackendType::Onnx, Some("cuda")) => ExecutionProvider::Cuda,
        (BackendType::Onnx, Some("coreml")) => ExecutionProvider::CoreMl,
        (BackendType::Tract | BackendType::Mock, None | Some("cpu")) => ExecutionProvider::Cpu,
        (_, Some(other)) => {
            return Err(BgRemovalError::invalid_config(format!(
                "Execution provider '{other}' is not supported by the {backend} backend"
            )))
        },
    };

    Ok((backend_type, execution_provider))
}

/// Settings handed to an inference backend when it loads its model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovalConfig {
    /// Execution provider for ONNX Runtime
    pub execution_provider: ExecutionProvider,

    /// Enable debug mode (additional logging and validation)
    pub debug: bool,

    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,

    /// Number of inter-op threads for inference (0 = auto)
    pub inter_threads: usize,

    /// Model specification
    pub model_spec: ModelSpec,
}

impl Default for RemovalConfig {
    fn default() -> Self {
        Self {
            execution_provider: ExecutionProvider::default(),
            debug: false,
            intra_threads: 0,
            inter_threads: 0,
            model_spec: ModelSpec::default(),
        }
    }
}

/// Cross-origin policy for browser clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsPolicy {
    /// Any origin may call the API
    AnyOrigin,
    /// Only the listed origins may call the API
    AllowList(Vec<String>),
}

impl CorsPolicy {
    /// Build a policy from configured origins; `*` anywhere in the list allows any origin
    #[must_use]
    pub fn from_origins<S: AsRef<str>>(origins: &[S]) -> Self {
        let cleaned: Vec<String> = origins
            .iter()
            .map(|origin| origin.as_ref().trim().trim_end_matches('/').to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        if cleaned.is_empty() || cleaned.iter().any(|origin| origin == "*") {
            Self::AnyOrigin
        } else {
            Self::AllowList(cleaned)
        }
    }
}

impl Default for CorsPolicy {
    fn default() -> Self {
        Self::AllowList(vec![DEFAULT_ALLOWED_ORIGIN.to_string()])
    }
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: IpAddr,
    /// Listen port (0 picks a free port)
    pub port: u16,
    /// Cross-origin policy
    pub cors: CorsPolicy,
    /// Maximum accepted request body size in bytes
    pub max_upload_bytes: usize,
    /// Launch the model warm-up task at startup
    pub warmup: bool,
    /// Model, processor settings, admission limit and inference timeout
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            cors: CorsPolicy::default(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            warmup: true,
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Socket address to bind
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Validate server settings
    ///
    /// # Errors
    /// - Upload limit of zero bytes
    /// - Invalid engine limits
    pub fn validate(&self) -> Result<()> {
        if self.max_upload_bytes == 0 {
            return Err(BgRemovalError::config_value_error(
                "max upload bytes",
                self.max_upload_bytes,
                "1 or more",
                Some(DEFAULT_MAX_UPLOAD_BYTES),
            ));
        }
        self.engine.validate()
    }
}
