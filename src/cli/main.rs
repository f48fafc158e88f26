//! Background removal API server
//!
//! Command-line entry point: reads `.env` and the environment, installs tracing, then serves
//! the HTTP API until a shutdown signal arrives.

use super::config::CliConfigBuilder;
use crate::{
    cache::format_size,
    config::{ServerConfig, DEFAULT_ALLOWED_ORIGIN, DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_PORT},
    download::ModelDownloader,
    engine::{DEFAULT_INFERENCE_TIMEOUT, DEFAULT_MAX_PENDING},
    models::{find_known_model, ModelSource, DEFAULT_MODEL, MODEL_CATALOG},
    processor::DefaultBackendFactory,
    server::Application,
    tracing_config::{TracingConfig, TracingFormat},
};
use anyhow::{Context, Result};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Background removal HTTP API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "introibrotech-bg-remover")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Listen port
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Comma-separated origins allowed by CORS ("*" allows any origin)
    #[arg(
        long,
        env = "CORS_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = DEFAULT_ALLOWED_ORIGIN
    )]
    pub cors_allowed_origins: Vec<String>,

    /// Catalog model name or path to an .onnx file / model directory
    #[arg(short, long, env = "BGREMOVER_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Execution provider in format backend:provider (e.g., onnx:auto, onnx:cuda, tract:cpu, mock)
    #[arg(short, long, env = "BGREMOVER_EXECUTION_PROVIDER", default_value = "onnx:auto")]
    pub execution_provider: String,

    /// Number of inference threads (0 = auto-detect)
    #[arg(short, long, env = "BGREMOVER_THREADS", default_value_t = 0)]
    pub threads: usize,

    /// Model cache directory
    #[arg(long, env = "BGREMOVER_CACHE_DIR", value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Largest accepted request body in bytes
    #[arg(long, env = "BGREMOVER_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    /// Requests admitted at once; further requests get 503
    #[arg(long, env = "BGREMOVER_MAX_PENDING", default_value_t = DEFAULT_MAX_PENDING)]
    pub max_pending: usize,

    /// Per-request processing limit in seconds; slower requests get 504
    #[arg(
        long,
        env = "BGREMOVER_INFERENCE_TIMEOUT_SECS",
        default_value_t = DEFAULT_INFERENCE_TIMEOUT.as_secs()
    )]
    pub inference_timeout_secs: u64,

    /// Skip loading the model at startup
    #[arg(long, env = "BGREMOVER_NO_WARMUP")]
    pub no_warmup: bool,

    /// Log format: console, compact or json
    #[arg(long, env = "LOG_FORMAT", default_value = "console")]
    pub log_format: String,

    /// Tracing filter directives, overriding --verbose
    #[arg(long, env = "RUST_LOG", value_name = "FILTER")]
    pub log_filter: Option<String>,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// List catalog and cached models and exit
    #[arg(long)]
    pub list_models: bool,

    /// Download the configured model into the cache and exit
    #[arg(long)]
    pub only_download: bool,
}

/// Entry point for the server binary
///
/// # Errors
/// - Invalid arguments or environment values
/// - Model download failures for `--only-download`
/// - Listener or server I/O failures
pub async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let format: TracingFormat = cli.log_format.parse().map_err(anyhow::Error::msg)?;
    let mut tracing_config = TracingConfig::new()
        .with_verbosity(cli.verbose)
        .with_format(format);
    if let Some(filter) = &cli.log_filter {
        tracing_config = tracing_config.with_env_filter(filter.clone());
    }
    tracing_config.init().context("Failed to initialize logging")?;

    if let Ok(path) = dotenv {
        debug!("Loaded environment from {}", path.display());
    }

    let config = CliConfigBuilder::from_cli(&cli)?;

    if cli.list_models {
        return list_models(&config);
    }
    if cli.only_download {
        return download_only(&config).await;
    }

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    let app = Application::build(config, Arc::new(DefaultBackendFactory))
        .await
        .context("Failed to start server")?;
    app.run_until_stopped().await.context("Server error")?;

    info!("Server stopped");
    Ok(())
}

fn list_models(config: &ServerConfig) -> Result<()> {
    let cache = config.engine.processor.model_cache()?;

    println!("Available models:");
    for model in MODEL_CATALOG {
        let marker = if cache.is_model_cached(model.name) {
            "cached"
        } else {
            "not downloaded"
        };
        println!(
            "  {:<18} {:>4}px  [{}]  {}",
            model.name, model.input_size, marker, model.description
        );
    }

    let cached = cache.scan_cached_models()?;
    let external: Vec<_> = cached.iter().filter(|m| !m.in_catalog).collect();
    if !external.is_empty() {
        println!("\nOther models in cache:");
        for model in external {
            println!("  {:<18} {}", model.model_id, format_size(model.size_bytes));
        }
    }

    println!("\nCache directory: {}", cache.cache_dir().display());
    Ok(())
}

async fn download_only(config: &ServerConfig) -> Result<()> {
    let processor = &config.engine.processor;
    let name = match &processor.model_spec.source {
        ModelSource::Downloaded(name) => name,
        ModelSource::External(path) => {
            println!("External model {} needs no download", path.display());
            return Ok(());
        },
    };

    let known = find_known_model(name)
        .with_context(|| format!("'{name}' is not a catalog model"))?;
    let downloader = ModelDownloader::new(processor.model_cache()?)?;
    let path = downloader.download_model(known).await?;

    println!("Model {} ready at {}", known.name, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    /// Declared default of an argument, independent of any environment fallback
    fn declared_default(id: &str) -> String {
        let command = Cli::command();
        let arg = command
            .get_arguments()
            .find(|arg| arg.get_id() == id)
            .unwrap();
        arg.get_default_values()
            .first()
            .unwrap()
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_cli_defaults() {
        assert_eq!(declared_default("model"), DEFAULT_MODEL);
        assert_eq!(declared_default("execution_provider"), "onnx:auto");
        assert_eq!(declared_default("port"), DEFAULT_PORT.to_string());
        assert_eq!(declared_default("host"), "0.0.0.0");
        assert_eq!(declared_default("cors_allowed_origins"), DEFAULT_ALLOWED_ORIGIN);

        // Flags without an environment fallback
        let cli = Cli::try_parse_from(["introibrotech-bg-remover", "--port", "5000"]).unwrap();
        assert!(!cli.list_models);
        assert!(!cli.only_download);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "introibrotech-bg-remover",
            "--port",
            "8080",
            "--cors-allowed-origins",
            "https://a.example,https://b.example",
            "-e",
            "tract:cpu",
            "--no-warmup",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.port, 8080);
        assert_eq!(
            cli.cors_allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(cli.execution_provider, "tract:cpu");
        assert!(cli.no_warmup);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["introibrotech-bg-remover", "--port", "99999"]).is_err());
    }
}
