//! Conversion from CLI arguments to server configuration

use crate::cli::main_impl::Cli;
use crate::{
    config::{parse_provider_string, CorsPolicy, ServerConfig},
    engine::EngineConfig,
    models::ModelSpecParser,
    processor::ProcessorConfig,
};
use anyhow::{Context, Result};
use std::time::Duration;

/// Convert CLI arguments to [`ServerConfig`]
pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    pub(crate) fn from_cli(cli: &Cli) -> Result<ServerConfig> {
        let (backend_type, execution_provider) =
            parse_provider_string(&cli.execution_provider).with_context(|| {
                format!("Invalid execution provider '{}'", cli.execution_provider)
            })?;

        let model_spec = ModelSpecParser::parse(&cli.model)
            .with_context(|| format!("Invalid model '{}'", cli.model))?;

        let processor = ProcessorConfig::builder()
            .model_spec(model_spec)
            .backend_type(backend_type)
            .execution_provider(execution_provider)
            .debug(cli.verbose > 0)
            .intra_threads(cli.threads)
            .cache_dir(cli.cache_dir.clone())
            .build()?;

        let config = ServerConfig {
            host: cli.host,
            port: cli.port,
            cors: CorsPolicy::from_origins(&cli.cors_allowed_origins),
            max_upload_bytes: cli.max_upload_bytes,
            warmup: !cli.no_warmup,
            engine: EngineConfig {
                processor,
                max_pending: cli.max_pending,
                inference_timeout: Duration::from_secs(cli.inference_timeout_secs),
            },
        };
        config.validate()?;
        Ok(config)
    }
}
