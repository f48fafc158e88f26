//! HTTP surface of the service

pub mod error;
pub mod handlers;
pub mod validation;

pub use error::ApiError;

use crate::config::{CorsPolicy, ServerConfig};
use crate::engine::SegmentationEngine;
use crate::error::Result;
use crate::processor::BackendFactory;
use crate::warmup::spawn_warmup;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method, Request},
    routing::{get, post},
    Router,
};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared state handed to every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub engine: Arc<SegmentationEngine>,
    pub max_upload_bytes: usize,
}

/// Build the CORS layer for a policy
#[must_use]
pub fn cors_layer(policy: &CorsPolicy) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    match policy {
        CorsPolicy::AnyOrigin => layer.allow_origin(Any),
        CorsPolicy::AllowList(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                        None
                    },
                })
                .collect();
            layer.allow_origin(AllowOrigin::list(origins))
        },
    }
}

/// Assemble the router with its middleware
pub fn router(state: AppState, config: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(handlers::health_check))
        .route("/ready", get(handlers::readiness))
        .route("/remove-bg", post(handlers::remove_bg))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors_layer(&config.cors))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::info_span!(
                    "http_request",
                    request_id = %Uuid::new_v4(),
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .with_state(state)
}

type ServerFuture = Pin<Box<dyn Future<Output = std::io::Result<()>> + Send>>;

/// A bound, ready-to-run server
pub struct Application {
    port: u16,
    engine: Arc<SegmentationEngine>,
    server: ServerFuture,
}

impl Application {
    /// Validate the configuration, create the engine and bind the listener
    ///
    /// Spawns the warm-up task when enabled. Port 0 binds a free port.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Listener cannot be bound
    pub async fn build(config: ServerConfig, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(SegmentationEngine::new(config.engine.clone(), factory)?);
        let state = AppState {
            engine: Arc::clone(&engine),
            max_upload_bytes: config.max_upload_bytes,
        };
        let app = router(state, &config);

        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            e
        })?;
        let port = listener.local_addr()?.port();
        tracing::info!(
            port,
            model = %engine.model_name(),
            backend = %config.engine.processor.backend_type,
            "Listening"
        );

        if config.warmup {
            spawn_warmup(Arc::clone(&engine));
        }

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

        Ok(Self {
            port,
            engine,
            server: Box::pin(server.into_future()),
        })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn engine(&self) -> Arc<SegmentationEngine> {
        Arc::clone(&self.engine)
    }

    /// Serve until Ctrl-C or SIGTERM
    ///
    /// # Errors
    /// - Server I/O failure
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
