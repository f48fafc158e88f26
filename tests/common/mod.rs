//! Shared helpers for integration tests: request builders, image fixtures and backend
//! factories with scripted behaviour.

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use introibrotech_bg_remover::{
    backends::MockBackend,
    config::{ExecutionProvider, RemovalConfig, ServerConfig},
    engine::{EngineConfig, SegmentationEngine},
    error::{BgRemovalError, Result},
    inference::InferenceBackend,
    models::{ModelInfo, ModelManager, PreprocessingConfig},
    processor::{BackendFactory, BackendType, ProcessorConfig},
    server::{router, AppState},
};
use ndarray::Array4;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const BOUNDARY: &str = "------------------------introibrotech7e1d";

/// One multipart part
pub struct Part<'a> {
    pub name: &'a str,
    pub file_name: Option<&'a str>,
    pub bytes: &'a [u8],
}

impl<'a> Part<'a> {
    pub fn file(name: &'a str, file_name: &'a str, bytes: &'a [u8]) -> Self {
        Self {
            name,
            file_name: Some(file_name),
            bytes,
        }
    }

    pub fn text(name: &'a str, value: &'a str) -> Self {
        Self {
            name,
            file_name: None,
            bytes: value.as_bytes(),
        }
    }
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        let mut disposition = format!("Content-Disposition: form-data; name=\"{}\"", part.name);
        if let Some(file_name) = part.file_name {
            disposition.push_str(&format!("; filename=\"{file_name}\""));
        }
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(b"\r\n");
        if part.file_name.is_some() {
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n");
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(part.bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn upload_request(parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/remove-bg")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

pub fn image_upload(file_name: &str, bytes: &[u8]) -> Request<Body> {
    upload_request(&[Part::file("image", file_name, bytes)])
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn error_message(&self) -> String {
        self.json()["error"].as_str().unwrap().to_string()
    }
}

pub async fn send(app: &Router, request: Request<Body>) -> TestResponse {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    TestResponse {
        status,
        headers,
        body,
    }
}

pub fn encoded_image(width: u32, height: u32, color: [u8; 3], format: ImageFormat) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb(color)));
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
    bytes
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encoded_image(width, height, [30, 140, 220], ImageFormat::Png)
}

pub fn mock_processor_config() -> ProcessorConfig {
    ProcessorConfig::builder()
        .backend_type(BackendType::Mock)
        .execution_provider(ExecutionProvider::Cpu)
        .build()
        .unwrap()
}

/// Server configuration on a free local port with the mock backend and no warm-up
pub fn mock_server_config() -> ServerConfig {
    ServerConfig {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        warmup: false,
        engine: EngineConfig {
            processor: mock_processor_config(),
            max_pending: 4,
            inference_timeout: Duration::from_secs(10),
        },
        ..ServerConfig::default()
    }
}

pub fn build_engine(config: EngineConfig, factory: Arc<dyn BackendFactory>) -> Arc<SegmentationEngine> {
    Arc::new(SegmentationEngine::new(config, factory).unwrap())
}

pub fn build_app(
    config: &ServerConfig,
    factory: Arc<dyn BackendFactory>,
) -> (Router, Arc<SegmentationEngine>) {
    let engine = build_engine(config.engine.clone(), factory);
    let state = AppState {
        engine: Arc::clone(&engine),
        max_upload_bytes: config.max_upload_bytes,
    };
    (router(state, config), engine)
}

/// Scripted behaviour for [`ScriptedBackendFactory`]
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Sleep inside `initialize`
    pub init_delay: Duration,
    /// Number of leading `initialize` calls that fail
    pub init_failures: usize,
    /// Sleep inside `infer` for the first `slow_infers` calls
    pub infer_delay: Duration,
    pub slow_infers: usize,
    /// Every `infer` call fails
    pub fail_infer: bool,
}

/// Factory producing mock-backed backends that follow a [`Behavior`]
#[derive(Debug, Default)]
pub struct ScriptedBackendFactory {
    behavior: Behavior,
    created: Arc<AtomicUsize>,
    init_failures_left: Arc<AtomicUsize>,
    infer_calls: Arc<AtomicUsize>,
}

impl ScriptedBackendFactory {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            init_failures_left: Arc::new(AtomicUsize::new(behavior.init_failures)),
            behavior,
            ..Self::default()
        }
    }

    /// Backends created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn infer_calls(&self) -> usize {
        self.infer_calls.load(Ordering::SeqCst)
    }
}

impl BackendFactory for ScriptedBackendFactory {
    fn create_backend(
        &self,
        _backend_type: BackendType,
        _model_manager: Option<ModelManager>,
    ) -> Result<Box<dyn InferenceBackend>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let fail_init = self
            .init_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        Ok(Box::new(ScriptedBackend {
            inner: MockBackend::new(),
            behavior: self.behavior.clone(),
            fail_init,
            infer_calls: Arc::clone(&self.infer_calls),
        }))
    }

    fn available_backends(&self) -> Vec<BackendType> {
        vec![BackendType::Mock]
    }
}

struct ScriptedBackend {
    inner: MockBackend,
    behavior: Behavior,
    fail_init: bool,
    infer_calls: Arc<AtomicUsize>,
}

impl InferenceBackend for ScriptedBackend {
    fn initialize(&mut self, config: &RemovalConfig) -> Result<Option<instant::Duration>> {
        std::thread::sleep(self.behavior.init_delay);
        if self.fail_init {
            return Err(BgRemovalError::model("simulated load failure"));
        }
        self.inner.initialize(config)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let call = self.infer_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.behavior.slow_infers {
            std::thread::sleep(self.behavior.infer_delay);
        }
        if self.behavior.fail_infer {
            return Err(BgRemovalError::inference(
                "simulated inference crash: CUDA_ERROR_ILLEGAL_ADDRESS at 0xdeadbeef",
            ));
        }
        self.inner.infer(input)
    }

    fn input_shape(&self) -> (usize, usize, usize, usize) {
        self.inner.input_shape()
    }

    fn output_shape(&self) -> (usize, usize, usize, usize) {
        self.inner.output_shape()
    }

    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig> {
        self.inner.get_preprocessing_config()
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        self.inner.get_model_info()
    }

    fn is_initialized(&self) -> bool {
        self.inner.is_initialized()
    }
}
