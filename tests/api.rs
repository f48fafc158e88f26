//! HTTP contract of the service, driven in-process through the router

mod common;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use common::*;
use image::{GenericImageView, ImageFormat};
use introibrotech_bg_remover::{
    config::{CorsPolicy, ServerConfig},
    processor::DefaultBackendFactory,
    server::Application,
};
use std::sync::Arc;
use std::time::Duration;

fn mock_app() -> axum::Router {
    build_app(&mock_server_config(), Arc::new(DefaultBackendFactory)).0
}

#[tokio::test]
async fn health_check_is_unconditional() {
    let response = send(&mock_app(), get("/")).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(
        response.json(),
        serde_json::json!({
            "status": "OK",
            "message": "Introibrotech BG Remover API is running!"
        })
    );
}

#[tokio::test]
async fn missing_image_field_is_rejected() {
    let app = mock_app();
    let png = png_bytes(4, 4);

    let cases = [
        upload_request(&[Part::file("photo", "a.png", &png)]),
        upload_request(&[Part::text("image", "a.png")]),
    ];
    for request in cases {
        let response = send(&app, request).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.error_message(), "No file uploaded");
    }
}

#[tokio::test]
async fn non_multipart_request_counts_as_no_file() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/remove-bg")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"image": "a.png"}"#))
        .unwrap();

    let response = send(&mock_app(), request).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.error_message(), "No file uploaded");
}

#[tokio::test]
async fn empty_file_name_is_rejected() {
    let response = send(&mock_app(), image_upload("", &png_bytes(4, 4))).await;

    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.error_message(), "No selected file");
}

#[tokio::test]
async fn disallowed_extensions_are_rejected() {
    let app = mock_app();
    let png = png_bytes(4, 4);

    for name in ["cat.gif", "notes.txt", "png", "image.png.exe", "photo.bmp"] {
        let response = send(&app, image_upload(name, &png)).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{name}");
        assert!(
            response.error_message().starts_with("Invalid file type"),
            "{name}: {}",
            response.error_message()
        );
    }
}

#[tokio::test]
async fn valid_png_returns_transparent_png_attachment() {
    let response = send(&mock_app(), image_upload("Holiday.PNG", &png_bytes(24, 16))).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers[header::CONTENT_TYPE], "image/png");
    assert_eq!(
        response.headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"introibrotech-bg-removed.png\""
    );

    let decoded = image::load_from_memory_with_format(&response.body, ImageFormat::Png).unwrap();
    assert!(decoded.color().has_alpha());
    assert_eq!(decoded.dimensions(), (24, 16));
}

#[tokio::test]
async fn uniform_red_jpeg_has_consistent_corners() {
    let jpeg = encoded_image(10, 10, [255, 0, 0], ImageFormat::Jpeg);
    let response = send(&mock_app(), image_upload("x.jpg", &jpeg)).await;

    assert_eq!(response.status, StatusCode::OK);
    let decoded = image::load_from_memory(&response.body).unwrap();
    assert!(decoded.color().has_alpha());
    assert_eq!(decoded.dimensions(), (10, 10));

    let corners = [(0, 0), (9, 0), (0, 9), (9, 9)].map(|(x, y)| decoded.get_pixel(x, y).0[3]);
    assert!(corners.iter().all(|&alpha| alpha == corners[0]));
    assert!(corners[0] == 0 || corners[0] == 255);
}

#[tokio::test]
async fn misnamed_file_is_decoded_by_content() {
    let jpeg = encoded_image(8, 6, [10, 200, 10], ImageFormat::Jpeg);
    let response = send(&mock_app(), image_upload("really-a-jpeg.webp", &jpeg)).await;

    assert_eq!(response.status, StatusCode::OK);
    let decoded = image::load_from_memory(&response.body).unwrap();
    assert_eq!(decoded.dimensions(), (8, 6));
}

#[tokio::test]
async fn undecodable_upload_returns_generic_500() {
    let response = send(
        &mock_app(),
        image_upload("broken.png", b"\x89PNG\r\n\x1a\nthis is not really a png"),
    )
    .await;

    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        response.error_message(),
        "An internal server error occurred. Please try again."
    );
}

#[tokio::test]
async fn inference_failure_does_not_leak_detail() {
    let factory = Arc::new(ScriptedBackendFactory::new(Behavior {
        fail_infer: true,
        ..Behavior::default()
    }));
    let (app, _) = build_app(&mock_server_config(), factory);

    let response = send(&app, image_upload("a.png", &png_bytes(8, 8))).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);

    let body = String::from_utf8_lossy(&response.body);
    assert!(body.contains("internal server error"));
    assert!(!body.contains("CUDA"));
    assert!(!body.contains("simulated"));
}

#[tokio::test]
async fn oversized_upload_is_rejected_with_413() {
    let config = ServerConfig {
        max_upload_bytes: 1024,
        ..mock_server_config()
    };
    let (app, _) = build_app(&config, Arc::new(DefaultBackendFactory));

    let response = send(&app, image_upload("big.png", &vec![7u8; 8 * 1024])).await;
    assert_eq!(response.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(response
        .error_message()
        .starts_with("Uploaded file is too large"));
}

#[tokio::test]
async fn full_engine_answers_503_with_retry_after() {
    let mut config = mock_server_config();
    config.engine.max_pending = 1;
    let factory = Arc::new(ScriptedBackendFactory::new(Behavior {
        infer_delay: Duration::from_millis(1500),
        slow_infers: 1,
        ..Behavior::default()
    }));
    let (app, _) = build_app(&config, factory);

    let first = {
        let app = app.clone();
        tokio::spawn(async move { send(&app, image_upload("a.png", &png_bytes(8, 8))).await })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;

    let rejected = send(&app, image_upload("b.png", &png_bytes(8, 8))).await;
    assert_eq!(rejected.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(rejected.headers.contains_key(header::RETRY_AFTER));
    assert!(rejected.error_message().starts_with("Server is busy"));

    assert_eq!(first.await.unwrap().status, StatusCode::OK);
}

#[tokio::test]
async fn slow_inference_answers_504() {
    let mut config = mock_server_config();
    config.engine.inference_timeout = Duration::from_millis(200);
    let factory = Arc::new(ScriptedBackendFactory::new(Behavior {
        infer_delay: Duration::from_millis(1000),
        slow_infers: usize::MAX,
        ..Behavior::default()
    }));
    let (app, _) = build_app(&config, factory);

    let response = send(&app, image_upload("a.png", &png_bytes(8, 8))).await;
    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    assert!(response.error_message().contains("timed out"));
}

#[tokio::test]
async fn readiness_follows_model_state() {
    let app = mock_app();

    let cold = send(&app, get("/ready")).await;
    assert_eq!(cold.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(cold.json()["status"], "COLD");
    assert_eq!(cold.json()["model"], "mock");

    let processed = send(&app, image_upload("a.png", &png_bytes(8, 8))).await;
    assert_eq!(processed.status, StatusCode::OK);

    let ready = send(&app, get("/ready")).await;
    assert_eq!(ready.status, StatusCode::OK);
    assert_eq!(ready.json()["status"], "READY");
    assert!(ready.json()["loaded_at"].is_string());
}

fn preflight(origin: &str) -> Request<Body> {
    Request::builder()
        .method(Method::OPTIONS)
        .uri("/remove-bg")
        .header(header::ORIGIN, origin)
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn cors_allow_list_only_admits_listed_origins() {
    let app = mock_app();

    let allowed = send(&app, preflight("https://ibrahimwebflow.github.io")).await;
    assert_eq!(
        allowed.headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://ibrahimwebflow.github.io"
    );

    let denied = send(&app, preflight("https://evil.example")).await;
    assert!(!denied
        .headers
        .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
}

#[tokio::test]
async fn cors_any_origin() {
    let config = ServerConfig {
        cors: CorsPolicy::from_origins(&["*"]),
        ..mock_server_config()
    };
    let (app, _) = build_app(&config, Arc::new(DefaultBackendFactory));

    let response = send(&app, preflight("https://anywhere.example")).await;
    assert_eq!(response.headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn application_serves_over_tcp() {
    let config = ServerConfig {
        warmup: true,
        ..mock_server_config()
    };
    let app = Application::build(config, Arc::new(DefaultBackendFactory))
        .await
        .unwrap();
    let port = app.port();
    assert_ne!(port, 0);
    tokio::spawn(app.run_until_stopped());

    let client = reqwest::Client::new();
    let health: serde_json::Value = client
        .get(format!("http://127.0.0.1:{port}/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "OK");

    let form = reqwest::multipart::Form::new().part(
        "image",
        reqwest::multipart::Part::bytes(png_bytes(12, 12)).file_name("tcp.png"),
    );
    let response = client
        .post(format!("http://127.0.0.1:{port}/remove-bg"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let bytes = response.bytes().await.unwrap();
    assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (12, 12));
}
