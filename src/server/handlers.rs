use super::{error::ApiError, validation::validate_file_name, AppState};
use crate::engine::{EngineError, ModelState};
use crate::services::UploadedImage;
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, info, warn};

/// Multipart field carrying the image
pub const IMAGE_FIELD: &str = "image";

/// File name offered to the client for the result
pub const RESULT_FILE_NAME: &str = "introibrotech-bg-removed.png";

pub const HEALTH_MESSAGE: &str = "Introibrotech BG Remover API is running!";

/// Liveness probe; independent of model state
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "OK",
        "message": HEALTH_MESSAGE,
    }))
}

/// Readiness probe; 200 only once the model is loaded
pub async fn readiness(State(state): State<AppState>) -> Response {
    let model = state.engine.model_name();
    match state.engine.state() {
        ModelState::Ready { loaded_at } => Json(json!({
            "status": "READY",
            "model": model,
            "loaded_at": loaded_at.to_rfc3339(),
        }))
        .into_response(),
        other => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": other.status(),
                "model": model,
            })),
        )
            .into_response(),
    }
}

pub async fn remove_bg(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let Ok(mut multipart) = multipart else {
        return Err(ApiError::NoFileUploaded);
    };

    let upload = read_image_field(&mut multipart, state.max_upload_bytes).await?;
    let file_name = upload.file_name.clone();
    info!(file_name = %file_name, bytes = upload.bytes.len(), "Starting background removal");

    let removed = state
        .engine
        .remove_background(upload)
        .await
        .map_err(|e| {
            match &e {
                EngineError::Busy => warn!(file_name = %file_name, "Rejected, engine at capacity"),
                EngineError::Timeout(limit) => {
                    warn!(file_name = %file_name, timeout = ?limit, "Background removal timed out");
                },
                EngineError::Failed(cause) => {
                    error!(file_name = %file_name, error = ?cause, "Unexpected error in /remove-bg");
                },
            }
            ApiError::from(e)
        })?;

    info!(
        file_name = %file_name,
        width = removed.dimensions.0,
        height = removed.dimensions.1,
        timings = %removed.timings.summary(),
        "Background removal successful"
    );
    Ok(png_attachment(removed.png))
}

/// Find the `image` file field and read it
///
/// A field only counts as an uploaded file when it carries a file name.
async fn read_image_field(
    multipart: &mut Multipart,
    limit_bytes: usize,
) -> Result<UploadedImage, ApiError> {
    loop {
        let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| multipart_error(&e, limit_bytes))?
        else {
            return Err(ApiError::NoFileUploaded);
        };

        if field.name() != Some(IMAGE_FIELD) || field.file_name().is_none() {
            continue;
        }

        let file_name = validate_file_name(field.file_name())?.to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(&e, limit_bytes))?;
        return Ok(UploadedImage::new(file_name, bytes.to_vec()));
    }
}

fn multipart_error(err: &MultipartError, limit_bytes: usize) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge { limit_bytes }
    } else {
        warn!(error = %err.body_text(), "Malformed multipart upload");
        ApiError::UnreadableUpload
    }
}

fn png_attachment(png: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "image/png".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{RESULT_FILE_NAME}\""),
            ),
        ],
        png,
    )
        .into_response()
}
