//! HTTP error responses
//!
//! Every failure leaves the server as `{"error": "..."}`. Processing failures carry a fixed
//! generic message; the underlying error is only logged.

use crate::engine::EngineError;
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Seconds a client is asked to wait after a busy response
pub const RETRY_AFTER_SECS: u64 = 5;

/// Generic message for processing failures
pub const INTERNAL_ERROR_MESSAGE: &str = "An internal server error occurred. Please try again.";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No file uploaded")]
    NoFileUploaded,

    #[error("No selected file")]
    NoSelectedFile,

    #[error("Invalid file type. Please upload one of: .png, .jpg, .jpeg, .webp")]
    InvalidFileType,

    #[error("Uploaded file is too large. Maximum size is {limit_bytes} bytes.")]
    PayloadTooLarge { limit_bytes: usize },

    #[error("Failed to read uploaded file")]
    UnreadableUpload,

    #[error("Server is busy. Please retry shortly.")]
    Busy,

    #[error("Image processing timed out. Please try a smaller image.")]
    Timeout,

    #[error("An internal server error occurred. Please try again.")]
    Internal,
}

impl ApiError {
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoFileUploaded
            | Self::NoSelectedFile
            | Self::InvalidFileType
            | Self::UnreadableUpload => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Busy => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Busy => Self::Busy,
            EngineError::Timeout(_) => Self::Timeout,
            EngineError::Failed(_) => Self::Internal,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry = matches!(self, Self::Busy);

        let mut response = (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response();

        if retry {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(RETRY_AFTER_SECS),
            );
        }
        response
    }
}
