use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tts_core::VoiceError;

/// API Error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Voice(#[from] VoiceError),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Voice(e) => voice_status(e),
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn voice_status(e: &VoiceError) -> StatusCode {
    match e {
        VoiceError::ConflictingVoiceSource | VoiceError::InvalidVoiceSource(_) => StatusCode::BAD_REQUEST,
        VoiceError::VoiceFetchFailed { .. } => StatusCode::BAD_GATEWAY,
        VoiceError::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        VoiceError::PresetNotFound(_) => StatusCode::NOT_FOUND,
        VoiceError::Build(_) | VoiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error response structure
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_message = match self {
            ApiError::InvalidInput(msg) | ApiError::PayloadTooLarge(msg) => msg,
            ApiError::Voice(e) => {
                if status.is_server_error() {
                    tracing::error!("Voice error: {}", e);
                } else {
                    tracing::warn!("Rejected voice: {}", e);
                }
                e.to_string()
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                msg
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}
