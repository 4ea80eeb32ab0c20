//! Multipart body of `POST /tts`.

use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::StatusCode;
use tts_core::UploadedVoice;

use crate::error::ApiError;

#[derive(Debug)]
pub struct TtsForm {
    pub text: String,
    /// Empty strings are treated as absent.
    pub voice_url: Option<String>,
    /// Zero-length uploads are treated as absent.
    pub voice_wav: Option<UploadedVoice>,
}

impl TtsForm {
    pub async fn from_multipart(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut text: Option<String> = None;
        let mut voice_url: Option<String> = None;
        let mut voice_wav: Option<UploadedVoice> = None;

        while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or("").to_string();
            match name.as_str() {
                "text" => text = Some(field.text().await.map_err(multipart_error)?),
                "voice_url" => {
                    let value = field.text().await.map_err(multipart_error)?;
                    let value = value.trim();
                    voice_url = (!value.is_empty()).then(|| value.to_string());
                }
                "voice_wav" => {
                    let file_name = field.file_name().map(str::to_string);
                    let content_type = field.content_type().map(str::to_string);
                    let bytes = field.bytes().await.map_err(multipart_error)?;
                    voice_wav = (!bytes.is_empty()).then(|| {
                        UploadedVoice::from_upload(bytes, file_name.as_deref(), content_type.as_deref())
                    });
                }
                other => tracing::debug!("ignoring multipart field '{}'", other),
            }
        }

        let text = text.ok_or_else(|| ApiError::InvalidInput("Missing 'text' field".to_string()))?;
        Ok(Self {
            text,
            voice_url,
            voice_wav,
        })
    }
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(e.body_text())
    } else {
        ApiError::InvalidInput(format!("invalid multipart: {}", e.body_text()))
    }
}
