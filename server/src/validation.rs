use crate::error::ApiError;

/// Default maximum text length for TTS requests
pub const MAX_TEXT_LENGTH: usize = 5000;

/// Validate the text of a TTS request. Whitespace-only text counts as empty.
pub fn validate_tts_text(text: &str, max_len: usize) -> Result<(), ApiError> {
    if text.trim().is_empty() {
        return Err(ApiError::InvalidInput("Text cannot be empty".to_string()));
    }
    if text.chars().count() > max_len {
        return Err(ApiError::InvalidInput(format!(
            "Text too long (max {} characters)",
            max_len
        )));
    }
    Ok(())
}
