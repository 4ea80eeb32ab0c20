use thiserror::Error;

/// Failures while turning a voice specifier into a conditioning state.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("Cannot provide both voice_url and voice_wav")]
    ConflictingVoiceSource,

    #[error("voice_url must start with http://, https://, or hf:// (got '{0}')")]
    InvalidVoiceSource(String),

    #[error("Failed to fetch voice from {location}: {reason}")]
    VoiceFetchFailed { location: String, reason: String },

    #[error("Unsupported voice format: {0}")]
    UnsupportedFormat(String),

    #[error("Unknown voice preset: {0}")]
    PresetNotFound(String),

    #[error("Voice state could not be built: {0}")]
    Build(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    pub fn fetch_failed(location: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        VoiceError::VoiceFetchFailed {
            location: location.into(),
            reason: reason.to_string(),
        }
    }
}

/// Error raised by a model while producing chunks.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct GenerationError(String);

impl GenerationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reason a stream ended before the model ran out of chunks.
///
/// Travels inside the end-of-stream marker, so it must be cheap to clone and
/// carry no borrowed data.
#[derive(Debug, Clone, Error)]
pub enum StreamFailure {
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("producer panicked: {0}")]
    Panicked(String),

    #[error("producer exited without closing the stream")]
    Disconnected,

    #[error("could not start stream worker: {0}")]
    Spawn(String),
}

impl From<SinkError> for StreamFailure {
    fn from(e: SinkError) -> Self {
        StreamFailure::Encoding(e.to_string())
    }
}
