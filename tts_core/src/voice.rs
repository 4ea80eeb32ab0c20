use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::error::VoiceError;
use crate::SpeechModel;

/// Reference prefixes accepted for remote voices.
pub const REMOTE_SCHEMES: &[&str] = &["http://", "https://", "hf://"];

fn has_remote_scheme(reference: &str) -> bool {
    REMOTE_SCHEMES.iter().any(|s| reference.starts_with(s))
}

/// What a model's state-builder is asked to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceLocator {
    Preset(String),
    Remote(String),
    File(PathBuf),
}

impl VoiceLocator {
    /// Interpret a voice argument given on the command line or in config:
    /// remote references by scheme, then known presets, otherwise a path.
    pub fn parse(raw: &str, is_preset: impl Fn(&str) -> bool) -> Self {
        if has_remote_scheme(raw) {
            VoiceLocator::Remote(raw.to_string())
        } else if is_preset(raw) {
            VoiceLocator::Preset(raw.to_string())
        } else {
            VoiceLocator::File(PathBuf::from(raw))
        }
    }
}

impl fmt::Display for VoiceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceLocator::Preset(name) => write!(f, "preset:{name}"),
            VoiceLocator::Remote(url) => f.write_str(url),
            VoiceLocator::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Reference audio uploaded with a request.
#[derive(Debug, Clone)]
pub struct UploadedVoice {
    pub bytes: Bytes,
    /// Declared container format, used as the temp file extension.
    pub format: String,
}

impl UploadedVoice {
    pub fn new(bytes: impl Into<Bytes>, format: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            format: format.into(),
        }
    }

    pub fn wav(bytes: impl Into<Bytes>) -> Self {
        Self::new(bytes, "wav")
    }

    /// Derive the format from an upload's file name or content type, falling back to WAV.
    pub fn from_upload(bytes: impl Into<Bytes>, file_name: Option<&str>, content_type: Option<&str>) -> Self {
        let from_name = file_name
            .and_then(|n| n.rsplit_once('.'))
            .map(|(_, ext)| ext.to_string());
        let from_type = content_type
            .and_then(|t| t.strip_prefix("audio/"))
            .map(|sub| sub.trim_start_matches("x-").to_string());
        let format = from_name.or(from_type).unwrap_or_else(|| "wav".to_string());
        Self::new(bytes, format)
    }

    /// File extension with anything but ASCII alphanumerics removed.
    pub fn extension(&self) -> String {
        let ext: String = self
            .format
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect::<String>()
            .to_ascii_lowercase();
        if ext.is_empty() {
            "wav".to_string()
        } else {
            ext
        }
    }
}

/// Which voice a request wants.
#[derive(Debug, Clone)]
pub enum VoiceSpecifier {
    Default,
    Preset(String),
    Remote(String),
    Upload(UploadedVoice),
}

impl VoiceSpecifier {
    /// Combine the two mutually exclusive request inputs.
    pub fn from_request(voice_url: Option<String>, voice_wav: Option<UploadedVoice>) -> Result<Self, VoiceError> {
        match (voice_url, voice_wav) {
            (Some(_), Some(_)) => Err(VoiceError::ConflictingVoiceSource),
            (Some(url), None) => Ok(VoiceSpecifier::Remote(url)),
            (None, Some(upload)) => Ok(VoiceSpecifier::Upload(upload)),
            (None, None) => Ok(VoiceSpecifier::Default),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, VoiceSpecifier::Default)
    }
}

/// Turns a [`VoiceSpecifier`] into a conditioning state.
pub struct VoiceResolver<M: SpeechModel> {
    model: Arc<M>,
    default_state: Arc<M::State>,
    temp_dir: Option<PathBuf>,
}

impl<M: SpeechModel> Clone for VoiceResolver<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            default_state: self.default_state.clone(),
            temp_dir: self.temp_dir.clone(),
        }
    }
}

impl<M: SpeechModel> VoiceResolver<M> {
    pub fn new(model: Arc<M>, default_state: Arc<M::State>) -> Self {
        Self {
            model,
            default_state,
            temp_dir: None,
        }
    }

    /// Directory for uploaded reference audio; the system temp dir otherwise.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn default_state(&self) -> &Arc<M::State> {
        &self.default_state
    }

    /// Checks that need no I/O. `resolve` runs them too; callers use this to
    /// reject bad input before moving work off the executor.
    pub fn validate(&self, spec: &VoiceSpecifier) -> Result<(), VoiceError> {
        match spec {
            VoiceSpecifier::Remote(reference) => self.locate_reference(reference).map(|_| ()),
            VoiceSpecifier::Preset(name) if !self.model.is_preset(name) => {
                Err(VoiceError::PresetNotFound(name.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Build (or reuse) the state for `spec`. May block on network or disk
    /// except for [`VoiceSpecifier::Default`].
    pub fn resolve(&self, spec: VoiceSpecifier) -> Result<Arc<M::State>, VoiceError> {
        self.validate(&spec)?;
        match spec {
            VoiceSpecifier::Default => Ok(self.default_state.clone()),
            VoiceSpecifier::Preset(name) => self.build(&VoiceLocator::Preset(name)),
            VoiceSpecifier::Remote(reference) => {
                let locator = self.locate_reference(&reference)?;
                info!("Using voice from URL: {}", reference);
                self.build(&locator)
            }
            VoiceSpecifier::Upload(upload) => self.resolve_upload(&upload),
        }
    }

    fn locate_reference(&self, reference: &str) -> Result<VoiceLocator, VoiceError> {
        if has_remote_scheme(reference) {
            Ok(VoiceLocator::Remote(reference.to_string()))
        } else if self.model.is_preset(reference) {
            Ok(VoiceLocator::Preset(reference.to_string()))
        } else {
            Err(VoiceError::InvalidVoiceSource(reference.to_string()))
        }
    }

    fn build(&self, locator: &VoiceLocator) -> Result<Arc<M::State>, VoiceError> {
        self.model.build_state(locator, true).map(Arc::new)
    }

    fn resolve_upload(&self, upload: &UploadedVoice) -> Result<Arc<M::State>, VoiceError> {
        let suffix = format!(".{}", upload.extension());
        let mut builder = tempfile::Builder::new();
        builder.prefix("voice-").suffix(&suffix);
        // Dropping the handle on any early return (or unwind) deletes the file.
        let mut file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(&upload.bytes)?;
        file.flush()?;

        let path = file.path().to_path_buf();
        debug!(path = %path.display(), bytes = upload.bytes.len(), "stored uploaded voice");
        let result = self.build(&VoiceLocator::File(path.clone()));

        if let Err(e) = file.close() {
            warn!(path = %path.display(), "failed to delete uploaded voice file: {e}");
        }
        result
    }
}
