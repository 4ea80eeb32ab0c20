//! Voice resolution and streaming synthesis plumbing.
//!
//! A [`SpeechModel`] produces audio lazily on a worker thread. The
//! [`StreamingBridge`] moves the encoded bytes through a bounded queue to
//! whoever is writing the response, and the [`VoiceResolver`] decides which
//! conditioning state a request is synthesized with.

mod bridge;
mod catalog;
mod error;
mod sink;
mod voice;
mod wav;

#[cfg(feature = "piper")]
mod fetch;
#[cfg(feature = "piper")]
mod piper;

pub use bridge::{SessionState, StreamSession, StreamSummary, StreamingBridge, DEFAULT_QUEUE_CAPACITY};
pub use catalog::{VoiceCatalog, VoiceEntry};
pub use error::{GenerationError, SinkError, StreamFailure, VoiceError};
pub use sink::{ChunkSink, FileSink, QueueSink, StreamItem};
pub use voice::{UploadedVoice, VoiceLocator, VoiceResolver, VoiceSpecifier};
pub use wav::WavStreamEncoder;

#[cfg(feature = "piper")]
pub use piper::{PiperBackend, PiperVoice};

/// Sample layout shared by every chunk of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSpec {
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }
}

/// One unit of generated audio: interleaved samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Lazy, finite, non-restartable chunk sequence returned by [`SpeechModel::generate`].
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<AudioChunk, GenerationError>> + 'a>;

/// A loaded text-to-speech model.
///
/// `build_state` and `generate` may block for a long time (network, disk,
/// inference); callers run them off the async executor. `generate` is always
/// called on the session's worker thread, so the returned iterator does not
/// need to be `Send`.
pub trait SpeechModel: Send + Sync + 'static {
    /// Conditioning derived from a reference voice. Immutable once built.
    type State: Send + Sync + 'static;

    fn audio_spec(&self, state: &Self::State) -> AudioSpec;

    /// Names accepted as [`VoiceLocator::Preset`].
    fn presets(&self) -> Vec<String>;

    fn is_preset(&self, name: &str) -> bool {
        self.presets().iter().any(|p| p == name)
    }

    fn build_state(&self, locator: &VoiceLocator, truncate: bool) -> Result<Self::State, VoiceError>;

    fn generate<'a>(&'a self, state: &'a Self::State, text: &'a str) -> Result<ChunkIter<'a>, GenerationError>;
}

#[cfg(test)]
pub(crate) mod testing;
