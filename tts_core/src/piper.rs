//! [`SpeechModel`] backed by Piper ONNX voices.

use std::fmt;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use lru::LruCache;
use piper_rs::synth::{PiperSpeechStreamLazy, PiperSpeechSynthesizer};
use tracing::{debug, info};

use crate::catalog::VoiceCatalog;
use crate::error::{GenerationError, VoiceError};
use crate::fetch::VoiceFetcher;
use crate::{AudioChunk, AudioSpec, ChunkIter, SpeechModel, VoiceLocator};

const DEFAULT_CACHE_SIZE: usize = 8;

/// A loaded Piper voice. Cloning shares the synthesizer.
#[derive(Clone)]
pub struct PiperVoice {
    config_path: PathBuf,
    synth: Arc<RwLock<PiperSpeechSynthesizer>>,
    sample_rate: u32,
}

impl PiperVoice {
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

// PiperSpeechSynthesizer has no Debug impl
impl fmt::Debug for PiperVoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PiperVoice")
            .field("config_path", &self.config_path)
            .field("synth", &"<PiperSpeechSynthesizer>")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

pub struct PiperBackend {
    catalog: VoiceCatalog,
    fetcher: VoiceFetcher,
    cache: Mutex<LruCache<PathBuf, PiperVoice>>,
}

impl PiperBackend {
    /// `cache_dir` receives voices downloaded over HTTP.
    pub fn new(catalog: VoiceCatalog, cache_dir: impl Into<PathBuf>) -> Self {
        Self::with_cache_size(catalog, cache_dir, DEFAULT_CACHE_SIZE)
    }

    pub fn with_cache_size(catalog: VoiceCatalog, cache_dir: impl Into<PathBuf>, cache_size: usize) -> Self {
        let cap = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            catalog,
            fetcher: VoiceFetcher::new(cache_dir),
            cache: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn catalog(&self) -> &VoiceCatalog {
        &self.catalog
    }

    /// Locator for the catalog's default voice, if it has any voice at all.
    pub fn default_locator(&self) -> Option<VoiceLocator> {
        self.catalog
            .default_voice()
            .map(|name| VoiceLocator::Preset(name.to_string()))
    }

    fn config_for(&self, locator: &VoiceLocator) -> Result<PathBuf, VoiceError> {
        match locator {
            VoiceLocator::Preset(name) => self
                .catalog
                .config_path(name)
                .ok_or_else(|| VoiceError::PresetNotFound(name.clone())),
            VoiceLocator::Remote(reference) => self.fetcher.fetch(reference),
            VoiceLocator::File(path) => {
                if !path.to_string_lossy().ends_with(".onnx.json") {
                    return Err(VoiceError::UnsupportedFormat(format!(
                        "Piper voices are loaded from a .onnx.json config; reference audio ({}) cannot be used",
                        path.display()
                    )));
                }
                if !path.is_file() {
                    return Err(VoiceError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("voice config not found: {}", path.display()),
                    )));
                }
                Ok(path.clone())
            }
        }
    }

    fn load(&self, config_path: PathBuf) -> Result<PiperVoice, VoiceError> {
        {
            let mut cache = self.cache.lock().map_err(|_| VoiceError::Build("voice cache lock poisoned".into()))?;
            if let Some(voice) = cache.get(&config_path) {
                debug!(config = %config_path.display(), "voice cache hit");
                return Ok(voice.clone());
            }
        }

        // Loading can take seconds; the cache lock is not held meanwhile.
        let sample_rate = read_sample_rate(&config_path)?;
        let model = piper_rs::from_config_path(&config_path)
            .map_err(|e| VoiceError::Build(format!("piper load error: {e}")))?;
        let synth = PiperSpeechSynthesizer::new(model)
            .map_err(|e| VoiceError::Build(format!("piper synthesizer error: {e}")))?;
        info!(config = %config_path.display(), sample_rate, "loaded Piper voice");

        let voice = PiperVoice {
            config_path: config_path.clone(),
            synth: Arc::new(RwLock::new(synth)),
            sample_rate,
        };
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(config_path, voice.clone());
        }
        Ok(voice)
    }
}

impl SpeechModel for PiperBackend {
    type State = PiperVoice;

    fn audio_spec(&self, state: &PiperVoice) -> AudioSpec {
        AudioSpec::mono(state.sample_rate)
    }

    fn presets(&self) -> Vec<String> {
        self.catalog.names()
    }

    fn is_preset(&self, name: &str) -> bool {
        self.catalog.contains(name)
    }

    /// `truncate` is ignored: Piper voices carry no reference audio.
    fn build_state(&self, locator: &VoiceLocator, _truncate: bool) -> Result<PiperVoice, VoiceError> {
        let config_path = self.config_for(locator)?;
        self.load(config_path)
    }

    /// One sentence is synthesized per pull, so nothing is computed ahead
    /// of what the consumer has asked for.
    fn generate<'a>(&'a self, state: &'a PiperVoice, text: &'a str) -> Result<ChunkIter<'a>, GenerationError> {
        let synth = state
            .synth
            .read()
            .map_err(|_| GenerationError::new("synthesizer lock poisoned"))?;
        let stream: PiperSpeechStreamLazy = synth
            .synthesize_lazy(text.to_string(), None)
            .map_err(|e| GenerationError::new(format!("piper synth error: {e}")))?;
        Ok(Box::new(stream.map(|part| {
            part.map(|audio| AudioChunk::new(audio.into_vec()))
                .map_err(|e| GenerationError::new(format!("chunk error: {e}")))
        })))
    }
}

/// `audio.sample_rate` from a Piper voice config.
fn read_sample_rate(config_path: &Path) -> Result<u32, VoiceError> {
    let text = fs::read_to_string(config_path)?;
    let json: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| VoiceError::Build(format!("{} is not valid JSON: {e}", config_path.display())))?;
    json.get("audio")
        .and_then(|a| a.get("sample_rate"))
        .and_then(|sr| sr.as_u64())
        .and_then(|sr| u32::try_from(sr).ok())
        .ok_or_else(|| VoiceError::Build("Missing or invalid 'audio.sample_rate' in config".into()))
}
