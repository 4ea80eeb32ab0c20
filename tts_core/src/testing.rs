//! In-memory model used by the unit tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{AudioChunk, AudioSpec, ChunkIter, GenerationError, SpeechModel, VoiceError, VoiceLocator};

#[derive(Debug, Clone)]
pub(crate) struct BuildCall {
    pub locator: VoiceLocator,
    pub truncate: bool,
    /// Contents of the file when the locator pointed at one.
    pub file_contents: Option<Vec<u8>>,
}

pub(crate) struct ScriptedModel {
    pub chunks: usize,
    pub fail_after: Option<usize>,
    pub panic_after: Option<usize>,
    pub build_error: Option<fn(&VoiceLocator) -> VoiceError>,
    pub presets: Vec<String>,
    pub pulled: Arc<AtomicUsize>,
    pub builds: Mutex<Vec<BuildCall>>,
}

impl ScriptedModel {
    pub const SAMPLE_RATE: u32 = 16_000;
    pub const CHUNK_LEN: usize = 8;

    pub fn with_chunks(chunks: usize) -> Self {
        Self {
            chunks,
            fail_after: None,
            panic_after: None,
            build_error: None,
            presets: vec!["alba".to_string()],
            pulled: Arc::new(AtomicUsize::new(0)),
            builds: Mutex::new(Vec::new()),
        }
    }

    fn sample(i: usize) -> f32 {
        (i + 1) as f32 * 0.01
    }

    /// First PCM value of chunk `i` after encoding.
    pub fn expected_pcm(i: usize) -> i16 {
        (Self::sample(i) * i16::MAX as f32) as i16
    }

    pub fn builds(&self) -> Vec<BuildCall> {
        self.builds.lock().unwrap().clone()
    }

    pub fn built_paths(&self) -> Vec<PathBuf> {
        self.builds()
            .into_iter()
            .filter_map(|c| match c.locator {
                VoiceLocator::File(p) => Some(p),
                _ => None,
            })
            .collect()
    }
}

impl SpeechModel for ScriptedModel {
    type State = String;

    fn audio_spec(&self, _state: &String) -> AudioSpec {
        AudioSpec::mono(Self::SAMPLE_RATE)
    }

    fn presets(&self) -> Vec<String> {
        self.presets.clone()
    }

    fn build_state(&self, locator: &VoiceLocator, truncate: bool) -> Result<String, VoiceError> {
        let file_contents = match locator {
            VoiceLocator::File(p) => std::fs::read(p).ok(),
            _ => None,
        };
        self.builds.lock().unwrap().push(BuildCall {
            locator: locator.clone(),
            truncate,
            file_contents,
        });
        match self.build_error {
            Some(make) => Err(make(locator)),
            None => Ok(locator.to_string()),
        }
    }

    fn generate<'a>(&'a self, _state: &'a String, _text: &'a str) -> Result<ChunkIter<'a>, GenerationError> {
        let mut i = 0;
        Ok(Box::new(std::iter::from_fn(move || {
            if self.panic_after == Some(i) {
                panic!("scripted panic at chunk {i}");
            }
            if self.fail_after == Some(i) {
                i += 1;
                return Some(Err(GenerationError::new("scripted failure")));
            }
            if i >= self.chunks {
                return None;
            }
            let chunk = AudioChunk::new(vec![Self::sample(i); Self::CHUNK_LEN]);
            i += 1;
            self.pulled.fetch_add(1, Ordering::SeqCst);
            Some(Ok(chunk))
        })))
    }
}
