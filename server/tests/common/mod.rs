//! Shared fixtures for the server integration tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::{header, Request},
    Router,
};
use server::{build_router, AppState, ServerConfig};
use tts_core::{AudioChunk, AudioSpec, ChunkIter, GenerationError, SpeechModel, VoiceError, VoiceLocator};

pub const SAMPLE_RATE: u32 = 24_000;
pub const CHUNK_LEN: usize = 160;
pub const SAMPLE: f32 = 0.25;
const BOUNDARY: &str = "----tts-test-boundary";

#[derive(Debug, Clone)]
pub struct BuildCall {
    pub locator: VoiceLocator,
    pub truncate: bool,
    /// Whether a `File` locator existed while the state was built, and its contents.
    pub file: Option<(bool, Vec<u8>)>,
}

/// Model that emits `chunks` constant-valued chunks, optionally failing part way.
pub struct FakeModel {
    pub chunks: usize,
    pub fail_after: Option<usize>,
    pub builds: Mutex<Vec<BuildCall>>,
    /// Chunks handed out by `generate` so far.
    pub pulled: AtomicUsize,
}

impl FakeModel {
    pub fn new(chunks: usize) -> Self {
        Self {
            chunks,
            fail_after: None,
            builds: Mutex::new(Vec::new()),
            pulled: AtomicUsize::new(0),
        }
    }

    pub fn failing_after(chunks: usize, fail_after: usize) -> Self {
        Self {
            fail_after: Some(fail_after),
            ..Self::new(chunks)
        }
    }

    pub fn builds(&self) -> Vec<BuildCall> {
        self.builds.lock().unwrap().clone()
    }

    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }
}

impl SpeechModel for FakeModel {
    type State = String;

    fn audio_spec(&self, _state: &String) -> AudioSpec {
        AudioSpec::mono(SAMPLE_RATE)
    }

    fn presets(&self) -> Vec<String> {
        vec!["alba".to_string()]
    }

    fn build_state(&self, locator: &VoiceLocator, truncate: bool) -> Result<String, VoiceError> {
        let file = match locator {
            VoiceLocator::File(path) => Some((path.exists(), std::fs::read(path).unwrap_or_default())),
            _ => None,
        };
        self.builds.lock().unwrap().push(BuildCall {
            locator: locator.clone(),
            truncate,
            file,
        });
        match locator {
            VoiceLocator::Remote(url) if url.contains("unreachable") => {
                Err(VoiceError::fetch_failed(url.clone(), "connection refused"))
            }
            _ => Ok(locator.to_string()),
        }
    }

    fn generate<'a>(&'a self, _state: &'a String, _text: &'a str) -> Result<ChunkIter<'a>, GenerationError> {
        let mut i = 0;
        Ok(Box::new(std::iter::from_fn(move || {
            if self.fail_after == Some(i) {
                i += 1;
                return Some(Err(GenerationError::new("model exploded")));
            }
            if i >= self.chunks {
                return None;
            }
            i += 1;
            self.pulled.fetch_add(1, Ordering::SeqCst);
            Some(Ok(AudioChunk::new(vec![SAMPLE; CHUNK_LEN])))
        })))
    }
}

pub struct TestApp {
    pub router: Router,
    pub model: Arc<FakeModel>,
    pub state: AppState<FakeModel>,
    pub static_dir: tempfile::TempDir,
}

pub fn test_app(model: FakeModel) -> TestApp {
    test_app_with(model, |_| {})
}

/// Like [`test_app`], with `configure` applied on top of the default config.
pub fn test_app_with(model: FakeModel, configure: impl FnOnce(&mut ServerConfig)) -> TestApp {
    let static_dir = tempfile::tempdir().unwrap();
    std::fs::write(static_dir.path().join("index.html"), "<h1>Streaming TTS</h1>").unwrap();

    let mut config = ServerConfig {
        static_dir: PathBuf::from(static_dir.path()),
        ..ServerConfig::default()
    };
    configure(&mut config);
    let model = Arc::new(model);
    let state = AppState::new(model.clone(), Arc::new("default".to_string()), config);
    let router = build_router(state.clone()).unwrap();
    TestApp {
        router,
        model,
        state,
        static_dir,
    }
}

pub enum Part<'a> {
    Text(&'a str, &'a str),
    File {
        name: &'a str,
        filename: &'a str,
        content_type: &'a str,
        data: &'a [u8],
    },
}

/// `multipart/form-data` POST to `uri`.
pub fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes());
                body.extend_from_slice(value.as_bytes());
            }
            Part::File {
                name,
                filename,
                content_type,
                data,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

pub fn expected_len(chunks: usize) -> usize {
    44 + chunks * CHUNK_LEN * 2
}
