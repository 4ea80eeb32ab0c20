//! Downloads Piper voices referenced by URL.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::VoiceError;

const CONFIG_SUFFIX: &str = ".onnx.json";

/// Local cache for remote voices. Every call blocks.
#[derive(Debug, Clone)]
pub(crate) struct VoiceFetcher {
    cache_dir: PathBuf,
}

impl VoiceFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Make `reference` available locally and return the path of its config.
    /// The model weights land next to it.
    pub fn fetch(&self, reference: &str) -> Result<PathBuf, VoiceError> {
        if let Some(path) = reference.strip_prefix("hf://") {
            self.fetch_hf(reference, path)
        } else if reference.starts_with("http://") || reference.starts_with("https://") {
            self.fetch_http(reference)
        } else {
            Err(VoiceError::InvalidVoiceSource(reference.to_string()))
        }
    }

    fn fetch_hf(&self, reference: &str, path: &str) -> Result<PathBuf, VoiceError> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() < 3 {
            return Err(VoiceError::InvalidVoiceSource(reference.to_string()));
        }
        let repo = format!("{}/{}", parts[0], parts[1]);
        let file = parts[2..].join("/");
        let model_file = model_name(&file).ok_or_else(|| unsupported(reference))?;

        let api = hf_hub::api::sync::ApiBuilder::from_env()
            .build()
            .map_err(|e| VoiceError::fetch_failed(reference, e))?
            .model(repo);
        let config = api.get(&file).map_err(|e| VoiceError::fetch_failed(reference, e))?;
        api.get(model_file).map_err(|e| VoiceError::fetch_failed(reference, e))?;
        Ok(config)
    }

    fn fetch_http(&self, url: &str) -> Result<PathBuf, VoiceError> {
        let model_url = model_name(url).ok_or_else(|| unsupported(url))?;
        let dir = self.cache_dir.join(cache_key(url));
        let config_path = dir.join("voice.onnx.json");
        let model_path = dir.join("voice.onnx");
        if config_path.is_file() && model_path.is_file() {
            debug!(url, dir = %dir.display(), "voice already cached");
            return Ok(config_path);
        }

        fs::create_dir_all(&dir)?;
        let client = build_http_client().map_err(|e| VoiceError::fetch_failed(url, e))?;
        download(&client, model_url, &model_path)?;
        download(&client, url, &config_path)?;
        info!(url, dir = %dir.display(), "downloaded voice");
        Ok(config_path)
    }
}

/// `x.onnx.json` -> `x.onnx`.
fn model_name(config: &str) -> Option<&str> {
    config
        .ends_with(CONFIG_SUFFIX)
        .then(|| config.trim_end_matches(".json"))
}

fn unsupported(reference: &str) -> VoiceError {
    VoiceError::UnsupportedFormat(format!("expected a Piper voice config ending in {CONFIG_SUFFIX}: {reference}"))
}

fn cache_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

fn build_http_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(concat!("tts-server/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(120))
        .build()
}

fn download(client: &Client, url: &str, dest: &Path) -> Result<(), VoiceError> {
    let mut response = client
        .get(url)
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| VoiceError::fetch_failed(url, e))?;

    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    io::copy(&mut response, &mut file).map_err(|e| VoiceError::fetch_failed(url, e))?;
    file.flush()?;
    file.persist(dest).map_err(|e| VoiceError::Io(e.error))?;
    Ok(())
}
