// Configuration for the HTTP server

use std::path::PathBuf;
use std::time::Duration;

use tts_core::DEFAULT_QUEUE_CAPACITY;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub rate_limit_per_minute: u32,
    /// Applies to voice resolution, before the first byte is streamed.
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
    pub stream_queue_capacity: usize,
    pub max_text_length: usize,
    pub max_upload_bytes: usize,
    pub voice_map: PathBuf,
    pub voice_cache_dir: PathBuf,
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            rate_limit_per_minute: 60,
            request_timeout_secs: 60,
            cors_allowed_origins: None,
            stream_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_text_length: crate::validation::MAX_TEXT_LENGTH,
            max_upload_bytes: 10 * 1024 * 1024,
            voice_map: PathBuf::from("models/voices.json"),
            voice_cache_dir: PathBuf::from(".cache/voices"),
            static_dir: PathBuf::from("server/static"),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS").ok().map(|origins| {
            origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: env_or("PORT", defaults.port),
            rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            cors_allowed_origins,
            stream_queue_capacity: env_or("STREAM_QUEUE_CAPACITY", defaults.stream_queue_capacity).max(1),
            max_text_length: env_or("MAX_TEXT_LENGTH", defaults.max_text_length),
            max_upload_bytes: env_or("MAX_UPLOAD_BYTES", defaults.max_upload_bytes),
            voice_map: env_or("VOICE_MAP", defaults.voice_map),
            voice_cache_dir: env_or("VOICE_CACHE_DIR", defaults.voice_cache_dir),
            static_dir: env_or("STATIC_DIR", defaults.static_dir),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
