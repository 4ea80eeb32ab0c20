//! HTTP front end for streaming text-to-speech.

pub mod app;
pub mod config;
pub mod error;
pub mod form;
pub mod handlers;
pub mod metrics;
pub mod validation;

pub use app::{build_router, AppState};
pub use config::ServerConfig;
pub use error::ApiError;
