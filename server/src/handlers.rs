use std::io;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Multipart, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{info, warn};
use tts_core::{SpeechModel, StreamSession, VoiceEntry, VoiceSpecifier};

use crate::app::AppState;
use crate::error::ApiError;
use crate::form::TtsForm;
use crate::metrics::{DetailedMetricsResponse, EndpointMetricsResponse, StreamGuard, SystemMetrics};
use crate::validation::validate_tts_text;

pub const OUTPUT_FILENAME: &str = "generated_speech.wav";

pub static START_TIME: OnceLock<Instant> = OnceLock::new();

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

pub async fn index<M: SpeechModel>(State(state): State<AppState<M>>, request: Request) -> Response {
    let path = state.config.static_dir.join("index.html");
    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

#[derive(Serialize)]
pub struct VoiceInfo {
    pub name: String,
    #[serde(flatten)]
    pub entry: Option<VoiceEntry>,
}

pub async fn list_voices<M: SpeechModel>(State(state): State<AppState<M>>) -> Json<Vec<VoiceInfo>> {
    let voices = state
        .model
        .presets()
        .into_iter()
        .map(|name| {
            let entry = state.catalog.as_ref().and_then(|c| c.get(&name).cloned());
            VoiceInfo { name, entry }
        })
        .collect();
    Json(voices)
}

/// `POST /tts`: multipart `text` plus optional `voice_url` or `voice_wav`.
/// Answers with a chunked WAV stream.
pub async fn tts_endpoint<M: SpeechModel>(
    State(state): State<AppState<M>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();

    let result = start_stream(&state, multipart).await;
    match &result {
        Ok(_) => state.metrics.tts.record_request(started.elapsed()),
        Err(_) => state.metrics.tts.record_error(),
    }
    result
}

async fn start_stream<M: SpeechModel>(state: &AppState<M>, multipart: Multipart) -> Result<Response, ApiError> {
    let form = TtsForm::from_multipart(multipart).await?;
    validate_tts_text(&form.text, state.config.max_text_length)?;

    let spec = VoiceSpecifier::from_request(form.voice_url, form.voice_wav)?;
    state.resolver.validate(&spec)?;
    info!(
        "TTS request: {} chars, voice: {}",
        form.text.chars().count(),
        describe(&spec)
    );

    let voice = if spec.is_default() {
        state.resolver.default_state().clone()
    } else {
        let resolver = state.resolver.clone();
        tokio::task::spawn_blocking(move || resolver.resolve(spec))
            .await
            .map_err(|e| ApiError::InternalError(format!("voice resolution task failed: {e}")))??
    };

    let session = state
        .bridge
        .start(voice, form.text)
        .map_err(|e| ApiError::InternalError(format!("failed to start stream worker: {e}")))?;
    let guard = state.metrics.streams.begin();

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/wav")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={OUTPUT_FILENAME}"),
        )
        .body(Body::from_stream(body_stream(session, guard)))
        .map_err(|e| ApiError::InternalError(e.to_string()))?)
}

fn describe(spec: &VoiceSpecifier) -> String {
    match spec {
        VoiceSpecifier::Default => "default".to_string(),
        VoiceSpecifier::Preset(name) => format!("preset {name}"),
        VoiceSpecifier::Remote(url) => url.clone(),
        VoiceSpecifier::Upload(upload) => format!("upload ({} bytes)", upload.bytes.len()),
    }
}

/// Forwards session chunks to the HTTP body. A producer failure surfaces as a
/// body error, which aborts the chunked response instead of ending it cleanly.
/// Dropping the stream (client gone) drops the session and stops the worker.
fn body_stream(
    mut session: StreamSession,
    guard: StreamGuard,
) -> impl futures_core::Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut first = true;
        while let Some(chunk) = session.next().await {
            if first {
                guard.first_chunk(session.summary().first_chunk_after.unwrap_or_default());
                first = false;
            }
            guard.add_bytes(chunk.len());
            yield Ok::<Bytes, io::Error>(chunk);
        }
        match session.finish().await {
            Ok(_) => guard.complete(),
            Err(failure) => {
                warn!("stream ended with error: {failure}");
                guard.fail();
                yield Err(io::Error::other(failure));
            }
        }
    }
}

pub async fn metrics_endpoint<M: SpeechModel>(State(state): State<AppState<M>>) -> Json<DetailedMetricsResponse> {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    // Average across all cores
    let cpu_usage = system.global_cpu_info().cpu_usage();

    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let uptime = START_TIME.get().map(|start| start.elapsed().as_secs()).unwrap_or(0);

    // Unix-like systems only
    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|loadavg| loadavg.split_whitespace().next().and_then(|s| s.parse::<f64>().ok()))
        }
        #[cfg(not(unix))]
        None
    };

    Json(DetailedMetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics {
            cpu_usage_percent: cpu_usage,
            memory_used_mb: memory_used / 1024 / 1024,
            memory_total_mb: memory_total / 1024 / 1024,
            memory_usage_percent,
            request_count: state.request_count.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            system_load,
        },
        endpoints: EndpointMetricsResponse {
            tts: state.metrics.tts.stats(),
        },
        streams: state.metrics.streams.stats(),
    })
}
