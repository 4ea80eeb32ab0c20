//! End-to-end streaming through the HTTP layer

mod common;

use std::time::Duration;

use axum::{
    body::to_bytes,
    http::{header, StatusCode},
};
use tower::ServiceExt;
use tts_core::VoiceLocator;

use common::*;

fn pcm_at(body: &[u8], index: usize) -> i16 {
    let offset = 44 + index * 2;
    i16::from_le_bytes([body[offset], body[offset + 1]])
}

#[tokio::test]
async fn test_default_voice_stream() {
    let app = test_app(FakeModel::new(5));
    let response = app
        .router
        .oneshot(multipart_request("/tts", &[Part::Text("text", "Hello")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/wav");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=generated_speech.wav"
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[0..4], b"RIFF");
    assert_eq!(&body[8..12], b"WAVE");
    assert_eq!(u32::from_le_bytes(body[24..28].try_into().unwrap()), SAMPLE_RATE);
    assert_eq!(body.len(), expected_len(5));
    let expected = (SAMPLE * i16::MAX as f32) as i16;
    assert_eq!(pcm_at(&body, 0), expected);
    assert_eq!(pcm_at(&body, 5 * CHUNK_LEN - 1), expected);

    // The preloaded state was used as is.
    assert!(app.model.builds().is_empty());

    let streams = app.state.metrics.streams.stats();
    assert_eq!(streams.started, 1);
    assert_eq!(streams.completed, 1);
    assert_eq!(streams.active, 0);
    assert_eq!(streams.bytes_streamed, expected_len(5) as u64);
}

#[tokio::test]
async fn test_stream_under_api_prefix() {
    let app = test_app(FakeModel::new(2));
    let response = app
        .router
        .oneshot(multipart_request("/api/tts", &[Part::Text("text", "Hello")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len(), expected_len(2));
}

#[tokio::test]
async fn test_empty_voice_fields_mean_default() {
    let app = test_app(FakeModel::new(1));
    let response = app
        .router
        .oneshot(multipart_request(
            "/tts",
            &[
                Part::Text("text", "Hello"),
                Part::Text("voice_url", ""),
                Part::File {
                    name: "voice_wav",
                    filename: "",
                    content_type: "application/octet-stream",
                    data: b"",
                },
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(app.model.builds().is_empty());
}

#[tokio::test]
async fn test_remote_voice_is_built_truncated() {
    let app = test_app(FakeModel::new(1));
    let response = app
        .router
        .oneshot(multipart_request(
            "/tts",
            &[
                Part::Text("text", "Hello"),
                Part::Text("voice_url", "hf://kyutai/tts-voices/alba.wav"),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let builds = app.model.builds();
    assert_eq!(builds.len(), 1);
    assert_eq!(
        builds[0].locator,
        VoiceLocator::Remote("hf://kyutai/tts-voices/alba.wav".into())
    );
    assert!(builds[0].truncate);
}

#[tokio::test]
async fn test_preset_name_as_voice_url() {
    let app = test_app(FakeModel::new(1));
    let response = app
        .router
        .oneshot(multipart_request(
            "/tts",
            &[Part::Text("text", "Hello"), Part::Text("voice_url", "alba")],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(app.model.builds()[0].locator, VoiceLocator::Preset("alba".into()));
}

#[tokio::test]
async fn test_uploaded_voice_is_stored_then_removed() {
    let app = test_app(FakeModel::new(3));
    let upload = b"RIFF\x24\x00\x00\x00WAVEfmt reference";
    let response = app
        .router
        .oneshot(multipart_request(
            "/tts",
            &[
                Part::Text("text", "Hello"),
                Part::File {
                    name: "voice_wav",
                    filename: "reference.wav",
                    content_type: "audio/wav",
                    data: upload,
                },
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(body.len(), expected_len(3));

    let builds = app.model.builds();
    assert_eq!(builds.len(), 1);
    assert!(builds[0].truncate);
    let (existed, contents) = builds[0].file.clone().unwrap();
    assert!(existed);
    assert_eq!(contents, upload.to_vec());

    let VoiceLocator::File(path) = &builds[0].locator else {
        panic!("expected a file locator, got {:?}", builds[0].locator);
    };
    assert_eq!(path.extension().unwrap(), "wav");
    assert!(!path.exists());
}

#[tokio::test]
async fn test_mid_stream_failure_aborts_body() {
    let app = test_app(FakeModel::failing_after(5, 2));
    let response = app
        .router
        .oneshot(multipart_request("/tts", &[Part::Text("text", "Hello")]))
        .await
        .unwrap();

    // Headers are already committed when the model fails.
    assert_eq!(response.status(), StatusCode::OK);
    assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());

    let streams = app.state.metrics.streams.stats();
    assert_eq!(streams.failed, 1);
    assert_eq!(streams.completed, 0);
    assert_eq!(streams.bytes_streamed, expected_len(2) as u64);
}

#[tokio::test]
async fn test_dropped_response_stops_worker() {
    let capacity = 2;
    let app = test_app_with(FakeModel::new(200), |config| config.stream_queue_capacity = capacity);
    let response = app
        .router
        .oneshot(multipart_request("/tts", &[Part::Text("text", "Hello")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    drop(response);

    let streams = app.state.metrics.streams.stats();
    assert_eq!(streams.started, 1);
    assert_eq!(streams.abandoned, 1);
    assert_eq!(streams.active, 0);

    // Give the worker time to notice the closed queue, then make sure it stays stopped.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let pulled = app.model.pulled();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(app.model.pulled(), pulled);
    assert!(pulled <= capacity + 2, "worker kept generating: {pulled} chunks pulled");
}

#[tokio::test]
async fn test_oversized_upload_rejected_before_streaming() {
    let app = test_app_with(FakeModel::new(3), |config| config.max_upload_bytes = 1024);
    let upload = vec![0u8; 4096];
    let response = app
        .router
        .oneshot(multipart_request(
            "/tts",
            &[
                Part::Text("text", "Hello"),
                Part::File {
                    name: "voice_wav",
                    filename: "reference.wav",
                    content_type: "audio/wav",
                    data: &upload,
                },
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(app.model.builds().is_empty());
    assert_eq!(app.model.pulled(), 0);
    assert_eq!(app.state.metrics.streams.stats().started, 0);
}
