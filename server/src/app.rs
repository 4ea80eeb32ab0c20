use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request},
    http::{HeaderValue, Method},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};
use tts_core::{SpeechModel, StreamingBridge, VoiceCatalog, VoiceResolver};

use crate::config::ServerConfig;
use crate::handlers;
use crate::metrics::AppMetrics;

/// Shared by every request handler.
pub struct AppState<M: SpeechModel> {
    pub model: Arc<M>,
    pub resolver: VoiceResolver<M>,
    pub bridge: StreamingBridge<M>,
    pub catalog: Option<Arc<VoiceCatalog>>,
    pub metrics: Arc<AppMetrics>,
    pub request_count: Arc<AtomicU64>,
    pub config: Arc<ServerConfig>,
}

impl<M: SpeechModel> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            resolver: self.resolver.clone(),
            bridge: self.bridge.clone(),
            catalog: self.catalog.clone(),
            metrics: self.metrics.clone(),
            request_count: self.request_count.clone(),
            config: self.config.clone(),
        }
    }
}

impl<M: SpeechModel> AppState<M> {
    /// `default_state` is the preloaded voice used when a request names none.
    pub fn new(model: Arc<M>, default_state: Arc<M::State>, config: ServerConfig) -> Self {
        let resolver = VoiceResolver::new(model.clone(), default_state);
        let bridge = StreamingBridge::with_capacity(model.clone(), config.stream_queue_capacity);
        Self {
            model,
            resolver,
            bridge,
            catalog: None,
            metrics: Arc::new(AppMetrics::new()),
            request_count: Arc::new(AtomicU64::new(0)),
            config: Arc::new(config),
        }
    }

    pub fn with_catalog(mut self, catalog: VoiceCatalog) -> Self {
        self.catalog = Some(Arc::new(catalog));
        self
    }
}

// Request ID middleware for tracing
async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    request.headers_mut().insert("x-request-id", request_id.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert("x-request-id", request_id);
    response
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
        .allow_credentials(false);

    let Some(allowed_origins) = &config.cors_allowed_origins else {
        warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        return base.allow_origin(tower_http::cors::Any);
    };
    let origins: Vec<HeaderValue> = allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
    if origins.is_empty() {
        warn!("CORS_ALLOWED_ORIGINS is empty, falling back to permissive CORS");
        base.allow_origin(tower_http::cors::Any)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        base.allow_origin(tower_http::cors::AllowOrigin::list(origins))
    }
}

/// Routes for the app, served at the root and again under `/api`.
pub fn build_router<M: SpeechModel>(state: AppState<M>) -> anyhow::Result<Router> {
    let config = state.config.clone();

    // Global limit: every client shares one bucket, replenished evenly over the minute.
    let rate = config.rate_limit_per_minute.max(1);
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_millisecond((60_000 / rate as u64).max(1))
            .burst_size(rate)
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
    );
    info!("Rate limiting: {} requests per minute", rate);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors_layer(&config))
        .into_inner();

    let api = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/healthz", get(handlers::health_check))
        .route("/voices", get(handlers::list_voices::<M>))
        .route("/tts", post(handlers::tts_endpoint::<M>))
        .route("/metrics", get(handlers::metrics_endpoint::<M>));

    let app = Router::new()
        .route("/", get(handlers::index::<M>))
        .merge(api.clone())
        .nest("/api", api)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes))
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state);

    Ok(app)
}
