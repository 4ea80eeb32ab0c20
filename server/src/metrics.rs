// Metrics collection and tracking

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

const MAX_SAMPLES: usize = 1000;

/// Running latency statistics over the last [`MAX_SAMPLES`] observations.
#[derive(Debug)]
pub struct LatencyTracker {
    count: AtomicU64,
    total_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
    samples: Mutex<VecDeque<u64>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::with_capacity(MAX_SAMPLES)),
        }
    }

    pub fn record(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.min_ms.fetch_min(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);

        if let Ok(mut samples) = self.samples.lock() {
            if samples.len() == MAX_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(ms);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn percentile(sorted: &[u64], p: usize) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        let index = (sorted.len() * p / 100).min(sorted.len() - 1);
        sorted[index]
    }

    pub fn stats(&self) -> LatencyStats {
        let count = self.count();
        let mut sorted: Vec<u64> = self
            .samples
            .lock()
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        sorted.sort_unstable();

        LatencyStats {
            avg_ms: if count == 0 {
                0.0
            } else {
                self.total_ms.load(Ordering::Relaxed) as f64 / count as f64
            },
            min_ms: if count == 0 { 0 } else { self.min_ms.load(Ordering::Relaxed) },
            max_ms: self.max_ms.load(Ordering::Relaxed),
            p50_ms: Self::percentile(&sorted, 50),
            p95_ms: Self::percentile(&sorted, 95),
            p99_ms: Self::percentile(&sorted, 99),
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Requests and time until the response head for one endpoint.
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    errors: AtomicU64,
    latency: LatencyTracker,
}

impl EndpointMetrics {
    pub fn record_request(&self, latency: Duration) {
        self.latency.record(latency);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            request_count: self.latency.count(),
            error_count: self.errors.load(Ordering::Relaxed),
            latency: self.latency.stats(),
        }
    }
}

/// Lifecycle counters for streaming sessions.
#[derive(Debug, Default)]
pub struct StreamMetrics {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    active: AtomicU64,
    bytes: AtomicU64,
    first_chunk: LatencyTracker,
}

impl StreamMetrics {
    /// Count a new session. The guard settles it as abandoned unless told otherwise.
    pub fn begin(self: &Arc<Self>) -> StreamGuard {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        StreamGuard {
            metrics: self.clone(),
            settled: false,
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            bytes_streamed: self.bytes.load(Ordering::Relaxed),
            time_to_first_chunk: self.first_chunk.stats(),
        }
    }
}

/// Tracks one session from the HTTP side.
#[derive(Debug)]
pub struct StreamGuard {
    metrics: Arc<StreamMetrics>,
    settled: bool,
}

impl StreamGuard {
    pub fn first_chunk(&self, after: Duration) {
        self.metrics.first_chunk.record(after);
    }

    pub fn add_bytes(&self, n: usize) {
        self.metrics.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn complete(mut self) {
        self.metrics.completed.fetch_add(1, Ordering::Relaxed);
        self.settled = true;
    }

    pub fn fail(mut self) {
        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
        self.settled = true;
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.metrics.abandoned.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct AppMetrics {
    pub tts: EndpointMetrics,
    pub streams: Arc<StreamMetrics>,
}

impl AppMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Serialize)]
pub struct DetailedMetricsResponse {
    pub timestamp: DateTime<Utc>,
    pub system: SystemMetrics,
    pub endpoints: EndpointMetricsResponse,
    pub streams: StreamStats,
}

#[derive(Serialize)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub memory_usage_percent: f32,
    pub request_count: u64,
    pub uptime_seconds: u64,
    pub system_load: Option<f64>,
}

#[derive(Serialize)]
pub struct EndpointMetricsResponse {
    pub tts: EndpointStats,
}

#[derive(Debug, Serialize)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct EndpointStats {
    pub request_count: u64,
    pub error_count: u64,
    pub latency: LatencyStats,
}

#[derive(Debug, Serialize)]
pub struct StreamStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub active: u64,
    pub bytes_streamed: u64,
    pub time_to_first_chunk: LatencyStats,
}
