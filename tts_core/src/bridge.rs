//! Worker-thread to consumer streaming.
//!
//! Every session owns one named worker thread that pulls chunks from the
//! model, encodes them and pushes the bytes into a [`ChunkSink`]. For HTTP
//! the sink is a [`QueueSink`] and the request handler drains the matching
//! [`StreamSession`]; for one-shot rendering the sink is whatever the caller
//! passes (usually a [`FileSink`](crate::FileSink)).
//!
//! The bounded queue is the only thing shared across the thread boundary. A
//! full queue blocks the worker; a closed queue stops it at its next write.

use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{GenerationError, SinkError, StreamFailure};
use crate::sink::{ChunkSink, FileSink, QueueSink, StreamItem};
use crate::wav::WavStreamEncoder;
use crate::SpeechModel;

/// Chunks buffered between the model and a slow client.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Consumer-side view of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Worker is producing; more chunks may arrive.
    Running,
    /// End-of-stream received after a successful run.
    Draining,
    /// End-of-stream received carrying a producer failure.
    Failed,
    /// Worker joined.
    Closed,
}

#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub session_id: u64,
    pub chunks: usize,
    pub bytes: u64,
    pub elapsed: Duration,
    pub first_chunk_after: Option<Duration>,
}

enum WorkerOutcome {
    Completed,
    Cancelled,
    Failed(StreamFailure),
}

enum PumpError {
    Generation(GenerationError),
    Sink(SinkError),
}

impl From<GenerationError> for PumpError {
    fn from(e: GenerationError) -> Self {
        PumpError::Generation(e)
    }
}

impl From<SinkError> for PumpError {
    fn from(e: SinkError) -> Self {
        PumpError::Sink(e)
    }
}

/// Starts streaming sessions against a shared model.
pub struct StreamingBridge<M: SpeechModel> {
    model: Arc<M>,
    capacity: usize,
}

impl<M: SpeechModel> Clone for StreamingBridge<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            capacity: self.capacity,
        }
    }
}

impl<M: SpeechModel> StreamingBridge<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self::with_capacity(model, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(model: Arc<M>, capacity: usize) -> Self {
        Self {
            model,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Spawn the worker for `text` and return the consuming end immediately.
    pub fn start(&self, state: Arc<M::State>, text: impl Into<String>) -> std::io::Result<StreamSession> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let text = text.into();
        let (sink, rx) = QueueSink::channel(self.capacity);
        let model = self.model.clone();

        info!(session = id, chars = text.chars().count(), "starting stream session");
        let worker = std::thread::Builder::new()
            .name(format!("tts-stream-{id}"))
            .spawn(move || {
                let (outcome, chunks, bytes) = produce(&*model, &state, &text, sink);
                match outcome {
                    WorkerOutcome::Completed => debug!(session = id, chunks, bytes, "worker finished"),
                    WorkerOutcome::Cancelled => info!(session = id, chunks, bytes, "consumer went away, worker stopped"),
                    WorkerOutcome::Failed(e) => error!(session = id, chunks, bytes, "stream failed mid-way: {e}"),
                }
            })?;

        Ok(StreamSession {
            id,
            rx,
            worker: Some(worker),
            state: SessionState::Running,
            failure: None,
            chunks: 0,
            bytes: 0,
            started: Instant::now(),
            first_chunk_after: None,
        })
    }

    /// Run one session into `sink` on a worker thread and wait for it.
    pub fn render<S>(&self, state: Arc<M::State>, text: impl Into<String>, sink: S) -> Result<StreamSummary, StreamFailure>
    where
        S: ChunkSink + 'static,
    {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let text = text.into();
        let model = self.model.clone();
        let started = Instant::now();

        info!(session = id, chars = text.chars().count(), "rendering");
        let worker = std::thread::Builder::new()
            .name(format!("tts-render-{id}"))
            .spawn(move || produce(&*model, &state, &text, sink))
            .map_err(|e| StreamFailure::Spawn(e.to_string()))?;

        let (outcome, chunks, bytes) = worker
            .join()
            .map_err(|payload| StreamFailure::Panicked(panic_message(payload.as_ref())))?;
        match outcome {
            WorkerOutcome::Completed => Ok(StreamSummary {
                session_id: id,
                chunks,
                bytes,
                elapsed: started.elapsed(),
                first_chunk_after: None,
            }),
            WorkerOutcome::Cancelled => Err(StreamFailure::Encoding("output closed before the stream ended".into())),
            WorkerOutcome::Failed(e) => Err(e),
        }
    }

    /// [`render`](Self::render) into `path`, `-` meaning stdout. A regular
    /// file is removed again when the stream does not complete, so no WAV
    /// with placeholder lengths is left behind.
    pub fn render_to_path(&self, state: Arc<M::State>, text: impl Into<String>, path: &Path) -> Result<StreamSummary, StreamFailure> {
        let to_stdout = path.as_os_str() == "-";
        let sink = if to_stdout {
            FileSink::stdout()
        } else {
            FileSink::create(path).map_err(SinkError::from)?
        };
        let result = self.render(state, text, sink);
        if result.is_err() && !to_stdout {
            match fs::remove_file(path) {
                Ok(()) => warn!(path = %path.display(), "removed partial output"),
                Err(e) => warn!(path = %path.display(), error = %e, "could not remove partial output"),
            }
        }
        result
    }
}

/// Worker body: generate, encode, write, then end the stream exactly once.
fn produce<M, S>(model: &M, state: &M::State, text: &str, sink: S) -> (WorkerOutcome, usize, u64)
where
    M: SpeechModel,
    S: ChunkSink,
{
    let mut encoder = WavStreamEncoder::new(sink, model.audio_spec(state));

    let pumped = panic::catch_unwind(AssertUnwindSafe(|| pump(model, state, text, &mut encoder)));
    let outcome = match pumped {
        Ok(Ok(())) => WorkerOutcome::Completed,
        Ok(Err(PumpError::Sink(SinkError::Closed))) => WorkerOutcome::Cancelled,
        Ok(Err(PumpError::Sink(e))) => WorkerOutcome::Failed(e.into()),
        Ok(Err(PumpError::Generation(e))) => WorkerOutcome::Failed(e.into()),
        Err(payload) => WorkerOutcome::Failed(StreamFailure::Panicked(panic_message(payload.as_ref()))),
    };

    let ended = match &outcome {
        WorkerOutcome::Completed => encoder.sink_mut().close(),
        WorkerOutcome::Cancelled => Ok(()),
        WorkerOutcome::Failed(e) => encoder.sink_mut().abort(e),
    };
    let outcome = match (outcome, ended) {
        (WorkerOutcome::Completed, Err(SinkError::Closed)) => WorkerOutcome::Cancelled,
        (WorkerOutcome::Completed, Err(e)) => WorkerOutcome::Failed(e.into()),
        (outcome, Err(e)) => {
            debug!("could not deliver end of stream: {e}");
            outcome
        }
        (outcome, Ok(())) => outcome,
    };

    (outcome, encoder.chunks_written(), encoder.bytes_written())
}

fn pump<M, S>(model: &M, state: &M::State, text: &str, encoder: &mut WavStreamEncoder<S>) -> Result<(), PumpError>
where
    M: SpeechModel,
    S: ChunkSink,
{
    // The next chunk is only requested after the previous one was accepted,
    // so a closed sink stops generation immediately.
    for chunk in model.generate(state, text)? {
        encoder.write_chunk(&chunk?)?;
    }
    encoder.finalize()?;
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Consuming end of a streaming session.
///
/// Dropping a session before end-of-stream cancels it: the queue is closed,
/// the worker stops at its next write and is joined in the background.
pub struct StreamSession {
    id: u64,
    rx: mpsc::Receiver<StreamItem>,
    worker: Option<JoinHandle<()>>,
    state: SessionState,
    failure: Option<StreamFailure>,
    chunks: usize,
    bytes: u64,
    started: Instant,
    first_chunk_after: Option<Duration>,
}

impl StreamSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Error carried by the end-of-stream marker, if the producer failed.
    pub fn failure(&self) -> Option<&StreamFailure> {
        self.failure.as_ref()
    }

    /// Next encoded chunk, or `None` at end of stream.
    ///
    /// Each read carries one model chunk, with the WAV header prepended to the
    /// first. A model that yields no chunks still produces a single
    /// header-only read, so a stream of N > 0 chunks gives N reads and an
    /// empty one gives 1.
    pub async fn next(&mut self) -> Option<Bytes> {
        if self.state != SessionState::Running {
            return None;
        }
        let item = self.rx.recv().await;
        self.accept(item)
    }

    /// Blocking variant of [`next`](Self::next) for non-async callers.
    pub fn blocking_next(&mut self) -> Option<Bytes> {
        if self.state != SessionState::Running {
            return None;
        }
        let item = self.rx.blocking_recv();
        self.accept(item)
    }

    fn accept(&mut self, item: Option<StreamItem>) -> Option<Bytes> {
        match item {
            Some(StreamItem::Chunk(bytes)) => {
                if self.first_chunk_after.is_none() {
                    self.first_chunk_after = Some(self.started.elapsed());
                }
                self.chunks += 1;
                self.bytes += bytes.len() as u64;
                Some(bytes)
            }
            Some(StreamItem::End(Ok(()))) => {
                self.state = SessionState::Draining;
                None
            }
            Some(StreamItem::End(Err(failure))) => {
                self.mark_failed(failure);
                None
            }
            None => {
                self.mark_failed(StreamFailure::Disconnected);
                None
            }
        }
    }

    fn mark_failed(&mut self, failure: StreamFailure) {
        self.state = SessionState::Failed;
        self.failure = Some(failure);
    }

    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            session_id: self.id,
            chunks: self.chunks,
            bytes: self.bytes,
            elapsed: self.started.elapsed(),
            first_chunk_after: self.first_chunk_after,
        }
    }

    /// Join the worker and report how the stream ended.
    ///
    /// Calling this before end-of-stream abandons the remaining chunks.
    pub async fn finish(mut self) -> Result<StreamSummary, StreamFailure> {
        self.stop_if_running();
        if let Some(worker) = self.worker.take() {
            match tokio::task::spawn_blocking(move || worker.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => warn!(session = self.id, "stream worker panicked"),
                Err(e) => warn!(session = self.id, "could not join stream worker: {e}"),
            }
        }
        self.close()
    }

    /// Blocking variant of [`finish`](Self::finish).
    pub fn finish_blocking(mut self) -> Result<StreamSummary, StreamFailure> {
        self.stop_if_running();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(session = self.id, "stream worker panicked");
            }
        }
        self.close()
    }

    fn stop_if_running(&mut self) {
        if self.state == SessionState::Running {
            info!(session = self.id, chunks = self.chunks, "stream abandoned before end of stream");
            self.rx.close();
        }
    }

    fn close(&mut self) -> Result<StreamSummary, StreamFailure> {
        let failure = self.failure.clone();
        let abandoned = self.state == SessionState::Running;
        self.state = SessionState::Closed;
        let summary = self.summary();
        match failure {
            Some(e) => Err(e),
            None if abandoned => Ok(summary),
            None => {
                info!(
                    session = self.id,
                    chunks = summary.chunks,
                    bytes = summary.bytes,
                    elapsed_ms = summary.elapsed.as_millis() as u64,
                    "stream completed"
                );
                Ok(summary)
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop_if_running();
        let id = self.id;
        let join = move || {
            if worker.join().is_err() {
                warn!(session = id, "stream worker panicked");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(join);
            }
            Err(_) => join(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;
    use crate::wav::HEADER_LEN;

    fn state() -> Arc<String> {
        Arc::new("default".to_string())
    }

    fn collect_blocking(session: &mut StreamSession) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(b) = session.blocking_next() {
            out.push(b);
        }
        out
    }

    #[test]
    fn test_n_chunks_then_one_end_of_stream_in_order() {
        let model = Arc::new(ScriptedModel::with_chunks(5));
        let bridge = StreamingBridge::with_capacity(model.clone(), 2);
        let mut session = bridge.start(state(), "hello").unwrap();

        let chunks = collect_blocking(&mut session);
        assert_eq!(chunks.len(), 5);
        assert_eq!(session.state(), SessionState::Draining);
        assert!(session.blocking_next().is_none());

        assert_eq!(&chunks[0][..4], b"RIFF");
        for (i, chunk) in chunks.iter().enumerate() {
            let pcm = if i == 0 { &chunk[HEADER_LEN..] } else { &chunk[..] };
            let first = i16::from_le_bytes([pcm[0], pcm[1]]);
            assert_eq!(first, ScriptedModel::expected_pcm(i));
        }

        let summary = session.finish_blocking().unwrap();
        assert_eq!(summary.chunks, 5);
    }

    #[test]
    fn test_failure_after_k_chunks() {
        let mut model = ScriptedModel::with_chunks(6);
        model.fail_after = Some(3);
        let bridge = StreamingBridge::new(Arc::new(model));
        let mut session = bridge.start(state(), "hello").unwrap();

        let chunks = collect_blocking(&mut session);
        assert_eq!(chunks.len(), 3);
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(session.failure(), Some(StreamFailure::Generation(_))));
        assert!(session.blocking_next().is_none());

        let err = session.finish_blocking().unwrap_err();
        assert!(err.to_string().contains("scripted failure"));
    }

    #[test]
    fn test_failure_before_first_chunk() {
        let mut model = ScriptedModel::with_chunks(3);
        model.fail_after = Some(0);
        let bridge = StreamingBridge::new(Arc::new(model));
        let mut session = bridge.start(state(), "hello").unwrap();

        assert!(session.blocking_next().is_none());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_panicking_model_ends_stream_with_failure() {
        let mut model = ScriptedModel::with_chunks(4);
        model.panic_after = Some(2);
        let bridge = StreamingBridge::new(Arc::new(model));
        let mut session = bridge.start(state(), "hello").unwrap();

        assert_eq!(collect_blocking(&mut session).len(), 2);
        assert!(matches!(session.failure(), Some(StreamFailure::Panicked(msg)) if msg.contains("scripted panic")));
    }

    #[test]
    fn test_abandoned_session_stops_generation() {
        let model = ScriptedModel::with_chunks(20);
        let pulled = model.pulled.clone();
        let capacity = 2;
        let bridge = StreamingBridge::with_capacity(Arc::new(model), capacity);
        let mut session = bridge.start(state(), "hello").unwrap();

        assert!(session.blocking_next().is_some());
        // Give the worker time to fill the queue and block on the next write.
        std::thread::sleep(Duration::from_millis(50));
        drop(session);

        // Drop joined the worker: one consumed, `capacity` queued, one rejected.
        let pulled = pulled.load(Ordering::SeqCst);
        assert!(pulled <= 1 + capacity + 1, "pulled {pulled} chunks");
        assert!(pulled < 20);
    }

    #[test]
    fn test_empty_generation_yields_header_only() {
        let model = Arc::new(ScriptedModel::with_chunks(0));
        let bridge = StreamingBridge::new(model);
        let mut session = bridge.start(state(), "hello").unwrap();

        let chunks = collect_blocking(&mut session);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), HEADER_LEN);
        assert!(session.finish_blocking().is_ok());
    }

    #[test]
    fn test_render_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let bridge = StreamingBridge::new(Arc::new(ScriptedModel::with_chunks(3)));

        let summary = bridge
            .render(state(), "hello", FileSink::create(&path).unwrap())
            .unwrap();
        assert_eq!(summary.chunks, 3);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, ScriptedModel::SAMPLE_RATE);
        assert_eq!(reader.len() as usize, 3 * ScriptedModel::CHUNK_LEN);
    }

    #[test]
    fn test_render_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = ScriptedModel::with_chunks(3);
        model.fail_after = Some(1);
        let bridge = StreamingBridge::new(Arc::new(model));

        let result = bridge.render(state(), "hello", FileSink::create(dir.path().join("x.wav")).unwrap());
        assert!(matches!(result, Err(StreamFailure::Generation(_))));
    }

    #[test]
    fn test_render_to_path_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.wav");
        let mut model = ScriptedModel::with_chunks(3);
        model.fail_after = Some(1);
        let bridge = StreamingBridge::new(Arc::new(model));

        let result = bridge.render_to_path(state(), "hello", &path);
        assert!(matches!(result, Err(StreamFailure::Generation(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_render_to_path_keeps_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let bridge = StreamingBridge::new(Arc::new(ScriptedModel::with_chunks(2)));

        let summary = bridge.render_to_path(state(), "hello", &path).unwrap();
        assert_eq!(summary.chunks, 2);
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.len() as usize, 2 * ScriptedModel::CHUNK_LEN);
    }

    #[tokio::test]
    async fn test_async_consumer_and_finish() {
        let bridge = StreamingBridge::new(Arc::new(ScriptedModel::with_chunks(4)));
        let mut session = bridge.start(state(), "hello").unwrap();

        let mut n = 0;
        while let Some(_bytes) = session.next().await {
            n += 1;
        }
        assert_eq!(n, 4);
        assert_eq!(session.state(), SessionState::Draining);

        let summary = session.finish().await.unwrap();
        assert_eq!(summary.chunks, 4);
        assert!(summary.first_chunk_after.is_some());
    }

    #[tokio::test]
    async fn test_early_finish_cancels_worker() {
        let model = ScriptedModel::with_chunks(50);
        let pulled = model.pulled.clone();
        let bridge = StreamingBridge::with_capacity(Arc::new(model), 1);
        let mut session = bridge.start(state(), "hello").unwrap();

        assert!(session.next().await.is_some());
        // Ending early is not a producer failure.
        assert!(session.finish().await.is_ok());
        assert!(pulled.load(Ordering::SeqCst) <= 3);
    }
}
