use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{SinkError, StreamFailure};

/// Destination for encoded audio bytes.
///
/// The same encoder drives every sink, so the HTTP path and the file path
/// share one code path. Implementations are written to from a plain worker
/// thread, never from inside an async task.
pub trait ChunkSink: Send {
    fn write(&mut self, bytes: Bytes) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Overwrite the first `header.len()` bytes already written.
    ///
    /// Returns `Ok(false)` when the destination cannot seek back, in which
    /// case the streaming header stays as written.
    fn patch_header(&mut self, _header: &[u8]) -> Result<bool, SinkError> {
        Ok(false)
    }

    /// Signal end of stream. Calling it more than once has no further effect.
    fn close(&mut self) -> Result<(), SinkError>;

    /// End the stream because the producer failed.
    fn abort(&mut self, _failure: &StreamFailure) -> Result<(), SinkError> {
        self.close()
    }
}

/// Item carried by a session queue.
#[derive(Debug)]
pub enum StreamItem {
    Chunk(Bytes),
    /// End-of-stream marker with the producer's outcome. Sent exactly once.
    End(Result<(), StreamFailure>),
}

/// Sink feeding a bounded queue drained by the response writer.
///
/// `write` blocks while the queue is full and fails with
/// [`SinkError::Closed`] as soon as the consumer has gone away, including
/// when the writer is already blocked.
#[derive(Debug)]
pub struct QueueSink {
    tx: mpsc::Sender<StreamItem>,
    closed: bool,
}

impl QueueSink {
    pub fn new(tx: mpsc::Sender<StreamItem>) -> Self {
        Self { tx, closed: false }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn end(&mut self, outcome: Result<(), StreamFailure>) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tx
            .blocking_send(StreamItem::End(outcome))
            .map_err(|_| SinkError::Closed)
    }
}

impl ChunkSink for QueueSink {
    fn write(&mut self, bytes: Bytes) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        self.tx
            .blocking_send(StreamItem::Chunk(bytes))
            .map_err(|_| SinkError::Closed)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.end(Ok(()))
    }

    fn abort(&mut self, failure: &StreamFailure) -> Result<(), SinkError> {
        self.end(Err(failure.clone()))
    }
}

impl Drop for QueueSink {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            // Never block here; if the queue is full the consumer sees the
            // channel close instead and treats it the same way.
            let _ = self
                .tx
                .try_send(StreamItem::End(Err(StreamFailure::Disconnected)));
        }
    }
}

enum Target {
    File(BufWriter<File>),
    Stdout(io::Stdout),
}

/// Sink writing to a local file or to stdout.
pub struct FileSink {
    target: Target,
    closed: bool,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self {
            target: Target::File(BufWriter::new(file)),
            closed: false,
        })
    }

    pub fn stdout() -> Self {
        Self {
            target: Target::Stdout(io::stdout()),
            closed: false,
        }
    }

    fn writer(&mut self) -> &mut dyn Write {
        match &mut self.target {
            Target::File(w) => w as &mut dyn Write,
            Target::Stdout(w) => w,
        }
    }
}

impl ChunkSink for FileSink {
    fn write(&mut self, bytes: Bytes) -> Result<(), SinkError> {
        if self.closed {
            return Err(SinkError::Closed);
        }
        self.writer().write_all(&bytes)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer().flush()?;
        Ok(())
    }

    fn patch_header(&mut self, header: &[u8]) -> Result<bool, SinkError> {
        match &mut self.target {
            Target::File(w) => {
                let end = w.stream_position()?;
                w.seek(SeekFrom::Start(0))?;
                w.write_all(header)?;
                w.seek(SeekFrom::Start(end))?;
                Ok(true)
            }
            Target::Stdout(_) => Ok(false),
        }
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer().flush()?;
        Ok(())
    }
}
