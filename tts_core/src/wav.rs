use bytes::Bytes;

use crate::error::SinkError;
use crate::sink::ChunkSink;
use crate::{AudioChunk, AudioSpec};

pub(crate) const HEADER_LEN: usize = 44;
const BITS_PER_SAMPLE: u16 = 16;
/// Length value used while the total size is unknown.
const STREAMING_LEN: u32 = u32::MAX;

/// Incremental 16-bit PCM WAV (RIFF) writer on top of a [`ChunkSink`].
///
/// The header goes out once, in the same write as the first chunk, with
/// placeholder length fields. [`finalize`](Self::finalize) rewrites them when
/// the sink can seek; otherwise the placeholders remain, which common players
/// accept as "read until EOF".
pub struct WavStreamEncoder<S> {
    sink: S,
    spec: AudioSpec,
    header_written: bool,
    data_bytes: u64,
    chunks: usize,
}

impl<S: ChunkSink> WavStreamEncoder<S> {
    pub fn new(sink: S, spec: AudioSpec) -> Self {
        Self {
            sink,
            spec,
            header_written: false,
            data_bytes: 0,
            chunks: 0,
        }
    }

    pub fn write_chunk(&mut self, chunk: &AudioChunk) -> Result<(), SinkError> {
        let header_len = if self.header_written { 0 } else { HEADER_LEN };
        let mut out = Vec::with_capacity(header_len + chunk.len() * 2);
        if !self.header_written {
            out.extend_from_slice(&wav_header(self.spec, None));
        }
        let pcm_len = encode_pcm16(&chunk.samples, &mut out);

        self.sink.write(Bytes::from(out))?;
        self.header_written = true;
        self.data_bytes += pcm_len as u64;
        self.chunks += 1;
        Ok(())
    }

    /// Make the container complete: emit a bare header if no chunk was
    /// written, patch the length fields where possible, and flush.
    ///
    /// Does not close the sink.
    pub fn finalize(&mut self) -> Result<(), SinkError> {
        if !self.header_written {
            self.sink
                .write(Bytes::copy_from_slice(&wav_header(self.spec, Some(0))))?;
            self.header_written = true;
            return self.sink.flush();
        }
        let data_len = u32::try_from(self.data_bytes).ok();
        if let Some(len) = data_len.filter(|l| *l <= STREAMING_LEN - 36) {
            if !self.sink.patch_header(&wav_header(self.spec, Some(len)))? {
                tracing::trace!("sink is not seekable, keeping streaming WAV header");
            }
        }
        self.sink.flush()
    }

    pub fn chunks_written(&self) -> usize {
        self.chunks
    }

    /// Bytes handed to the sink, header included.
    pub fn bytes_written(&self) -> u64 {
        if self.header_written {
            self.data_bytes + HEADER_LEN as u64
        } else {
            0
        }
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}

/// Build a canonical 44-byte PCM header. `None` writes streaming placeholders.
pub(crate) fn wav_header(spec: AudioSpec, data_len: Option<u32>) -> [u8; HEADER_LEN] {
    let num_channels = spec.channels.max(1);
    let byte_rate: u32 = spec.sample_rate * num_channels as u32 * (BITS_PER_SAMPLE as u32 / 8);
    let block_align: u16 = num_channels * (BITS_PER_SAMPLE / 8);
    let (riff_size, data_size) = match data_len {
        Some(len) => (36 + len, len),
        None => (STREAMING_LEN, STREAMING_LEN),
    };

    let mut out = [0u8; HEADER_LEN];
    let mut put = |offset: usize, bytes: &[u8]| out[offset..offset + bytes.len()].copy_from_slice(bytes);

    // RIFF header
    put(0, b"RIFF");
    put(4, &riff_size.to_le_bytes());
    put(8, b"WAVE");

    // fmt chunk
    put(12, b"fmt ");
    put(16, &16u32.to_le_bytes());
    put(20, &1u16.to_le_bytes()); // PCM
    put(22, &num_channels.to_le_bytes());
    put(24, &spec.sample_rate.to_le_bytes());
    put(28, &byte_rate.to_le_bytes());
    put(32, &block_align.to_le_bytes());
    put(34, &BITS_PER_SAMPLE.to_le_bytes());

    // data chunk
    put(36, b"data");
    put(40, &data_size.to_le_bytes());
    out
}

/// Append f32 samples as little-endian i16. Returns the number of bytes added.
fn encode_pcm16(samples: &[f32], out: &mut Vec<u8>) -> usize {
    for &s in samples {
        let clamped = s.clamp(-1.0, 1.0);
        out.extend_from_slice(&((clamped * i16::MAX as f32) as i16).to_le_bytes());
    }
    samples.len() * 2
}
