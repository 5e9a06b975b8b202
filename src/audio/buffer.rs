//! Per-session audio chunk accumulation.

use crate::audio::format::{resolve_chunks, AudioFormat};

/// Ordered audio chunks awaiting a recognition turn.
///
/// A flush is ready once cumulative size reaches twice the configured
/// minimum; the buffer is cleared atomically on drain so a second drain
/// yields nothing until new audio arrives. The chunk count is bounded:
/// when full, the oldest chunk is dropped first.
#[derive(Debug)]
pub struct AudioBuffer {
    chunks: Vec<Vec<u8>>,
    total_bytes: usize,
    min_bytes: usize,
    max_chunks: usize,
}

impl AudioBuffer {
    pub fn new(min_bytes: usize, max_chunks: usize) -> Self {
        Self {
            chunks: Vec::new(),
            total_bytes: 0,
            min_bytes,
            max_chunks,
        }
    }

    /// Append a chunk. Returns `true` when the buffer is ready to flush.
    pub fn push(&mut self, chunk: Vec<u8>) -> bool {
        if self.chunks.len() >= self.max_chunks {
            let dropped = self.chunks.remove(0);
            self.total_bytes -= dropped.len();
        }
        self.total_bytes += chunk.len();
        self.chunks.push(chunk);
        self.is_ready()
    }

    /// Whether enough audio is buffered for a turn.
    pub fn is_ready(&self) -> bool {
        self.total_bytes >= self.min_bytes * 2
    }

    /// Drain the buffer into a single payload with its detected format.
    ///
    /// Returns `None` when empty. Container chunks supersede raw fragments
    /// per the triage rule in [`crate::audio::format`].
    pub fn drain(&mut self) -> Option<(Vec<u8>, AudioFormat)> {
        if self.chunks.is_empty() {
            return None;
        }
        let chunks = std::mem::take(&mut self.chunks);
        self.total_bytes = 0;
        Some(resolve_chunks(chunks))
    }

    /// Discard everything buffered (error recovery path).
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_bytes = 0;
    }

    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
