// Coalesces small network chunks before they are written and forwarded.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

/// Accumulates body chunks until more than `threshold` bytes are buffered.
///
/// Network callbacks and the pipeline may run on different threads, so the
/// buffer carries its own lock.
pub struct ChunkBuffer {
    inner: Mutex<BytesMut>,
    threshold: usize,
}

impl ChunkBuffer {
    pub fn new(threshold: usize) -> Self {
        Self {
            inner: Mutex::new(BytesMut::with_capacity(threshold * 2)),
            threshold,
        }
    }

    /// Append `chunk`; returns the buffered bytes once the threshold is exceeded.
    pub fn push(&self, chunk: &[u8]) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        inner.extend_from_slice(chunk);
        if inner.len() > self.threshold {
            Some(inner.split().freeze())
        } else {
            None
        }
    }

    /// Drain whatever is left, on completion or error.
    pub fn flush(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        if inner.is_empty() {
            None
        } else {
            Some(inner.split().freeze())
        }
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_chunks_are_held_until_threshold() {
        let buffer = ChunkBuffer::new(10);
        assert!(buffer.push(&[1; 4]).is_none());
        assert!(buffer.push(&[2; 6]).is_none());
        assert_eq!(buffer.buffered(), 10);

        let out = buffer.push(&[3; 1]).unwrap();
        assert_eq!(out.len(), 11);
        assert_eq!(&out[..4], &[1; 4]);
        assert_eq!(out[10], 3);
        assert_eq!(buffer.buffered(), 0);
    }

    #[test]
    fn test_flush_drains_remainder() {
        let buffer = ChunkBuffer::new(10);
        assert!(buffer.flush().is_none());
        buffer.push(b"abc");
        assert_eq!(&buffer.flush().unwrap()[..], b"abc");
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn test_large_chunk_passes_straight_through() {
        let buffer = ChunkBuffer::new(10);
        let out = buffer.push(&[7; 64]).unwrap();
        assert_eq!(out.len(), 64);
    }
}
