//! Fixed-capacity circular byte buffer.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Capacity of each main-process output buffer (1 MiB).
pub const RING_BUFFER_SIZE: usize = 1024 * 1024;

/// Keeps the most recent `capacity` bytes written to it.
///
/// Writes never block on readers and never fail; once full, each write
/// overwrites the oldest bytes.
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    buf: Box<[u8]>,
    /// Next write position.
    pos: usize,
    full: bool,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::with_capacity(RING_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0; capacity.max(1)].into_boxed_slice(),
                pos: 0,
                full: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.lock().buf.len()
    }

    /// Number of bytes currently retained.
    pub fn len(&self) -> usize {
        let inner = self.lock();
        if inner.full { inner.buf.len() } else { inner.pos }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write(&self, data: &[u8]) {
        let mut inner = self.lock();
        let cap = inner.buf.len();

        if data.len() >= cap {
            inner.buf.copy_from_slice(&data[data.len() - cap..]);
            inner.pos = 0;
            inner.full = true;
            return;
        }

        let pos = inner.pos;
        let first = data.len().min(cap - pos);
        inner.buf[pos..pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            inner.buf[..rest].copy_from_slice(&data[first..]);
        }

        let end = pos + data.len();
        if end >= cap {
            inner.full = true;
        }
        inner.pos = end % cap;
    }

    /// Snapshot of the retained bytes, oldest first.
    pub fn bytes(&self) -> Vec<u8> {
        let inner = self.lock();
        if !inner.full {
            return inner.buf[..inner.pos].to_vec();
        }
        let mut out = Vec::with_capacity(inner.buf.len());
        out.extend_from_slice(&inner.buf[inner.pos..]);
        out.extend_from_slice(&inner.buf[..inner.pos]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_concatenation_below_capacity() {
        let ring = RingBuffer::with_capacity(16);
        ring.write(b"hello ");
        ring.write(b"");
        ring.write(b"world");
        assert_eq!(ring.bytes(), b"hello world");
        assert_eq!(ring.len(), 11);
    }

    #[test]
    fn exact_fill_is_retained() {
        let ring = RingBuffer::with_capacity(4);
        ring.write(b"ab");
        ring.write(b"cd");
        assert_eq!(ring.bytes(), b"abcd");
        assert_eq!(ring.len(), 4);
    }

    #[test]
    fn overflow_keeps_most_recent_bytes() {
        let ring = RingBuffer::with_capacity(8);
        ring.write(b"0123456");
        ring.write(b"789ab");
        assert_eq!(ring.bytes(), b"456789ab");
    }

    #[test]
    fn oversized_write_keeps_its_tail() {
        let ring = RingBuffer::with_capacity(4);
        ring.write(b"xy");
        ring.write(b"abcdefgh");
        assert_eq!(ring.bytes(), b"efgh");

        ring.write(b"ij");
        assert_eq!(ring.bytes(), b"ghij");
    }

    #[test]
    fn many_small_writes_match_tail_of_input() {
        let ring = RingBuffer::with_capacity(100);
        let mut all = Vec::new();
        for i in 0..1000u32 {
            let chunk = format!("{i},");
            ring.write(chunk.as_bytes());
            all.extend_from_slice(chunk.as_bytes());
        }
        assert_eq!(ring.bytes(), &all[all.len() - 100..]);
    }

    #[test]
    fn default_capacity_is_one_mebibyte() {
        let ring = RingBuffer::new();
        assert_eq!(ring.capacity(), 1 << 20);
        assert!(ring.is_empty());
    }
}
