//! Fixed-capacity ring buffer for 16-bit PCM samples.
//!
//! Sits between a capture thread and the mixer tick: the producer writes
//! whole frames, the consumer reads whole frames, neither blocks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Ring buffer for interleaved i16 audio samples.
///
/// Writes and reads move whole slices. The buffer never grows; when the
/// producer outruns the consumer the write is truncated and the remainder
/// discarded, which for live audio beats unbounded latency.
pub struct AudioRingBuffer {
    buffer: Mutex<Vec<i16>>,
    capacity: usize,
    head: AtomicUsize,
    len: AtomicUsize,
}

impl AudioRingBuffer {
    /// Create a ring holding at most `capacity_samples` samples.
    pub fn new(capacity_samples: usize) -> Self {
        Self {
            buffer: Mutex::new(vec![0; capacity_samples]),
            capacity: capacity_samples,
            head: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
        }
    }

    /// Write samples, returning how many were accepted.
    pub fn write(&self, samples: &[i16]) -> usize {
        let mut buf = self.buffer.lock().expect("audio ring poisoned");
        let len = self.len.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        let space = self.capacity - len;
        let count = samples.len().min(space);
        let tail = (head + len) % self.capacity;
        for (i, &s) in samples[..count].iter().enumerate() {
            buf[(tail + i) % self.capacity] = s;
        }

        self.len.store(len + count, Ordering::Release);
        count
    }

    /// Read up to `out.len()` samples, returning how many were produced.
    pub fn read(&self, out: &mut [i16]) -> usize {
        let buf = self.buffer.lock().expect("audio ring poisoned");
        let len = self.len.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        let count = out.len().min(len);
        for (i, slot) in out[..count].iter_mut().enumerate() {
            *slot = buf[(head + i) % self.capacity];
        }

        self.head.store((head + count) % self.capacity, Ordering::Release);
        self.len.store(len - count, Ordering::Release);
        count
    }

    /// Samples available to read.
    pub fn available(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Free space in samples.
    pub fn space(&self) -> usize {
        self.capacity - self.len.load(Ordering::Acquire)
    }

    /// Discard all buffered samples.
    pub fn clear(&self) {
        let _buf = self.buffer.lock().expect("audio ring poisoned");
        self.head.store(0, Ordering::Release);
        self.len.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_round_trip() {
        let ring = AudioRingBuffer::new(16);
        let frame: Vec<i16> = (0..8).collect();

        assert_eq!(ring.write(&frame), 8);
        assert_eq!(ring.available(), 8);

        let mut out = [0i16; 8];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(&out[..], &frame[..]);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_write_truncates_when_full() {
        let ring = AudioRingBuffer::new(4);
        assert_eq!(ring.write(&[1, 2, 3]), 3);
        assert_eq!(ring.write(&[4, 5, 6]), 1);

        let mut out = [0i16; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn test_wrap_around() {
        let ring = AudioRingBuffer::new(4);
        ring.write(&[1, 2, 3]);
        let mut out = [0i16; 2];
        ring.read(&mut out);

        // Head has advanced; the next write wraps past the end
        assert_eq!(ring.write(&[4, 5, 6]), 3);
        let mut rest = [0i16; 4];
        assert_eq!(ring.read(&mut rest), 4);
        assert_eq!(rest, [3, 4, 5, 6]);
    }

    #[test]
    fn test_clear() {
        let ring = AudioRingBuffer::new(8);
        ring.write(&[1, 2, 3]);
        ring.clear();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.space(), 8);
    }
}
