//! Lock-free queues for real-time media pipelines.
//!
//! One thread produces, another consumes (capture -> encode, receive ->
//! decode). Both queues are bounded and allocation-free after construction,
//! so they are safe to touch from latency-sensitive loops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Single-producer single-consumer bounded queue.
///
/// Intended for pipelines with exactly one producer and one consumer thread
/// (e.g. capture thread -> encode thread). The implementation is an
/// [`ArrayQueue`] plus drop accounting; nothing enforces the SPSC discipline,
/// it just names the intended use.
pub struct SpscQueue<T> {
    inner: Arc<ArrayQueue<T>>,
    dropped: AtomicUsize,
}

impl<T> SpscQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ArrayQueue::new(capacity)),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Push an element. Returns `false` (and counts a drop) when full.
    pub fn push(&self, item: T) -> bool {
        match self.inner.push(item) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop the oldest element, if any.
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// True when no elements are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Approximate number of queued elements.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Maximum number of elements the queue can hold.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Number of pushes rejected because the queue was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Multi-producer single-consumer bounded queue.
///
/// Several receive threads push, a single worker drains. Unlike
/// [`SpscQueue`], a push against a full queue evicts the oldest element so
/// the consumer always sees the freshest data; media that sat in a full
/// queue is stale by the time it would be drained anyway.
pub struct MpscQueue<T> {
    inner: Arc<ArrayQueue<T>>,
    overwrites: AtomicUsize,
}

impl<T> MpscQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ArrayQueue::new(capacity)),
            overwrites: AtomicUsize::new(0),
        }
    }

    /// Push an element, evicting the oldest when full.
    ///
    /// Returns the evicted element, if any.
    pub fn push(&self, item: T) -> Option<T> {
        match self.inner.push(item) {
            Ok(()) => None,
            Err(rejected) => {
                let evicted = self.inner.pop();
                self.overwrites.fetch_add(1, Ordering::Relaxed);
                // Another producer can steal the slot we just freed; if so
                // the element is dropped rather than spun on.
                let _ = self.inner.push(rejected);
                evicted
            }
        }
    }

    /// Pop the oldest element (consumer thread only by convention).
    pub fn pop(&self) -> Option<T> {
        self.inner.pop()
    }

    /// True when no elements are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Approximate number of queued elements.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Number of evictions caused by pushes against a full queue.
    pub fn overwrites(&self) -> usize {
        self.overwrites.load(Ordering::Relaxed)
    }
}
