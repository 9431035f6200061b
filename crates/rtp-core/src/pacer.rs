//! Token-bucket egress pacer.
//!
//! Smooths bursts (keyframes, simulcast switches) into a configured rate.
//! Higher-priority packets leave first; within a priority, FIFO order is
//! preserved via an enqueue counter.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

use confero_infra_common::{Clock, MonotonicClock};

use crate::error::Error;
use crate::Result;

/// Receives packets the pacer releases.
pub trait PacerSink: Send + Sync {
    /// Called with each released packet and its destination.
    fn send(&self, data: &[u8], destination: SocketAddr);
}

impl<F: Fn(&[u8], SocketAddr) + Send + Sync> PacerSink for F {
    fn send(&self, data: &[u8], destination: SocketAddr) {
        self(data, destination)
    }
}

/// Pacer tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Egress rate the token bucket refills at, in bps
    pub target_bitrate_bps: u64,
    /// Maximum token balance, bounding burst size in bytes
    pub bucket_size_bytes: usize,
    /// Maximum queued packets before new enqueues are rejected
    pub max_queue_size: usize,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            target_bitrate_bps: 2_000_000,
            bucket_size_bytes: 16_384,
            max_queue_size: 1000,
        }
    }
}

/// Counters for the pacer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PacerStats {
    /// Packets released to the sink
    pub packets_sent: u64,
    /// Bytes released to the sink
    pub bytes_sent: u64,
    /// Packets rejected because the queue was full
    pub packets_dropped: u64,
}

struct PacedPacket {
    data: Bytes,
    destination: SocketAddr,
    priority: i32,
    enqueue_seq: u64,
    enqueue_time: Instant,
}

impl PartialEq for PacedPacket {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.enqueue_seq == other.enqueue_seq
    }
}

impl Eq for PacedPacket {}

impl PartialOrd for PacedPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PacedPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority wins, then earlier enqueue
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueue_seq.cmp(&self.enqueue_seq))
    }
}

/// Priority-aware token-bucket pacer.
pub struct Pacer {
    config: PacerConfig,
    clock: Arc<dyn Clock>,
    sink: Option<Box<dyn PacerSink>>,

    queue: BinaryHeap<PacedPacket>,
    available_tokens: usize,
    last_process: Instant,
    next_enqueue_seq: u64,
    stats: PacerStats,
}

impl Pacer {
    /// Create a pacer with a full bucket.
    pub fn new(config: PacerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    /// Create a pacer driven by an explicit clock (tests).
    pub fn with_clock(config: PacerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            available_tokens: config.bucket_size_bytes,
            last_process: now,
            next_enqueue_seq: 0,
            queue: BinaryHeap::new(),
            stats: PacerStats::default(),
            sink: None,
            config,
            clock,
        }
    }

    /// Install the sink packets are released to.
    pub fn set_sink(&mut self, sink: impl PacerSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// Queue a packet for paced release.
    ///
    /// A full queue rejects the new packet rather than evicting an old one;
    /// priorities already queued would otherwise be subverted by freshness.
    pub fn enqueue(&mut self, data: Bytes, destination: SocketAddr, priority: i32) -> Result<()> {
        if self.queue.len() >= self.config.max_queue_size {
            self.stats.packets_dropped += 1;
            return Err(Error::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        self.queue.push(PacedPacket {
            data,
            destination,
            priority,
            enqueue_seq: self.next_enqueue_seq,
            enqueue_time: self.clock.now(),
        });
        self.next_enqueue_seq += 1;
        Ok(())
    }

    /// Refill tokens for elapsed time and release every packet that fits.
    ///
    /// Returns the number of packets released.
    pub fn process(&mut self) -> usize {
        let now = self.clock.now();
        let elapsed_ms = now.saturating_duration_since(self.last_process).as_millis() as u64;
        self.last_process = now;

        let new_tokens = (self.config.target_bitrate_bps / 8) * elapsed_ms / 1000;
        self.available_tokens = (self.available_tokens + new_tokens as usize)
            .min(self.config.bucket_size_bytes);

        let mut sent = 0;
        while let Some(top) = self.queue.peek() {
            if top.data.len() > self.available_tokens {
                break;
            }
            let packet = self.queue.pop().expect("peeked packet exists");
            self.available_tokens -= packet.data.len();
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += packet.data.len() as u64;
            sent += 1;

            if let Some(sink) = &self.sink {
                sink.send(&packet.data, packet.destination);
            }
        }

        if sent > 0 {
            trace!(sent, queued = self.queue.len(), "pacer released packets");
        }
        sent
    }

    /// Change the egress rate.
    pub fn set_target_bitrate(&mut self, bitrate_bps: u64) {
        self.config.target_bitrate_bps = bitrate_bps;
    }

    /// Current egress rate in bps.
    pub fn target_bitrate(&self) -> u64 {
        self.config.target_bitrate_bps
    }

    /// Number of packets waiting.
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Age of the oldest queued packet.
    pub fn queue_delay(&self) -> Duration {
        let now = self.clock.now();
        self.queue
            .iter()
            .map(|p| now.saturating_duration_since(p.enqueue_time))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PacerStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confero_infra_common::clock::ManualClock;
    use std::sync::Mutex;

    fn dest() -> SocketAddr {
        "10.0.0.2:5000".parse().unwrap()
    }

    struct Recorder {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    fn setup(bitrate: u64, bucket: usize) -> (Pacer, Arc<ManualClock>, Arc<Recorder>) {
        let clock = Arc::new(ManualClock::new());
        let recorder = Arc::new(Recorder {
            sent: Mutex::new(Vec::new()),
        });
        let mut pacer = Pacer::with_clock(
            PacerConfig {
                target_bitrate_bps: bitrate,
                bucket_size_bytes: bucket,
                max_queue_size: 4,
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let r = Arc::clone(&recorder);
        pacer.set_sink(move |data: &[u8], _dest: SocketAddr| {
            r.sent.lock().unwrap().push(data.to_vec());
        });
        (pacer, clock, recorder)
    }

    #[test]
    fn test_releases_within_bucket_immediately() {
        let (mut pacer, _clock, recorder) = setup(8_000, 1000);
        pacer.enqueue(Bytes::from(vec![0u8; 600]), dest(), 0).unwrap();
        assert_eq!(pacer.process(), 1);
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_blocks_until_tokens_refill() {
        let (mut pacer, clock, _) = setup(8_000, 1000); // 1000 bytes/s refill
        pacer.enqueue(Bytes::from(vec![0u8; 900]), dest(), 0).unwrap();
        pacer.enqueue(Bytes::from(vec![0u8; 900]), dest(), 0).unwrap();

        assert_eq!(pacer.process(), 1); // first drains the bucket
        assert_eq!(pacer.process(), 0);

        clock.advance(Duration::from_millis(500)); // +500 bytes, not enough
        assert_eq!(pacer.process(), 0);

        clock.advance(Duration::from_millis(400)); // +400 more
        assert_eq!(pacer.process(), 1);
    }

    #[test]
    fn test_priority_order_then_fifo() {
        let (mut pacer, _clock, recorder) = setup(8_000_000, 1 << 20);
        pacer.enqueue(Bytes::from_static(b"low-1"), dest(), 0).unwrap();
        pacer.enqueue(Bytes::from_static(b"high"), dest(), 5).unwrap();
        pacer.enqueue(Bytes::from_static(b"low-2"), dest(), 0).unwrap();

        pacer.process();
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent[0], b"high");
        assert_eq!(sent[1], b"low-1");
        assert_eq!(sent[2], b"low-2");
    }

    #[test]
    fn test_overflow_drops_new_packet() {
        let (mut pacer, _clock, _) = setup(8_000, 1000);
        for _ in 0..4 {
            pacer.enqueue(Bytes::from_static(b"x"), dest(), 0).unwrap();
        }
        let err = pacer.enqueue(Bytes::from_static(b"y"), dest(), 9).unwrap_err();
        assert!(matches!(err, Error::QueueFull { capacity: 4 }));
        assert_eq!(pacer.stats().packets_dropped, 1);
        assert_eq!(pacer.queue_size(), 4);
    }

    #[test]
    fn test_queue_delay_tracks_oldest() {
        let (mut pacer, clock, _) = setup(8, 1); // effectively frozen
        pacer.enqueue(Bytes::from(vec![0u8; 100]), dest(), 0).unwrap();
        clock.advance(Duration::from_millis(40));
        pacer.enqueue(Bytes::from(vec![0u8; 100]), dest(), 9).unwrap();

        // Oldest is the low-priority packet even though it is not at the top
        assert_eq!(pacer.queue_delay(), Duration::from_millis(40));
    }

    #[test]
    fn test_conservation_over_window() {
        let (mut pacer, clock, _) = setup(80_000, 2_000); // 10 kB/s
        for _ in 0..4 {
            let _ = pacer.enqueue(Bytes::from(vec![0u8; 1500]), dest(), 0);
        }

        let mut total = 0u64;
        for _ in 0..10 {
            clock.advance(Duration::from_millis(100));
            pacer.process();
            total = pacer.stats().bytes_sent;
        }

        // bucket + rate * window = 2000 + 10000 * 1.0
        assert!(total <= 12_000);
    }
}
