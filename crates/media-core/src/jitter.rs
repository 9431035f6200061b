//! Adaptive jitter buffer for audio.
//!
//! Reorders incoming packets by sequence number and delays playout by a
//! target that tracks observed arrival jitter, trading latency for fewer
//! concealment events.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::trace;

use confero_infra_common::{Clock, MonotonicClock};
use confero_rtp_core::{RtpSequenceNumber, RtpTimestamp};

/// Jitter buffer tunables.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    /// Initial playout delay
    pub target_delay: Duration,
    /// Floor for the adapted delay
    pub min_delay: Duration,
    /// Ceiling for the adapted delay
    pub max_delay: Duration,
    /// Maximum buffered packets before the oldest is dropped
    pub max_packets: usize,
    /// Adapt the delay to observed jitter
    pub enable_adaptive: bool,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            target_delay: Duration::from_millis(40),
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
            max_packets: 100,
            enable_adaptive: true,
        }
    }
}

/// One buffered audio packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterFrame {
    /// RTP sequence number
    pub sequence: RtpSequenceNumber,
    /// RTP timestamp
    pub timestamp: RtpTimestamp,
    /// Encoded payload
    pub payload: Bytes,
    /// When the packet arrived
    pub arrival_time: Instant,
}

/// Jitter buffer counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct JitterBufferStats {
    /// Packets accepted
    pub packets_received: u64,
    /// Packets inferred lost from sequence gaps at pop time
    pub packets_lost: u64,
    /// Duplicates rejected
    pub packets_duplicated: u64,
    /// Oldest packets evicted by capacity
    pub packets_late: u64,
    /// Current depth in packets
    pub current_size: usize,
    /// Smoothed arrival jitter in milliseconds
    pub jitter_ms: f32,
}

/// Sequence-ordered, delay-adapted audio packet buffer.
pub struct JitterBuffer {
    config: JitterBufferConfig,
    clock: Arc<dyn Clock>,

    buffer: VecDeque<JitterFrame>,
    expected_sequence: RtpSequenceNumber,
    sequence_initialized: bool,
    playout_started: bool,
    playout_start: Option<Instant>,
    last_arrival_delta_ms: i64,
    jitter_estimate_ms: f32,
    current_target: Duration,

    stats: JitterBufferStats,
}

impl JitterBuffer {
    /// Create a buffer with the real clock.
    pub fn new(config: JitterBufferConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    /// Create a buffer driven by an explicit clock (tests).
    pub fn with_clock(config: JitterBufferConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            current_target: config.target_delay,
            config,
            clock,
            buffer: VecDeque::new(),
            expected_sequence: 0,
            sequence_initialized: false,
            playout_started: false,
            playout_start: None,
            last_arrival_delta_ms: 0,
            jitter_estimate_ms: 0.0,
            stats: JitterBufferStats::default(),
        }
    }

    /// Insert a packet. Returns `false` for duplicates.
    pub fn push(&mut self, sequence: RtpSequenceNumber, timestamp: RtpTimestamp, payload: Bytes) -> bool {
        let arrival_time = self.clock.now();

        if self.buffer.len() >= self.config.max_packets {
            self.buffer.pop_front();
            self.stats.packets_late += 1;
        }

        if !self.sequence_initialized {
            self.expected_sequence = sequence;
            self.sequence_initialized = true;
        }

        if self.buffer.iter().any(|f| f.sequence == sequence) {
            self.stats.packets_duplicated += 1;
            return false;
        }

        self.update_jitter(arrival_time);
        self.adapt_delay();

        // Insert keeping ascending wrap-aware sequence order
        let position = self
            .buffer
            .iter()
            .position(|f| (sequence.wrapping_sub(f.sequence) as i16) < 0)
            .unwrap_or(self.buffer.len());
        self.buffer.insert(
            position,
            JitterFrame {
                sequence,
                timestamp,
                payload,
                arrival_time,
            },
        );

        self.stats.packets_received += 1;
        self.stats.current_size = self.buffer.len();
        true
    }

    /// Pop the next packet once the playout delay has elapsed.
    ///
    /// Returns the frame and the number of packets lost before it.
    pub fn pop(&mut self) -> Option<(JitterFrame, u16)> {
        let front = self.buffer.front()?;
        let age = self.clock.now().saturating_duration_since(front.arrival_time);
        if age < self.current_target {
            return None;
        }

        let frame = self.buffer.pop_front()?;

        let mut lost = 0u16;
        if frame.sequence != self.expected_sequence {
            let diff = frame.sequence.wrapping_sub(self.expected_sequence) as i16;
            if diff > 0 {
                lost = diff as u16;
                self.stats.packets_lost += lost as u64;
                trace!(lost, "gap before popped packet");
            }
        }
        self.expected_sequence = frame.sequence.wrapping_add(1);
        self.stats.current_size = self.buffer.len();

        Some((frame, lost))
    }

    /// Next packet without consuming it.
    pub fn peek(&self) -> Option<&JitterFrame> {
        self.buffer.front()
    }

    /// True when the front packet has aged past the playout delay.
    pub fn is_ready(&self) -> bool {
        match self.buffer.front() {
            Some(front) => {
                self.clock.now().saturating_duration_since(front.arrival_time)
                    >= self.current_target
            }
            None => false,
        }
    }

    /// Current depth in packets.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Current adapted playout delay.
    pub fn target_delay(&self) -> Duration {
        self.current_target
    }

    /// Counter snapshot.
    pub fn stats(&self) -> JitterBufferStats {
        self.stats
    }

    /// Discard all state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.sequence_initialized = false;
        self.playout_started = false;
        self.playout_start = None;
        self.jitter_estimate_ms = 0.0;
        self.last_arrival_delta_ms = 0;
        self.current_target = self.config.target_delay;
        self.stats = JitterBufferStats::default();
    }

    fn update_jitter(&mut self, arrival_time: Instant) {
        match self.playout_start {
            Some(start) if self.playout_started => {
                let delta_ms =
                    arrival_time.saturating_duration_since(start).as_millis() as i64;
                let diff = (delta_ms - self.last_arrival_delta_ms).unsigned_abs() as f32;
                self.jitter_estimate_ms += (diff - self.jitter_estimate_ms) / 16.0;
                self.last_arrival_delta_ms = delta_ms;
            }
            _ => {
                self.playout_start = Some(arrival_time);
                self.playout_started = true;
            }
        }
        self.stats.jitter_ms = self.jitter_estimate_ms;
    }

    fn adapt_delay(&mut self) {
        if !self.config.enable_adaptive {
            return;
        }
        let adapted = Duration::from_millis((self.jitter_estimate_ms * 2.0 + 10.0) as u64);
        self.current_target = adapted.clamp(self.config.min_delay, self.config.max_delay);
    }
}
