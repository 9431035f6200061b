//! Video frame reassembly buffer.
//!
//! Packets of one frame share an RTP timestamp; the marker bit closes the
//! frame. An assembler per timestamp collects payloads until the sequence
//! run from the lowest seen number to the marker bearer is gapless, then
//! the frame moves to the complete queue where it waits out the playout
//! delay. All sequence arithmetic is wrap-safe via 16-bit signed difference.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use confero_infra_common::{Clock, MonotonicClock};
use confero_rtp_core::{RtpSequenceNumber, RtpTimestamp};

/// Window of recent sequence numbers the NACK generator inspects.
const NACK_WINDOW: u16 = 100;

/// Sequence numbers retained for duplicate/NACK bookkeeping.
const SEQUENCE_HISTORY: u16 = 512;

/// Frame buffer tunables.
#[derive(Debug, Clone)]
pub struct FrameBufferConfig {
    /// Delay a complete frame waits before becoming poppable, giving
    /// stragglers a chance to arrive
    pub target_delay: Duration,
    /// Complete frames older than this are dropped
    pub max_delay: Duration,
    /// Maximum complete frames held; further completions are rejected
    pub max_frames: usize,
    /// Drop complete delta frames until a keyframe has been accepted
    pub wait_for_keyframe: bool,
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            target_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            max_frames: 30,
            wait_for_keyframe: true,
        }
    }
}

/// A reassembled video frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedFrame {
    /// Concatenated payload in sequence order
    pub data: Bytes,
    /// RTP timestamp shared by the frame's packets
    pub rtp_timestamp: RtpTimestamp,
    /// First sequence number of the frame
    pub sequence_start: RtpSequenceNumber,
    /// Last sequence number (marker bearer)
    pub sequence_end: RtpSequenceNumber,
    /// Arrival time of the frame's first packet
    pub arrival_time: Instant,
    /// True when any packet carried the keyframe hint
    pub is_keyframe: bool,
}

/// Frame buffer counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameBufferStats {
    /// Frames completed into the queue
    pub frames_buffered: u64,
    /// Frames handed to the consumer
    pub frames_decoded: u64,
    /// Frames dropped (age, keyframe gate, abandoned assembly)
    pub frames_dropped: u64,
    /// Missing sequences reported through NACK lists
    pub packets_lost: u64,
}

struct FrameAssembler {
    packets: BTreeMap<u16, Bytes>,
    first_sequence: RtpSequenceNumber,
    last_sequence: RtpSequenceNumber,
    has_first: bool,
    has_last: bool,
    is_keyframe: bool,
    first_arrival: Instant,
}

impl FrameAssembler {
    fn new(now: Instant) -> Self {
        Self {
            packets: BTreeMap::new(),
            first_sequence: 0,
            last_sequence: 0,
            has_first: false,
            has_last: false,
            is_keyframe: false,
            first_arrival: now,
        }
    }

    fn is_complete(&self) -> bool {
        if !self.has_first || !self.has_last {
            return false;
        }
        let span = self.last_sequence.wrapping_sub(self.first_sequence);
        // A frame longer than the tracking window cannot be trusted
        if span >= SEQUENCE_HISTORY {
            return false;
        }
        (0..=span).all(|offset| {
            self.packets
                .contains_key(&self.first_sequence.wrapping_add(offset))
        })
    }

    fn assemble(&self, timestamp: RtpTimestamp) -> BufferedFrame {
        let mut data = BytesMut::new();
        let mut seq = self.first_sequence;
        loop {
            if let Some(payload) = self.packets.get(&seq) {
                data.extend_from_slice(payload);
            }
            if seq == self.last_sequence {
                break;
            }
            seq = seq.wrapping_add(1);
        }

        BufferedFrame {
            data: data.freeze(),
            rtp_timestamp: timestamp,
            sequence_start: self.first_sequence,
            sequence_end: self.last_sequence,
            arrival_time: self.first_arrival,
            is_keyframe: self.is_keyframe,
        }
    }
}

/// Reassembles RTP video packets into complete, playout-delayed frames.
pub struct FrameBuffer {
    config: FrameBufferConfig,
    clock: Arc<dyn Clock>,

    assemblers: HashMap<RtpTimestamp, FrameAssembler>,
    complete_frames: VecDeque<BufferedFrame>,
    received_sequences: BTreeSet<u16>,
    highest_sequence: RtpSequenceNumber,
    base_sequence: RtpSequenceNumber,
    sequence_seen: bool,
    has_keyframe: bool,
    drops_since_keyframe: u64,

    stats: FrameBufferStats,
}

impl FrameBuffer {
    /// Create a buffer with the real clock.
    pub fn new(config: FrameBufferConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock))
    }

    /// Create a buffer driven by an explicit clock (tests).
    pub fn with_clock(config: FrameBufferConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            assemblers: HashMap::new(),
            complete_frames: VecDeque::new(),
            received_sequences: BTreeSet::new(),
            highest_sequence: 0,
            base_sequence: 0,
            sequence_seen: false,
            has_keyframe: false,
            drops_since_keyframe: 0,
            stats: FrameBufferStats::default(),
        }
    }

    /// Insert one RTP packet's payload.
    ///
    /// `marker` closes the frame; `keyframe_hint` marks the frame as
    /// intra-coded (derived from the payload header by the caller).
    /// Fails when the frame this packet completes has nowhere to go
    /// because the complete queue is at capacity.
    pub fn insert_packet(
        &mut self,
        payload: &[u8],
        sequence: RtpSequenceNumber,
        timestamp: RtpTimestamp,
        marker: bool,
        keyframe_hint: bool,
    ) -> crate::Result<()> {
        let now = self.clock.now();

        self.received_sequences.insert(sequence);
        if !self.sequence_seen {
            self.base_sequence = sequence;
        }
        if !self.sequence_seen || (sequence.wrapping_sub(self.highest_sequence) as i16) > 0 {
            self.highest_sequence = sequence;
            self.sequence_seen = true;
        }
        if (sequence.wrapping_sub(self.base_sequence) as i16) < 0 {
            self.base_sequence = sequence;
        }
        self.prune_sequence_history();

        let assembler = self
            .assemblers
            .entry(timestamp)
            .or_insert_with(|| FrameAssembler::new(now));

        assembler
            .packets
            .insert(sequence, Bytes::copy_from_slice(payload));

        if !assembler.has_first
            || (sequence.wrapping_sub(assembler.first_sequence) as i16) < 0
        {
            assembler.first_sequence = sequence;
            assembler.has_first = true;
        }
        if marker {
            assembler.last_sequence = sequence;
            assembler.has_last = true;
        }
        if keyframe_hint {
            assembler.is_keyframe = true;
        }

        if assembler.is_complete() {
            let frame = assembler.assemble(timestamp);
            self.assemblers.remove(&timestamp);

            if self.config.wait_for_keyframe && !self.has_keyframe && !frame.is_keyframe {
                trace!(timestamp, "dropping delta frame before first keyframe");
                self.stats.frames_dropped += 1;
                self.drops_since_keyframe += 1;
            } else if self.complete_frames.len() >= self.config.max_frames {
                self.stats.frames_dropped += 1;
                self.drops_since_keyframe += 1;
                self.cleanup(now);
                return Err(crate::Error::BufferFull {
                    capacity: self.config.max_frames,
                });
            } else {
                if frame.is_keyframe {
                    self.has_keyframe = true;
                    self.drops_since_keyframe = 0;
                }
                self.complete_frames.push_back(frame);
                self.stats.frames_buffered += 1;
            }
        }

        self.cleanup(now);
        Ok(())
    }

    /// Pop the oldest complete frame once its playout delay has elapsed.
    pub fn pop_frame(&mut self) -> Option<BufferedFrame> {
        let now = self.clock.now();
        let front_age = now.saturating_duration_since(self.complete_frames.front()?.arrival_time);
        if front_age < self.config.target_delay {
            return None;
        }

        let frame = self.complete_frames.pop_front()?;
        self.stats.frames_decoded += 1;
        Some(frame)
    }

    /// Oldest complete frame without consuming it, regardless of delay.
    pub fn peek_frame(&self) -> Option<&BufferedFrame> {
        self.complete_frames.front()
    }

    /// True when a complete frame is queued.
    pub fn has_complete_frame(&self) -> bool {
        !self.complete_frames.is_empty()
    }

    /// Missing sequence numbers in the recent receive window, capped at
    /// `max` entries.
    pub fn nack_list(&mut self, max: usize) -> Vec<RtpSequenceNumber> {
        if !self.sequence_seen {
            return Vec::new();
        }

        let mut missing = Vec::new();
        let mut start = self.highest_sequence.wrapping_sub(NACK_WINDOW);
        // Never report sequences from before the stream began
        if (self.base_sequence.wrapping_sub(start) as i16) > 0 {
            start = self.base_sequence;
        }
        let mut seq = start;
        while seq != self.highest_sequence && missing.len() < max {
            if !self.received_sequences.contains(&seq) {
                missing.push(seq);
                self.stats.packets_lost += 1;
            }
            seq = seq.wrapping_add(1);
        }
        missing
    }

    /// Whether the consumer should ask the sender for a keyframe.
    pub fn should_request_keyframe(&self) -> bool {
        !self.has_keyframe || self.drops_since_keyframe > 10
    }

    /// Counter snapshot.
    pub fn stats(&self) -> FrameBufferStats {
        self.stats
    }

    /// Discard all state, returning to the pre-keyframe condition.
    pub fn reset(&mut self) {
        self.assemblers.clear();
        self.complete_frames.clear();
        self.received_sequences.clear();
        self.sequence_seen = false;
        self.has_keyframe = false;
        self.drops_since_keyframe = 0;
        self.stats = FrameBufferStats::default();
    }

    fn cleanup(&mut self, now: Instant) {
        // Old complete frames are no longer worth decoding
        while let Some(front) = self.complete_frames.front() {
            if now.saturating_duration_since(front.arrival_time) > self.config.max_delay {
                debug!(timestamp = front.rtp_timestamp, "dropping stale complete frame");
                self.complete_frames.pop_front();
                self.stats.frames_dropped += 1;
                self.drops_since_keyframe += 1;
            } else {
                break;
            }
        }

        // Assemblers that never completed are abandoned after 2x max_delay
        let deadline = self.config.max_delay * 2;
        let stale: Vec<RtpTimestamp> = self
            .assemblers
            .iter()
            .filter(|(_, a)| now.saturating_duration_since(a.first_arrival) > deadline)
            .map(|(ts, _)| *ts)
            .collect();
        for timestamp in stale {
            debug!(timestamp, "abandoning incomplete frame");
            self.assemblers.remove(&timestamp);
            self.stats.frames_dropped += 1;
            self.drops_since_keyframe += 1;
        }
    }

    fn prune_sequence_history(&mut self) {
        // Keep only sequences within the recent window, wrap-aware
        let cutoff = SEQUENCE_HISTORY;
        let highest = self.highest_sequence;
        self.received_sequences
            .retain(|seq| (highest.wrapping_sub(*seq)) < cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confero_infra_common::clock::ManualClock;

    fn buffer() -> (FrameBuffer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let fb = FrameBuffer::with_clock(
            FrameBufferConfig::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (fb, clock)
    }

    #[test]
    fn test_reordered_packets_assemble_in_sequence_order() {
        let (mut fb, clock) = buffer();

        fb.insert_packet(b"A", 10, 1000, false, true).unwrap();
        fb.insert_packet(b"C", 12, 1000, true, false).unwrap();
        fb.insert_packet(b"B", 11, 1000, false, false).unwrap();

        assert!(fb.has_complete_frame());
        clock.advance(Duration::from_millis(60));

        let frame = fb.pop_frame().expect("frame ready after target delay");
        assert_eq!(&frame.data[..], b"ABC");
        assert!(frame.is_keyframe);
        assert_eq!(frame.sequence_start, 10);
        assert_eq!(frame.sequence_end, 12);
    }

    #[test]
    fn test_incomplete_frame_is_not_popped() {
        let (mut fb, clock) = buffer();

        fb.insert_packet(b"A", 10, 1000, false, true).unwrap();
        fb.insert_packet(b"C", 12, 1000, true, false).unwrap();
        clock.advance(Duration::from_millis(60));

        assert!(!fb.has_complete_frame());
        assert!(fb.pop_frame().is_none());
    }

    #[test]
    fn test_playout_delay_is_enforced() {
        let (mut fb, clock) = buffer();

        fb.insert_packet(b"X", 1, 500, true, true).unwrap();
        assert!(fb.has_complete_frame());
        assert!(fb.pop_frame().is_none(), "too early");

        clock.advance(Duration::from_millis(50));
        assert!(fb.pop_frame().is_some());
    }

    #[test]
    fn test_sequence_wraparound_completeness() {
        let (mut fb, clock) = buffer();

        fb.insert_packet(b"A", 65534, 9000, false, true).unwrap();
        fb.insert_packet(b"B", 65535, 9000, false, false).unwrap();
        fb.insert_packet(b"C", 0, 9000, false, false).unwrap();
        fb.insert_packet(b"D", 1, 9000, true, false).unwrap();

        clock.advance(Duration::from_millis(60));
        let frame = fb.pop_frame().expect("wrapped frame completes");
        assert_eq!(&frame.data[..], b"ABCD");
        assert_eq!(frame.sequence_start, 65534);
        assert_eq!(frame.sequence_end, 1);
    }

    #[test]
    fn test_keyframe_gate_drops_leading_delta_frames() {
        let (mut fb, clock) = buffer();

        fb.insert_packet(b"delta", 1, 100, true, false).unwrap();
        clock.advance(Duration::from_millis(60));
        assert!(fb.pop_frame().is_none());
        assert_eq!(fb.stats().frames_dropped, 1);

        fb.insert_packet(b"key", 2, 200, true, true).unwrap();
        clock.advance(Duration::from_millis(60));
        let frame = fb.pop_frame().expect("keyframe passes the gate");
        assert!(frame.is_keyframe);

        // Delta frames flow once a keyframe was accepted
        fb.insert_packet(b"delta2", 3, 300, true, false).unwrap();
        clock.advance(Duration::from_millis(60));
        assert!(fb.pop_frame().is_some());
    }

    #[test]
    fn test_stale_complete_frames_are_dropped() {
        let (mut fb, clock) = buffer();

        fb.insert_packet(b"old", 1, 100, true, true).unwrap();
        clock.advance(Duration::from_millis(250));

        // Any insert triggers cleanup
        fb.insert_packet(b"new", 2, 200, true, false).unwrap();
        assert_eq!(fb.stats().frames_dropped, 1);
        clock.advance(Duration::from_millis(60));
        let frame = fb.pop_frame().expect("fresh frame remains");
        assert_eq!(&frame.data[..], b"new");
    }

    #[test]
    fn test_abandoned_assembler_counts_as_drop() {
        let (mut fb, clock) = buffer();

        fb.insert_packet(b"lonely", 5, 100, false, true).unwrap();
        clock.advance(Duration::from_millis(450)); // past 2 * max_delay

        fb.insert_packet(b"next", 6, 200, true, false).unwrap();
        assert!(fb.stats().frames_dropped >= 1);
    }

    #[test]
    fn test_nack_list_reports_gaps() {
        let (mut fb, _clock) = buffer();

        fb.insert_packet(b"a", 100, 1000, false, true).unwrap();
        fb.insert_packet(b"b", 103, 1000, false, false).unwrap();

        let nacks = fb.nack_list(10);
        assert!(nacks.contains(&101));
        assert!(nacks.contains(&102));
        assert!(!nacks.contains(&100));
        // highest itself is excluded from the window
        assert!(!nacks.contains(&103));
    }

    #[test]
    fn test_nack_list_respects_cap() {
        let (mut fb, _clock) = buffer();

        fb.insert_packet(b"a", 0, 1000, false, true).unwrap();
        fb.insert_packet(b"b", 90, 1000, false, false).unwrap();

        let nacks = fb.nack_list(5);
        assert_eq!(nacks.len(), 5);
    }

    #[test]
    fn test_keyframe_request_policy() {
        let (mut fb, clock) = buffer();
        assert!(fb.should_request_keyframe(), "no keyframe yet");

        fb.insert_packet(b"key", 1, 100, true, true).unwrap();
        clock.advance(Duration::from_millis(60));
        fb.pop_frame().unwrap();
        assert!(!fb.should_request_keyframe());

        // Accumulate more than 10 drops since the keyframe
        for i in 0..12u16 {
            fb.insert_packet(b"late", 10 + i, 1000 + i as u32, true, false).unwrap();
            clock.advance(Duration::from_millis(250));
            fb.insert_packet(b"tick", 100 + i, 5000 + i as u32, false, false).unwrap();
        }
        assert!(fb.should_request_keyframe());
    }

    #[test]
    fn test_complete_queue_capacity_rejects() {
        let clock = Arc::new(ManualClock::new());
        let mut fb = FrameBuffer::with_clock(
            FrameBufferConfig {
                max_frames: 2,
                ..Default::default()
            },
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        fb.insert_packet(b"k", 1, 100, true, true).unwrap();
        fb.insert_packet(b"a", 2, 200, true, false).unwrap();
        let err = fb.insert_packet(b"b", 3, 300, true, false).unwrap_err();

        assert_eq!(err, crate::Error::BufferFull { capacity: 2 });
        assert_eq!(fb.stats().frames_dropped, 1);
        assert_eq!(fb.stats().frames_buffered, 2);
    }

    #[test]
    fn test_reset_restores_keyframe_gate() {
        let (mut fb, clock) = buffer();
        fb.insert_packet(b"key", 1, 100, true, true).unwrap();
        clock.advance(Duration::from_millis(60));
        assert!(fb.pop_frame().is_some());

        fb.reset();
        assert!(fb.should_request_keyframe());
        fb.insert_packet(b"delta", 2, 200, true, false).unwrap();
        clock.advance(Duration::from_millis(60));
        assert!(fb.pop_frame().is_none(), "gate re-armed after reset");
    }
}
