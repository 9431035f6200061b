//! Per-packet RTP fan-out.
//!
//! The SSRC table sits behind a reader-writer lock; the packet path takes
//! the read side only. Rule mutation takes the write side and is rare
//! relative to packet arrival. Stats are atomics so the hot path never
//! upgrades its lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use confero_media_core::{ParticipantId, StreamId};
use confero_rtp_core::packet::RTP_SSRC_OFFSET;
use confero_rtp_core::RtpSsrc;

use crate::error::Error;
use crate::types::{ForwardingRule, PacketSink, RtpStreamInfo};
use crate::Result;

/// Forwarder counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ForwarderStats {
    /// Packets that matched a registered SSRC
    pub packets_received: u64,
    /// Bytes received on registered SSRCs
    pub bytes_received: u64,
    /// Emissions to the sink
    pub packets_forwarded: u64,
    /// Bytes emitted
    pub bytes_forwarded: u64,
    /// Packets dropped for an unknown SSRC
    pub packets_dropped: u64,
    /// Registered publishers
    pub active_publishers: usize,
    /// Distinct subscribers across all rules
    pub active_subscribers: usize,
}

struct PublisherStream {
    publisher_id: ParticipantId,
    stream_id: StreamId,
    info: RtpStreamInfo,
    rules: Vec<ForwardingRule>,
}

#[derive(Default)]
struct Tables {
    ssrc_to_stream: HashMap<RtpSsrc, PublisherStream>,
    publisher_ssrcs: HashMap<ParticipantId, Vec<RtpSsrc>>,
    sink: Option<Arc<dyn PacketSink>>,
}

/// Demultiplexes incoming RTP by SSRC and fans out to forwarding rules.
pub struct RtpForwarder {
    tables: RwLock<Tables>,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    packets_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    packets_dropped: AtomicU64,
}

impl Default for RtpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpForwarder {
    /// Create an empty forwarder.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_forwarded: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
        }
    }

    /// Install the egress sink.
    pub fn set_packet_sink(&self, sink: Arc<dyn PacketSink>) {
        self.tables.write().sink = Some(sink);
    }

    /// Register a publisher stream under its SSRC.
    ///
    /// Re-registering an SSRC that is live with different attributes is an
    /// [`Error::SsrcCollision`]; the existing registration wins.
    pub fn register_publisher(
        &self,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
        info: RtpStreamInfo,
    ) -> Result<()> {
        let mut tables = self.tables.write();

        if let Some(existing) = tables.ssrc_to_stream.get(&info.ssrc) {
            if existing.publisher_id == *publisher_id
                && existing.stream_id == *stream_id
                && existing.info == info
            {
                return Ok(());
            }
            return Err(Error::SsrcCollision { ssrc: info.ssrc });
        }

        debug!(publisher = %publisher_id, stream = %stream_id, ssrc = info.ssrc,
               kind = %info.kind, "publisher registered");
        let ssrc = info.ssrc;
        tables.ssrc_to_stream.insert(
            ssrc,
            PublisherStream {
                publisher_id: publisher_id.clone(),
                stream_id: stream_id.clone(),
                info,
                rules: Vec::new(),
            },
        );
        tables
            .publisher_ssrcs
            .entry(publisher_id.clone())
            .or_default()
            .push(ssrc);
        Ok(())
    }

    /// Remove one stream of a publisher.
    pub fn unregister_publisher(&self, publisher_id: &ParticipantId, stream_id: &StreamId) {
        let mut tables = self.tables.write();

        let Some(ssrcs) = tables.publisher_ssrcs.get(publisher_id).cloned() else {
            return;
        };
        let mut remaining = Vec::with_capacity(ssrcs.len());
        for ssrc in ssrcs {
            let matches = tables
                .ssrc_to_stream
                .get(&ssrc)
                .map(|s| s.stream_id == *stream_id)
                .unwrap_or(false);
            if matches {
                tables.ssrc_to_stream.remove(&ssrc);
            } else {
                remaining.push(ssrc);
            }
        }
        if remaining.is_empty() {
            tables.publisher_ssrcs.remove(publisher_id);
        } else {
            tables
                .publisher_ssrcs
                .insert(publisher_id.clone(), remaining);
        }
    }

    /// Remove every stream of a publisher.
    pub fn remove_publisher(&self, publisher_id: &ParticipantId) {
        let mut tables = self.tables.write();
        if let Some(ssrcs) = tables.publisher_ssrcs.remove(publisher_id) {
            for ssrc in ssrcs {
                tables.ssrc_to_stream.remove(&ssrc);
            }
        }
    }

    /// Attach a subscription rule to every stream of `publisher_id`.
    pub fn subscribe(
        &self,
        publisher_id: &ParticipantId,
        subscriber_id: &ParticipantId,
        mut rule: ForwardingRule,
    ) -> Result<()> {
        rule.subscriber_id = subscriber_id.clone();
        let mut tables = self.tables.write();

        let ssrcs = tables
            .publisher_ssrcs
            .get(publisher_id)
            .cloned()
            .ok_or_else(|| Error::UnknownPublisher(publisher_id.clone()))?;

        for ssrc in ssrcs {
            if let Some(stream) = tables.ssrc_to_stream.get_mut(&ssrc) {
                stream
                    .rules
                    .retain(|r| r.subscriber_id != rule.subscriber_id);
                stream.rules.push(rule.clone());
            }
        }
        debug!(publisher = %publisher_id, subscriber = %subscriber_id, "subscription added");
        Ok(())
    }

    /// Detach a subscriber from every stream of `publisher_id`.
    pub fn unsubscribe(&self, publisher_id: &ParticipantId, subscriber_id: &ParticipantId) {
        let mut tables = self.tables.write();
        let Some(ssrcs) = tables.publisher_ssrcs.get(publisher_id).cloned() else {
            return;
        };
        for ssrc in ssrcs {
            if let Some(stream) = tables.ssrc_to_stream.get_mut(&ssrc) {
                stream.rules.retain(|r| r.subscriber_id != *subscriber_id);
            }
        }
    }

    /// Remove a subscriber from every publisher (departure cascade).
    pub fn remove_subscriber(&self, subscriber_id: &ParticipantId) {
        let mut tables = self.tables.write();
        for stream in tables.ssrc_to_stream.values_mut() {
            stream.rules.retain(|r| r.subscriber_id != *subscriber_id);
        }
    }

    /// Set the preferred simulcast layer on a subscriber's rules.
    pub fn set_preferred_layer(
        &self,
        publisher_id: &ParticipantId,
        subscriber_id: &ParticipantId,
        layer: i32,
    ) {
        let mut tables = self.tables.write();
        let Some(ssrcs) = tables.publisher_ssrcs.get(publisher_id).cloned() else {
            return;
        };
        for ssrc in ssrcs {
            if let Some(stream) = tables.ssrc_to_stream.get_mut(&ssrc) {
                for rule in &mut stream.rules {
                    if rule.subscriber_id == *subscriber_id {
                        rule.preferred_layer = layer;
                    }
                }
            }
        }
    }

    /// Activate or deactivate a subscriber's rules (pause semantics).
    pub fn set_rules_active(
        &self,
        publisher_id: &ParticipantId,
        subscriber_id: &ParticipantId,
        active: bool,
    ) {
        let mut tables = self.tables.write();
        let Some(ssrcs) = tables.publisher_ssrcs.get(publisher_id).cloned() else {
            return;
        };
        for ssrc in ssrcs {
            if let Some(stream) = tables.ssrc_to_stream.get_mut(&ssrc) {
                for rule in &mut stream.rules {
                    if rule.subscriber_id == *subscriber_id {
                        rule.active = active;
                    }
                }
            }
        }
    }

    /// Hot path: deliver one received RTP packet to interested rules.
    ///
    /// Unknown SSRCs are counted and dropped, never reported. A rule whose
    /// `rewritten_ssrc` differs from the stream's gets a one-copy rewrite of
    /// bytes 8..11; every other rule receives the original buffer borrowed.
    pub fn on_rtp_packet(&self, ssrc: RtpSsrc, packet: &[u8], _source: SocketAddr) {
        let tables = self.tables.read();

        let Some(stream) = tables.ssrc_to_stream.get(&ssrc) else {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(packet.len() as u64, Ordering::Relaxed);

        let Some(sink) = tables.sink.as_ref() else {
            return;
        };

        let mut rewrite_buffer: Option<Vec<u8>> = None;
        for rule in &stream.rules {
            if !rule.active {
                continue;
            }
            if stream.info.simulcast_layer >= 0
                && rule.preferred_layer >= 0
                && stream.info.simulcast_layer != rule.preferred_layer
            {
                continue;
            }

            if rule.rewritten_ssrc != 0 && rule.rewritten_ssrc != stream.info.ssrc {
                if packet.len() >= RTP_SSRC_OFFSET + 4 {
                    let buffer = rewrite_buffer.get_or_insert_with(|| packet.to_vec());
                    buffer[RTP_SSRC_OFFSET..RTP_SSRC_OFFSET + 4]
                        .copy_from_slice(&rule.rewritten_ssrc.to_be_bytes());
                    sink.send(&rule.subscriber_id, buffer, rule.destination);
                } else {
                    trace!(size = packet.len(), "packet too short for rewrite");
                    continue;
                }
            } else {
                sink.send(&rule.subscriber_id, packet, rule.destination);
            }

            self.packets_forwarded.fetch_add(1, Ordering::Relaxed);
            self.bytes_forwarded
                .fetch_add(packet.len() as u64, Ordering::Relaxed);
        }
    }

    /// All registered publishers.
    pub fn publishers(&self) -> Vec<ParticipantId> {
        self.tables.read().publisher_ssrcs.keys().cloned().collect()
    }

    /// Distinct subscribers of one publisher.
    pub fn subscribers(&self, publisher_id: &ParticipantId) -> Vec<ParticipantId> {
        let tables = self.tables.read();
        let mut result: Vec<ParticipantId> = Vec::new();
        if let Some(ssrcs) = tables.publisher_ssrcs.get(publisher_id) {
            for ssrc in ssrcs {
                if let Some(stream) = tables.ssrc_to_stream.get(ssrc) {
                    for rule in &stream.rules {
                        if !result.contains(&rule.subscriber_id) {
                            result.push(rule.subscriber_id.clone());
                        }
                    }
                }
            }
        }
        result
    }

    /// Stream info registered for an SSRC.
    pub fn stream_info(&self, ssrc: RtpSsrc) -> Option<RtpStreamInfo> {
        self.tables
            .read()
            .ssrc_to_stream
            .get(&ssrc)
            .map(|s| s.info.clone())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ForwarderStats {
        let tables = self.tables.read();
        let mut subscribers: Vec<&ParticipantId> = Vec::new();
        for stream in tables.ssrc_to_stream.values() {
            for rule in &stream.rules {
                if !subscribers.contains(&&rule.subscriber_id) {
                    subscribers.push(&rule.subscriber_id);
                }
            }
        }

        ForwarderStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_forwarded: self.packets_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            active_publishers: tables.publisher_ssrcs.len(),
            active_subscribers: subscribers.len(),
        }
    }
}
