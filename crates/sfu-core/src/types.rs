//! Stream descriptors, forwarding rules and the sink traits callbacks
//! cross thread boundaries through.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use confero_media_core::{MediaKind, ParticipantId, StreamId};
use confero_rtp_core::{RtpSsrc, RtpTimestamp};

/// Attributes of a published RTP stream. Immutable after registration; a
/// changed stream is a new registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpStreamInfo {
    /// Wire SSRC of the stream
    pub ssrc: RtpSsrc,
    /// RTP payload type
    pub payload_type: u8,
    /// Audio or video
    pub kind: MediaKind,
    /// Simulcast layer index (0 = low), -1 when the stream is not simulcast
    pub simulcast_layer: i32,
    /// Codec tag, e.g. "opus" or "vp8"
    pub codec: String,
}

impl RtpStreamInfo {
    /// Describe a non-simulcast audio stream.
    pub fn audio(ssrc: RtpSsrc, payload_type: u8, codec: impl Into<String>) -> Self {
        Self {
            ssrc,
            payload_type,
            kind: MediaKind::Audio,
            simulcast_layer: -1,
            codec: codec.into(),
        }
    }

    /// Describe one simulcast layer of a video stream.
    pub fn video_layer(
        ssrc: RtpSsrc,
        payload_type: u8,
        codec: impl Into<String>,
        layer: i32,
    ) -> Self {
        Self {
            ssrc,
            payload_type,
            kind: MediaKind::Video,
            simulcast_layer: layer,
            codec: codec.into(),
        }
    }
}

/// Fan-out rule attaching one subscriber to one publisher stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    /// Receiving participant
    pub subscriber_id: ParticipantId,
    /// Where the packets go
    pub destination: SocketAddr,
    /// SSRC to stamp into outgoing packets; zero forwards unmodified
    pub rewritten_ssrc: RtpSsrc,
    /// Simulcast layer the subscriber wants; -1 accepts any
    pub preferred_layer: i32,
    /// Inactive rules are skipped without being removed
    pub active: bool,
}

impl ForwardingRule {
    /// Rule forwarding everything unmodified to `destination`.
    pub fn passthrough(subscriber_id: ParticipantId, destination: SocketAddr) -> Self {
        Self {
            subscriber_id,
            destination,
            rewritten_ssrc: 0,
            preferred_layer: -1,
            active: true,
        }
    }
}

/// Egress sink the forwarder emits into. Packets are borrowed; the sink
/// copies only if it must outlive the call.
pub trait PacketSink: Send + Sync {
    /// Deliver `packet` for `subscriber` to `destination`.
    fn send(&self, subscriber: &ParticipantId, packet: &[u8], destination: SocketAddr);
}

impl<F: Fn(&ParticipantId, &[u8], SocketAddr) + Send + Sync> PacketSink for F {
    fn send(&self, subscriber: &ParticipantId, packet: &[u8], destination: SocketAddr) {
        self(subscriber, packet, destination)
    }
}

/// Notified when automatic layer selection switches a subscription.
pub trait LayerSwitchSink: Send + Sync {
    /// `old` and `new` are layer indices.
    fn on_layer_switch(
        &self,
        subscriber: &ParticipantId,
        publisher: &ParticipantId,
        stream: &StreamId,
        old: i32,
        new: i32,
    );
}

impl<F: Fn(&ParticipantId, &ParticipantId, &StreamId, i32, i32) + Send + Sync> LayerSwitchSink
    for F
{
    fn on_layer_switch(
        &self,
        subscriber: &ParticipantId,
        publisher: &ParticipantId,
        stream: &StreamId,
        old: i32,
        new: i32,
    ) {
        self(subscriber, publisher, stream, old, new)
    }
}

/// Receives each recipient's mix once per tick.
pub trait MixedAudioSink: Send + Sync {
    /// `samples` are interleaved i16 PCM for one frame.
    fn on_mixed_audio(&self, recipient: &ParticipantId, samples: &[i16], timestamp: RtpTimestamp);
}

impl<F: Fn(&ParticipantId, &[i16], RtpTimestamp) + Send + Sync> MixedAudioSink for F {
    fn on_mixed_audio(&self, recipient: &ParticipantId, samples: &[i16], timestamp: RtpTimestamp) {
        self(recipient, samples, timestamp)
    }
}

/// Notified when the active speaker changes.
pub trait ActiveSpeakerSink: Send + Sync {
    /// `level_dbfs` is the speaker's level at the moment of transition.
    fn on_active_speaker(&self, participant: &ParticipantId, level_dbfs: f32);
}

impl<F: Fn(&ParticipantId, f32) + Send + Sync> ActiveSpeakerSink for F {
    fn on_active_speaker(&self, participant: &ParticipantId, level_dbfs: f32) {
        self(participant, level_dbfs)
    }
}

/// Notified when a subscriber asks the publisher for a keyframe (PLI/FIR).
pub trait KeyframeRequestSink: Send + Sync {
    /// `ssrc` identifies the publisher stream being refreshed.
    fn on_keyframe_request(&self, ssrc: RtpSsrc);
}

impl<F: Fn(RtpSsrc) + Send + Sync> KeyframeRequestSink for F {
    fn on_keyframe_request(&self, ssrc: RtpSsrc) {
        self(ssrc)
    }
}
