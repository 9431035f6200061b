//! # Selective forwarding core for the Confero media engine
//!
//! The forwarding plane: per-SSRC fan-out with optional rewrite
//! ([`RtpForwarder`]), the decision plane mapping bandwidth estimates to
//! simulcast layers ([`SubscriptionManager`]), the MCU-style audio mixer
//! ([`AudioMixer`]) and the [`SfuEngine`] that wires RTCP feedback through
//! all of them.

pub mod engine;
pub mod error;
pub mod forwarder;
pub mod mixer;
pub mod subscription;
pub mod types;

pub use engine::{SfuEngine, SfuEngineConfig};
pub use error::Error;
pub use forwarder::{ForwarderStats, RtpForwarder};
pub use mixer::{AudioMixer, AudioMixerConfig, AudioMixerStats, MixingParams};
pub use subscription::{BandwidthInfo, Subscription, SubscriptionManager};
pub use types::{
    ActiveSpeakerSink, ForwardingRule, LayerSwitchSink, MixedAudioSink, PacketSink, RtpStreamInfo,
};

/// Result type for SFU operations
pub type Result<T> = std::result::Result<T, Error>;
