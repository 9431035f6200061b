//! Error types for the forwarding plane.

use confero_rtp_core::RtpSsrc;
use thiserror::Error;

/// Errors produced by the SFU core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An SSRC is already registered with different stream attributes
    #[error("SSRC collision: {ssrc:#010x} already registered")]
    SsrcCollision {
        /// The colliding SSRC
        ssrc: RtpSsrc,
    },

    /// Referenced publisher does not exist
    #[error("unknown publisher: {0}")]
    UnknownPublisher(String),

    /// Referenced subscription does not exist
    #[error("unknown subscription: subscriber {subscriber} -> publisher {publisher}")]
    UnknownSubscription {
        /// Subscriber participant id
        subscriber: String,
        /// Publisher participant id
        publisher: String,
    },

    /// Layer table violates the non-decreasing bitrate convention
    #[error("invalid layer table: {0}")]
    InvalidLayerTable(String),

    /// Packet too short for the requested operation
    #[error("packet too short: {size} bytes")]
    PacketTooShort {
        /// Observed packet size
        size: usize,
    },
}
