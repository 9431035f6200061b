//! Error types for RTP/RTCP handling.

use thiserror::Error;

/// Errors produced while parsing, serialising or pacing RTP traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer is shorter than the structure being read
    #[error("buffer too small: required {required} bytes, available {available}")]
    BufferTooSmall {
        /// Bytes the structure needs
        required: usize,
        /// Bytes actually present
        available: usize,
    },

    /// RTP version field was not 2
    #[error("invalid RTP version: {0}")]
    InvalidVersion(u8),

    /// Padding length exceeds the payload it trims
    #[error("invalid padding length {padding} for payload of {payload} bytes")]
    InvalidPadding {
        /// Declared padding octets
        padding: usize,
        /// Payload bytes available
        payload: usize,
    },

    /// Malformed RTCP structure
    #[error("RTCP error: {0}")]
    RtcpError(String),

    /// Unknown RTCP packet or feedback format
    #[error("unknown RTCP packet type: {0}")]
    UnknownRtcpType(u8),

    /// Value cannot be represented on the wire
    #[error("value out of range: {0}")]
    OutOfRange(String),

    /// Pacer queue is at capacity
    #[error("pacer queue full ({capacity} packets)")]
    QueueFull {
        /// Configured queue bound
        capacity: usize,
    },
}
