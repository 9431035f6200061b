//! # RTP core for the Confero media engine
//!
//! Wire-level RTP/RTCP handling (RFC 3550, RFC 4585) plus the two
//! rate-control pieces that live closest to the packets: a GCC-style
//! bitrate controller and a token-bucket egress pacer.
//!
//! Parsing never panics; malformed input comes back as a typed [`Error`]
//! so ingress paths can count and drop.

pub mod error;
pub mod feedback;
pub mod pacer;
pub mod packet;

pub use error::Error;

/// Result type for RTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// RTP synchronisation source identifier
pub type RtpSsrc = u32;

/// RTP contributing source identifier
pub type RtpCsrc = u32;

/// RTP sequence number
pub type RtpSequenceNumber = u16;

/// RTP timestamp (media clock units)
pub type RtpTimestamp = u32;

pub use feedback::{BitrateController, BitrateControllerConfig, BitrateEstimate, SimulcastLayer};
pub use pacer::{Pacer, PacerConfig, PacerStats};
pub use packet::rtcp::RtcpPacket;
pub use packet::{RtpHeader, RtpPacket, RtpPacketBuilder};
