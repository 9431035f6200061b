//! # Media plane building blocks for the Confero engine
//!
//! Sits between the packet plane (`confero-rtp-core`) and the forwarding
//! plane (`confero-sfu-core`): video packets are reassembled into complete
//! frames here, and audio packets are reordered and delay-adapted before
//! decode.

pub mod error;
pub mod frame_buffer;
pub mod jitter;
pub mod types;

pub use error::Error;
pub use frame_buffer::{BufferedFrame, FrameBuffer, FrameBufferConfig, FrameBufferStats};
pub use jitter::{JitterBuffer, JitterBufferConfig, JitterBufferStats, JitterFrame};
pub use types::{CodecAdapter, MediaKind, ParticipantId, RoomId, StreamId};

/// Result type for media operations
pub type Result<T> = std::result::Result<T, Error>;
