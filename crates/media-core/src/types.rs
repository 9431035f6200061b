//! Identifiers and media types shared across the engine.

use serde::{Deserialize, Serialize};

/// Opaque participant identifier, unique within a process.
pub type ParticipantId = String;

/// Opaque stream identifier, unique per participant.
pub type StreamId = String;

/// Opaque room identifier.
pub type RoomId = String;

/// What a stream carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    /// Audio samples
    Audio,
    /// Video frames
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Opaque audio codec supplied by the host. The engine never inspects
/// encoded bytes; it only moves them.
pub trait CodecAdapter: Send + Sync {
    /// Encode one PCM frame.
    fn encode(&self, pcm: &[i16]) -> Vec<u8>;

    /// Decode one encoded frame to PCM.
    fn decode(&self, encoded: &[u8]) -> Vec<i16>;
}
