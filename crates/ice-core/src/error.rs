//! Error types for ICE, STUN and TURN.

use thiserror::Error;

/// Errors produced by the ICE stack.
#[derive(Error, Debug)]
pub enum Error {
    /// Buffer is shorter than the structure being read
    #[error("buffer too small: required {required} bytes, available {available}")]
    BufferTooSmall {
        /// Bytes the structure needs
        required: usize,
        /// Bytes actually present
        available: usize,
    },

    /// Not a STUN message (bad magic or leading bits)
    #[error("not a STUN message")]
    NotStun,

    /// Malformed STUN message or attribute
    #[error("STUN error: {0}")]
    StunError(String),

    /// MESSAGE-INTEGRITY verification failed
    #[error("STUN message integrity check failed")]
    IntegrityMismatch,

    /// FINGERPRINT verification failed
    #[error("STUN fingerprint check failed")]
    FingerprintMismatch,

    /// Malformed candidate SDP line
    #[error("invalid candidate line: {0}")]
    InvalidCandidate(String),

    /// TURN server rejected a request
    #[error("TURN error {code}: {reason}")]
    TurnError {
        /// STUN error code
        code: u16,
        /// Reason phrase from the server
        reason: String,
    },

    /// Operation invalid in the agent's current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Generic ICE processing failure
    #[error("ICE error: {0}")]
    IceError(String),

    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
