//! Error types for the media plane.

use thiserror::Error;

/// Errors produced by media-plane components.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buffer is at capacity
    #[error("buffer full: {capacity} entries")]
    BufferFull {
        /// Configured bound
        capacity: usize,
    },
}
