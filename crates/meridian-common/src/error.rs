//! Error types for Project Meridian.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for streaming and persistence operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding a record failed
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Decoding a record failed
    #[error("Deserialization failed for {}: {reason}", path.display())]
    Deserialization {
        /// File being decoded
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// File does not carry the expected magic bytes
    #[error("Invalid file format: {}", .0.display())]
    InvalidFormat(PathBuf),

    /// Schema version mismatch
    #[error("Schema version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Expected version
        expected: String,
        /// Actual version found
        actual: String,
    },

    /// A worker task panicked
    #[error("Worker task panicked: {0}")]
    WorkerPanicked(String),

    /// A worker dropped its task without reporting a result
    #[error("Worker disconnected before completing its task")]
    WorkerDisconnected,
}

impl StreamError {
    /// Returns whether the error means stored data is unreadable, as opposed
    /// to the storage itself failing.
    #[must_use]
    pub const fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::Deserialization { .. } | Self::InvalidFormat(_) | Self::VersionMismatch { .. }
        )
    }
}

/// Result type alias for streaming operations.
pub type StreamResult<T> = Result<T, StreamError>;
