//! Error types for event sources and the event log.

use thiserror::Error;

/// Errors from device detection and the event log.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Filesystem I/O failed.
    #[error("I/O error at {path}: {message}")]
    Io {
        /// Path involved.
        path: String,
        /// Underlying error.
        message: String,
    },

    /// A log entry or cursor file could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Another process holds the log lock.
    #[error("event log at {0} is locked by another process")]
    Locked(String),

    /// Stream names are limited to `[A-Za-z0-9_-]`.
    #[error("invalid stream name '{0}'")]
    InvalidStream(String),

    /// The platform watcher could not be started.
    #[error("watcher error: {0}")]
    Watcher(String),
}

impl DeviceError {
    pub(crate) fn io(path: &std::path::Path, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;
