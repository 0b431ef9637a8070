//! Grant compilation errors.

use thiserror::Error;

/// Errors raised while compiling manifest grants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    /// A grant pattern could not be compiled.
    #[error("invalid grant pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The pattern as written in the manifest.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Result type for permission operations.
pub type PermissionResult<T> = Result<T, PermissionError>;
