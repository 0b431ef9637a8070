//! SDK errors.

use plughost_core::Capability;
use thiserror::Error;

/// Errors surfaced to guest code.
#[derive(Debug, Error)]
pub enum SdkError {
    /// The instance lacks a grant for the requested operation.
    #[error("denied: {capability} on {target}")]
    Denied {
        /// Requested capability.
        capability: Capability,
        /// Requested target.
        target: String,
    },

    /// The host ran the operation and it failed.
    #[error("host call failed: {0}")]
    Failed(String),

    /// The host reply had an unexpected shape.
    #[error("unexpected host reply: {0}")]
    UnexpectedReply(String),

    /// The host side of the channel is gone.
    #[error("host disconnected")]
    Disconnected,

    /// Stdio transport error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire encoding error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for SDK operations.
pub type SdkResult<T> = Result<T, SdkError>;
