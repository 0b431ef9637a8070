//! Error types for core identity parsing.

use thiserror::Error;

/// Errors raised while constructing core identity types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// Plugin name does not match `[a-z0-9-]{3,50}`.
    #[error("invalid plugin name '{0}': must be 3-50 characters of [a-z0-9-]")]
    InvalidName(String),

    /// Version is not a semantic version.
    #[error("invalid version '{version}': {reason}")]
    InvalidVersion {
        /// The rejected version string.
        version: String,
        /// Parser message.
        reason: String,
    },

    /// Instance id is not of the form `name@version`.
    #[error("invalid instance id '{0}': expected name@version")]
    InvalidInstanceId(String),

    /// Unknown capability string.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    /// Unknown hook name.
    #[error("unknown hook '{0}'")]
    UnknownHook(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
