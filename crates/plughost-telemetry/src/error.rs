//! Logging setup failures.

use std::path::PathBuf;

use thiserror::Error;

/// Why logging could not be installed.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A level, directive or format name did not parse.
    #[error("bad log setting '{value}': {reason}")]
    BadSetting {
        /// Text as configured.
        value: String,
        /// Parser message.
        reason: String,
    },

    /// Another global subscriber got there first.
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(String),

    /// The file target's directory could not be created.
    #[error("cannot create log directory {}: {source}", dir.display())]
    LogDir {
        /// Directory from the file target.
        dir: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

/// Telemetry result alias.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
