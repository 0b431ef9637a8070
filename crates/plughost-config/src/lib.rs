#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
//! Layered configuration for the plughost runtime.
//!
//! # Configuration Precedence
//!
//! From highest to lowest priority:
//!
//! 1. **Environment variables** (`PLUGHOST_*`)
//! 2. **Explicit file** (`--config <path>`)
//! 3. **User** (`~/.plughost/config.toml`)
//! 4. **System** (`/etc/plughost/config.toml`)
//! 5. **Embedded defaults** (`defaults.toml` compiled into the binary)
//!
//! This crate has no dependencies on other plughost crates. Sections are
//! converted into runtime types at the integration boundary.

/// Environment variable overrides.
pub mod env;
/// Configuration error types.
pub mod error;
/// Configuration file discovery and loading.
pub mod loader;
/// Layering of TOML documents.
pub mod merge;
/// Configuration struct definitions.
pub mod types;
/// Configuration validation rules.
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use loader::{LoadOptions, ResolvedConfig};
pub use types::*;

impl Config {
    /// Load configuration with the full precedence chain, reading
    /// `PLUGHOST_*` variables from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if any config file is malformed or the final
    /// configuration fails validation.
    pub fn load(explicit: Option<&std::path::Path>) -> ConfigResult<ResolvedConfig> {
        let options = LoadOptions {
            explicit: explicit.map(std::path::Path::to_path_buf),
            env: env::collect_env_vars(),
            ..LoadOptions::default()
        };
        loader::load(&options)
    }

    /// Render the configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SerializeError`] if serialization fails.
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }
}
