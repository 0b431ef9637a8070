//! Config file discovery and layered loading.
//!
//! 1. Parse `defaults.toml` → base
//! 2. Merge `/etc/plughost/config.toml` (system)
//! 3. Merge `~/.plughost/config.toml` (user)
//! 4. Merge the explicit `--config` file, which must exist
//! 5. Apply `PLUGHOST_*` overrides
//! 6. Deserialize and validate

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::apply_env_overrides;
use crate::error::{ConfigError, ConfigResult};
use crate::merge::overlay;
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Inputs to [`load`]. The default value reads the standard locations.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// System config path; `None` skips the layer.
    pub system: Option<PathBuf>,
    /// Home directory holding `.plughost/config.toml`; `None` uses the
    /// current user's home and skips the layer if there is none.
    pub home: Option<PathBuf>,
    /// Explicit config file.
    pub explicit: Option<PathBuf>,
    /// `PLUGHOST_*` variables to apply.
    pub env: HashMap<String, String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            system: Some(PathBuf::from("/etc/plughost/config.toml")),
            home: None,
            explicit: None,
            env: HashMap::new(),
        }
    }
}

impl LoadOptions {
    /// Options that read nothing but the embedded defaults and `explicit`.
    #[must_use]
    pub fn isolated(explicit: Option<PathBuf>) -> Self {
        Self {
            system: None,
            home: Some(PathBuf::new()),
            explicit,
            env: HashMap::new(),
        }
    }
}

/// A loaded configuration and the files that contributed to it.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The final configuration.
    pub config: Config,
    /// Files merged over the defaults, lowest precedence first.
    pub loaded_files: Vec<String>,
}

/// Load configuration with layered precedence.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, the explicit
/// file is missing, or the final configuration fails validation.
pub fn load(options: &LoadOptions) -> ConfigResult<ResolvedConfig> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;
    let mut loaded_files = Vec::new();

    if let Some(system) = &options.system
        && let Some(layer) = try_load_file(system)?
    {
        let keys = overlay(&mut merged, &layer);
        loaded_files.push(system.display().to_string());
        info!(path = %system.display(), keys, "loaded system config");
    }

    let home = match &options.home {
        Some(home) if home.as_os_str().is_empty() => None,
        Some(home) => Some(home.clone()),
        None => directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()),
    };
    if let Some(home) = home {
        let user_path = home.join(".plughost").join("config.toml");
        if let Some(layer) = try_load_file(&user_path)? {
            let keys = overlay(&mut merged, &layer);
            loaded_files.push(user_path.display().to_string());
            info!(path = %user_path.display(), keys, "loaded user config");
        }
    }

    if let Some(explicit) = &options.explicit {
        let layer = try_load_file(explicit)?.ok_or_else(|| ConfigError::ReadError {
            path: explicit.display().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        let keys = overlay(&mut merged, &layer);
        loaded_files.push(explicit.display().to_string());
        info!(path = %explicit.display(), keys, "loaded config file");
    }

    let env_count = apply_env_overrides(&mut merged, &options.env);
    if env_count > 0 {
        debug!(count = env_count, "applied environment overrides");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;
    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        loaded_files,
    })
}

/// Load a single file over the embedded defaults (no other layers).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read or parsed, or fails
/// validation.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    load(&LoadOptions::isolated(Some(path.to_path_buf()))).map(|r| r.config)
}

/// Try to load a file, returning `None` if it does not exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(ConfigError::ValidationError {
            field: path.display().to_string(),
            message: format!(
                "config file is {} bytes, exceeding the {} byte limit",
                content.len(),
                MAX_CONFIG_FILE_SIZE
            ),
        });
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(Some(value))
}
