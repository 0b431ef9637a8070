//! Logging configuration and setup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::error::{TelemetryError, TelemetryResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human-friendly.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// Structured JSON, one object per line.
    Json,
    /// Default `tracing-subscriber` format with all fields.
    Full,
}

impl std::str::FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            "full" => Ok(Self::Full),
            other => Err(TelemetryError::BadSetting {
                value: other.to_string(),
                reason: "expected pretty, compact, json or full".to_string(),
            }),
        }
    }
}

/// Where log lines go.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    /// Standard output.
    Stdout,
    /// Standard error. Stdout stays free for guest protocol traffic.
    #[default]
    Stderr,
    /// Daily-rotated files in the given directory.
    File(PathBuf),
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base level filter (e.g. `info`).
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Output target.
    #[serde(default)]
    pub target: LogTarget,
    /// File name prefix for the file target.
    #[serde(default = "default_prefix")]
    pub file_prefix: String,
    /// Emit ANSI colors (ignored for JSON and files).
    #[serde(default = "default_true")]
    pub ansi: bool,
    /// Extra directives, e.g. `plughost_runtime=debug`.
    #[serde(default)]
    pub directives: Vec<String>,
}

fn default_prefix() -> String {
    "plughost.log".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info")
    }
}

impl LogConfig {
    /// Config with the given base level and defaults elsewhere.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::default(),
            target: LogTarget::default(),
            file_prefix: default_prefix(),
            ansi: true,
            directives: Vec::new(),
        }
    }

    /// Set the format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Log to daily-rotated files in `directory`.
    #[must_use]
    pub fn with_file_logging(mut self, directory: impl Into<PathBuf>) -> Self {
        self.target = LogTarget::File(directory.into());
        self.ansi = false;
        self
    }

    /// Add a directive.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Build the filter. `RUST_LOG`, when set, takes precedence over
    /// `level`; `directives` always apply on top.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::BadSetting`] for an unparsable level or
    /// directive.
    pub fn build_filter(&self) -> TelemetryResult<EnvFilter> {
        let base = std::env::var(EnvFilter::DEFAULT_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.level.clone());
        let mut filter = EnvFilter::try_new(&base).map_err(|e| TelemetryError::BadSetting {
            value: base.clone(),
            reason: e.to_string(),
        })?;
        for directive in &self.directives {
            let directive = directive
                .parse()
                .map_err(|e: tracing_subscriber::filter::ParseError| {
                    TelemetryError::BadSetting {
                        value: directive.clone(),
                        reason: e.to_string(),
                    }
                })?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

fn format_layer<W>(format: LogFormat, ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
        LogFormat::Full => fmt::layer()
            .with_ansi(ansi)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed(),
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the log directory cannot
/// be created, or a global subscriber is already installed.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.build_filter()?;
    let layer = match &config.target {
        LogTarget::Stdout => format_layer(config.format, config.ansi, std::io::stdout),
        LogTarget::Stderr => format_layer(config.format, config.ansi, std::io::stderr),
        LogTarget::File(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| TelemetryError::LogDir {
                dir: dir.clone(),
                source,
            })?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, &config.file_prefix);
            format_layer(config.format, false, appender)
        },
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn directives_extend_filter() {
        let config = LogConfig::new("warn").with_directive("plughost_runtime=debug");
        assert!(config.build_filter().is_ok());
    }

    #[test]
    fn bad_directive_is_reported() {
        let config = LogConfig::new("info").with_directive("plughost_runtime=loud");
        let err = config.build_filter().unwrap_err();
        assert!(err.to_string().contains("plughost_runtime=loud"));
    }

    #[test]
    fn file_logging_disables_ansi() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::default().with_file_logging(dir.path());
        assert!(!config.ansi);
        assert_eq!(config.target, LogTarget::File(dir.path().to_path_buf()));
    }
}
