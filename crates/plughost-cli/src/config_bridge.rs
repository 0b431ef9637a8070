//! Conversion from configuration sections to runtime types.

use plughost_config::Config;
use plughost_telemetry::{LogConfig, LogFormat, LogTarget};

/// Logging setup for `config`. `verbose` forces debug output for the
/// plughost crates.
pub(crate) fn to_log_config(config: &Config, verbose: bool) -> LogConfig {
    let logging = &config.logging;
    let format = logging.format.parse().unwrap_or(LogFormat::Compact);
    let mut log = LogConfig::new(logging.level.clone()).with_format(format);
    if let Some(directory) = &logging.directory {
        log = log.with_file_logging(directory.clone());
    } else {
        log.target = LogTarget::Stderr;
    }
    for directive in &logging.directives {
        log = log.with_directive(directive.clone());
    }
    if verbose {
        log = log
            .with_directive("plughost_runtime=debug")
            .with_directive("plughost_devices=debug");
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_adds_debug_directives() {
        let config = Config::default();
        let log = to_log_config(&config, true);
        assert_eq!(log.level, "info");
        assert!(log.directives.iter().any(|d| d == "plughost_runtime=debug"));
        assert_eq!(log.target, LogTarget::Stderr);
    }

    #[test]
    fn directory_switches_to_file_target() {
        let mut config = Config::default();
        config.logging.directory = Some("/var/log/plughost".into());
        config.logging.format = "json".into();
        let log = to_log_config(&config, false);
        assert_eq!(log.format, LogFormat::Json);
        assert_eq!(log.target, LogTarget::File("/var/log/plughost".into()));
    }
}
