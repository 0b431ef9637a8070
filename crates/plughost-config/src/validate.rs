//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Validate a merged configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_runtime(config)?;
    validate_sandbox(config)?;
    validate_dispatcher(config)?;
    validate_devices(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_runtime(config: &Config) -> ConfigResult<()> {
    if config.runtime.event_stream.trim().is_empty() {
        return Err(invalid("runtime.event_stream", "must not be empty"));
    }
    if config
        .runtime
        .event_stream
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
    {
        return Err(invalid(
            "runtime.event_stream",
            "may only contain ASCII letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

fn validate_sandbox(config: &Config) -> ConfigResult<()> {
    let s = &config.sandbox;
    for (field, value) in [
        ("sandbox.load_timeout_ms", s.load_timeout_ms),
        ("sandbox.unload_timeout_ms", s.unload_timeout_ms),
        ("sandbox.drain_timeout_ms", s.drain_timeout_ms),
        ("sandbox.sample_interval_ms", s.sample_interval_ms),
        ("sandbox.restart_stable_ms", s.restart_stable_ms),
    ] {
        if value == 0 {
            return Err(invalid(field, "must be greater than zero"));
        }
    }
    if s.allowed_extensions.is_empty() {
        return Err(invalid(
            "sandbox.allowed_extensions",
            "at least one extension must be allowed",
        ));
    }
    if let Some(bad) = s
        .allowed_extensions
        .iter()
        .find(|e| e.is_empty() || e.starts_with('.') || e.contains('/'))
    {
        return Err(invalid(
            "sandbox.allowed_extensions",
            format!("'{bad}' is not a bare extension"),
        ));
    }
    if s.max_heap_mb_ceiling == 0 {
        return Err(invalid("sandbox.max_heap_mb_ceiling", "must be greater than zero"));
    }
    if s.restart_backoff_initial_ms > s.restart_backoff_max_ms {
        return Err(invalid(
            "sandbox.restart_backoff_initial_ms",
            "must not exceed sandbox.restart_backoff_max_ms",
        ));
    }
    Ok(())
}

fn validate_dispatcher(config: &Config) -> ConfigResult<()> {
    let d = &config.dispatcher;
    if d.max_attempts == 0 {
        return Err(invalid("dispatcher.max_attempts", "must be at least 1"));
    }
    if d.backoff_initial_ms > d.backoff_max_ms {
        return Err(invalid(
            "dispatcher.backoff_initial_ms",
            "must not exceed dispatcher.backoff_max_ms",
        ));
    }
    if !(0.0..=1.0).contains(&d.backoff_jitter) {
        return Err(invalid(
            "dispatcher.backoff_jitter",
            format!("{} is out of range; must be between 0.0 and 1.0", d.backoff_jitter),
        ));
    }
    if d.job_timeout_ms == 0 {
        return Err(invalid("dispatcher.job_timeout_ms", "must be greater than zero"));
    }
    Ok(())
}

fn validate_devices(config: &Config) -> ConfigResult<()> {
    let d = &config.devices;
    if d.poll_interval_ms == 0 {
        return Err(invalid("devices.poll_interval_ms", "must be greater than zero"));
    }
    if d.dedup_window_ms >= d.poll_interval_ms.saturating_mul(10) {
        return Err(invalid(
            "devices.dedup_window_ms",
            "must be shorter than ten poll intervals",
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let l = &config.logging;
    if !matches!(
        l.level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        return Err(invalid(
            "logging.level",
            format!(
                "unsupported level '{}'; expected one of: trace, debug, info, warn, error",
                l.level
            ),
        ));
    }
    if !matches!(l.format.as_str(), "pretty" | "compact" | "json" | "full") {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported format '{}'; expected one of: pretty, compact, json, full",
                l.format
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = Config::default();
        config.dispatcher.max_attempts = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("dispatcher.max_attempts"));
    }

    #[test]
    fn zero_stable_window_rejected() {
        let mut config = Config::default();
        config.sandbox.restart_stable_ms = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("sandbox.restart_stable_ms"));
    }

    #[test]
    fn dotted_extension_rejected() {
        let mut config = Config::default();
        config.sandbox.allowed_extensions = vec![".sh".into()];
        assert!(validate(&config).is_err());
    }

    #[test]
    fn unknown_log_format_rejected() {
        let mut config = Config::default();
        config.logging.format = "xml".into();
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("logging.format"));
    }

    #[test]
    fn jitter_out_of_range_rejected() {
        let mut config = Config::default();
        config.dispatcher.backoff_jitter = 1.5;
        assert!(validate(&config).is_err());
    }
}
