//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogFormat, LogOutput, LoggingConfig, SwitchyardConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &SwitchyardConfig) -> ConfigResult<()> {
    validate_env(&config.env)?;
    validate_logging_config(&config.logging)?;
    Ok(())
}

fn validate_env(env: &str) -> ConfigResult<()> {
    if env.trim().is_empty() {
        return Err(ConfigError::validation("env must not be empty"));
    }
    if env.chars().any(char::is_whitespace) {
        return Err(ConfigError::validation(format!(
            "env cannot contain whitespace: {env:?}"
        )));
    }
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when logging.output is \"file\"",
        ));
    }

    if logging.format == LogFormat::Json && !cfg!(feature = "json-log") {
        return Err(ConfigError::validation(
            "logging.format \"json\" requires the json-log feature",
        ));
    }

    for target in logging.filters.keys() {
        if target.is_empty() || target.contains(['=', ',', ' ']) {
            return Err(ConfigError::validation(format!(
                "Invalid logging filter target: {target:?}"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&SwitchyardConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_empty_env() {
        let config = SwitchyardConfig {
            env: "  ".into(),
            ..Default::default()
        };
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_validate_file_output_requires_path() {
        let mut config = SwitchyardConfig::default();
        config.logging.output = LogOutput::File;
        assert!(validate_config(&config).is_err());

        config.logging.file_path = Some(PathBuf::from("switchyard.log"));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_filter_targets() {
        let mut config = SwitchyardConfig::default();
        config
            .logging
            .filters
            .insert("switchyard_core".into(), LogLevel::Trace);
        assert!(validate_config(&config).is_ok());

        config
            .logging
            .filters
            .insert("bad=target".into(), LogLevel::Debug);
        assert!(validate_config(&config).is_err());
    }
}
