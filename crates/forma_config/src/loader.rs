//! Configuration file loading and validation.

use crate::error::ConfigError;
use crate::types::FormaConfig;
use std::path::Path;

/// Name of the configuration file looked up in the project root.
pub const CONFIG_FILE: &str = "forma.toml";

/// Loads and validates `forma.toml` from a project directory.
pub fn load_config(project_dir: &Path) -> Result<FormaConfig, ConfigError> {
    let config_path = project_dir.join(CONFIG_FILE);
    let content = std::fs::read_to_string(&config_path)?;
    load_config_from_str(&content)
}

/// Loads `forma.toml` if present, otherwise returns the defaults.
///
/// A file that exists but does not parse or validate is still an error.
pub fn load_config_or_default(project_dir: &Path) -> Result<FormaConfig, ConfigError> {
    match load_config(project_dir) {
        Err(ConfigError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(FormaConfig::default())
        }
        other => other,
    }
}

/// Parses and validates a configuration from a string.
///
/// Useful for testing without filesystem dependencies.
pub fn load_config_from_str(content: &str) -> Result<FormaConfig, ConfigError> {
    let config: FormaConfig =
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &FormaConfig) -> Result<(), ConfigError> {
    if config.cache.max_size == 0 {
        return Err(invalid("cache.max_size", "must be at least 1"));
    }
    if config.cache.default_ttl_ms == Some(0) {
        return Err(invalid("cache.default_ttl_ms", "must be positive when set"));
    }
    if config.cache.disk.enabled && config.cache.disk.dir.as_os_str().is_empty() {
        return Err(invalid("cache.disk.dir", "must not be empty when disk is enabled"));
    }
    if config.watch.poll_interval_ms == 0 {
        return Err(invalid("watch.poll_interval_ms", "must be positive"));
    }
    if config.watch.channel_capacity == 0 {
        return Err(invalid("watch.channel_capacity", "must be at least 1"));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
