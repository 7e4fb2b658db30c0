//! Configuration management for stagehand
//!
//! Settings are layered, lowest priority first:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables
//!
//! # Environment Variables
//!
//! Any value can be overridden with `STAGEHAND__<section>__<key>`, e.g.
//! - `STAGEHAND__NETWORK__RECONNECT_INTERVAL_MS=500`
//! - `STAGEHAND__HARVEST__CHUNK_SIZE=1MB`
//! - `STAGEHAND__REGISTRY__DEVICES_FILE=/etc/stagehand/devices.json`
//!
//! # Configuration File
//!
//! Loaded from `config/stagehand.toml` unless `STAGEHAND_CONFIG` points
//! elsewhere. Device definitions live in a separate JSON file owned by the
//! registry.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{Config, HarvestConfig, LoggingConfig, NetworkConfig, RegistryConfig};
pub use sources::config_path;
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to render configuration: {0}")]
    RenderError(#[from] toml::ser::Error),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// # Errors
    ///
    /// Returns an error if the file is malformed or a value fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path.as_ref())?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_full_config_example() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("stagehand.toml");

        let toml_content = r#"
[network]
connect_timeout_ms = 1500
reconnect_interval_ms = 3000
advertise_interval_ms = 1000
teardown_wait_ms = 750

[harvest]
root = "takes"
chunk_size = "512KB"
request_timeout_ms = 10000
cancel_wait_ms = 2000
match_mode = "exact"

[registry]
devices_file = "devices.json"
save_on_exit = false

[logging]
filter = "stagehand=debug"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = Config::load_from_path(&config_path).unwrap();
        let network = config.network.settings();
        assert_eq!(network.teardown_wait.as_millis(), 750);
        assert_eq!(config.harvest.source_settings().chunk_size, 512 * 1024);
        assert!(!config.registry.save_on_exit);
        assert_eq!(config.logging.filter, "stagehand=debug");
    }

    #[test]
    fn test_validation_runs_on_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("stagehand.toml");
        fs::write(&config_path, "[harvest]\ncancel_wait_ms = 0\n").unwrap();

        assert!(matches!(
            Config::load_from_path(&config_path),
            Err(ConfigError::ValidationError(ValidationError::ZeroDuration { .. }))
        ));
    }

    #[test]
    fn test_to_toml_reloads() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("rendered.toml");
        let rendered = Config::default().to_toml().unwrap();
        fs::write(&config_path, &rendered).unwrap();

        let reloaded = Config::load_from_path(&config_path).unwrap();
        assert_eq!(reloaded.harvest.chunk_size, Config::default().harvest.chunk_size);
        assert!(rendered.contains("[harvest]"));
    }
}
