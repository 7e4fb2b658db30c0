use super::models::Config;
use config::{ConfigError, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};

const CONFIG_ENV_VAR: &str = "STAGEHAND_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/stagehand.toml";
const ENV_PREFIX: &str = "STAGEHAND";
const ENV_SEPARATOR: &str = "__";

/// Config file path: `STAGEHAND_CONFIG`, else the default location.
pub fn config_path() -> PathBuf {
    env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration from multiple sources with priority:
/// 1. Defaults (embedded in structs)
/// 2. TOML file (if exists)
/// 3. Environment variables from .env file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    // A missing .env is normal
    let _ = dotenvy::dotenv();
    load_from_sources(&config_path())
}

/// Load configuration from a specific path and the environment
pub fn load_from_sources(config_path: &Path) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(
            File::from(config_path)
                .format(FileFormat::Toml)
                .required(false),
        );
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    // STAGEHAND__HARVEST__CHUNK_SIZE -> harvest.chunk_size
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::MatchMode;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_defaults_only() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(&config_path).unwrap();
        assert_eq!(config.network.connect_timeout_ms, 2000);
        assert_eq!(config.harvest.chunk_size.as_u64(), 256 * 1024);
        assert_eq!(config.registry.devices_file, PathBuf::from("config/devices.json"));
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[network]
reconnect_interval_ms = 500

[harvest]
root = "/srv/takes"
chunk_size = "1MB"
match_mode = "contains"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(&config_path).unwrap();
        assert_eq!(config.network.reconnect_interval_ms, 500);
        assert_eq!(config.network.teardown_wait_ms, 1000);
        assert_eq!(config.harvest.root, PathBuf::from("/srv/takes"));
        assert_eq!(config.harvest.chunk_size.as_u64(), 1024 * 1024);
        assert_eq!(config.harvest.match_mode, MatchMode::Contains);
    }
}
