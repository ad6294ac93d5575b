//! Configuration management for Claude Anywhere

mod relay;
pub mod serde_utils;

pub use relay::{AgentConfig, RelayConfig, DEFAULT_PORT};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("claude-anywhere")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load the relay configuration, falling back to defaults when the file is absent
pub fn load_or_default(path: &Path) -> Result<RelayConfig, ConfigError> {
    let config = match load_config::<RelayConfig>(path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => {
            tracing::debug!("No config at {}, using defaults", path.display());
            RelayConfig::default()
        }
        Err(e) => return Err(e),
    };
    config.validate()?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NetworkDescriptor, NetworkMode};
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = load_or_default(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = RelayConfig {
            mode: NetworkMode::VpnOverlay,
            port: 9100,
            ..Default::default()
        };
        config
            .trusted_networks
            .insert(NetworkDescriptor::new("192.168.50.0/24"));

        save_config(&path, &config).unwrap();
        let loaded: RelayConfig = load_config(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(load_or_default(&path), Err(ConfigError::Parse(_))));
    }
}
