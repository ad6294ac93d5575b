//! CLI command implementations

mod config;
mod network;
mod serve;
mod token;

pub use config::{config_path, config_show};
pub use network::{mode_command, resolve_command, trust_add, trust_list, trust_remove};
pub use serve::{serve_command, ServeOptions};
pub use token::{token_rotate, token_show};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use ca_core::config::{self as core_config, RelayConfig};
use ca_core::TokenStore;

use crate::service::RelayService;

/// Token file for a configuration loaded from `config_path`
///
/// An explicit `token_path` wins; otherwise the token sits next to the
/// config file.
pub fn token_path(config: &RelayConfig, config_path: &Path) -> PathBuf {
    if let Some(path) = &config.token_path {
        return path.clone();
    }
    config_path
        .parent()
        .map(|dir| dir.join("token"))
        .unwrap_or_else(ca_core::token::default_token_path)
}

fn load(config_path: &Path) -> Result<RelayConfig> {
    core_config::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))
}

fn open_tokens(config: &RelayConfig, config_path: &Path) -> Result<Arc<TokenStore>> {
    let path = token_path(config, config_path);
    let store = TokenStore::from_env_or_open(&path)
        .with_context(|| format!("Failed to open token file {:?}", path))?;
    Ok(Arc::new(store))
}

/// Service over the configuration at `config_path`, persisting changes back to it
fn open_service(config_path: &Path) -> Result<RelayService> {
    let config = load(config_path)?;
    let tokens = open_tokens(&config, config_path)?;
    Ok(RelayService::new(config, tokens).with_config_path(config_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_path_next_to_config() {
        let config = RelayConfig::default();
        let path = token_path(&config, Path::new("/etc/claude-anywhere/config.toml"));
        assert_eq!(path, PathBuf::from("/etc/claude-anywhere/token"));
    }

    #[test]
    fn test_token_path_override() {
        let config = RelayConfig {
            token_path: Some(PathBuf::from("/run/secrets/relay-token")),
            ..Default::default()
        };
        let path = token_path(&config, Path::new("/etc/claude-anywhere/config.toml"));
        assert_eq!(path, PathBuf::from("/run/secrets/relay-token"));
    }
}
