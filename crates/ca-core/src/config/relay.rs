//! Relay configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::types::{NetworkMode, TrustedNetworks};

/// Default listening port
pub const DEFAULT_PORT: u16 = 8765;

/// Configuration for the relay service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Network the relay binds to
    pub mode: NetworkMode,

    /// TCP port to listen on
    pub port: u16,

    /// Local networks approved for automatic startup
    pub trusted_networks: TrustedNetworks,

    /// Token file location (defaults to `token` next to the config file)
    pub token_path: Option<PathBuf>,

    /// Time a session gets to exit after SIGTERM before it is killed
    #[serde(with = "duration_secs")]
    pub termination_grace: Duration,

    /// Time a local-subnet client has to send its init message
    #[serde(with = "duration_secs")]
    pub auth_timeout: Duration,

    /// Interval between server pings
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// Silence after which a connection is considered dead
    #[serde(with = "duration_secs")]
    pub heartbeat_timeout: Duration,

    /// Maximum number of concurrent sessions
    pub max_sessions: Option<u32>,

    /// Agent process settings
    pub agent: AgentConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::default(),
            port: DEFAULT_PORT,
            trusted_networks: TrustedNetworks::default(),
            token_path: None,
            termination_grace: Duration::from_secs(2),
            auth_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_sessions: None,
            agent: AgentConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        if self.termination_grace.is_zero() {
            return Err(ConfigError::Invalid(
                "termination_grace must be greater than zero".into(),
            ));
        }
        if self.auth_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "auth_timeout must be greater than zero".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_interval must be greater than zero".into(),
            ));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        if self.max_sessions == Some(0) {
            return Err(ConfigError::Invalid("max_sessions must be positive".into()));
        }
        Ok(())
    }
}

/// How the agent CLI is launched for each session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Program to run; searched in well-known locations when unset
    pub program: Option<String>,

    /// Extra arguments
    pub args: Vec<String>,

    /// Environment variables added to every session
    pub env: Vec<(String, String)>,

    /// Working directory when the client requests none (home when unset)
    pub default_cwd: Option<PathBuf>,

    /// Roots a relative working directory is looked up under, in order
    pub search_roots: Vec<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_default();
        Self {
            program: None,
            args: vec![],
            env: vec![],
            default_cwd: None,
            search_roots: vec![home.join("Github"), home],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetworkDescriptor;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.mode, NetworkMode::LocalSubnet);
        assert_eq!(config.port, 8765);
        assert_eq!(config.termination_grace, Duration::from_secs(2));
        assert_eq!(config.auth_timeout, Duration::from_secs(5));
        assert!(config.trusted_networks.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            mode = "vpn_overlay"
            port = 9000
            trusted_networks = ["192.168.1.0/24", "10.0.0.0/24"]

            [agent]
            program = "/usr/local/bin/claude"
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, NetworkMode::VpnOverlay);
        assert_eq!(config.port, 9000);
        assert_eq!(config.trusted_networks.len(), 2);
        assert!(config
            .trusted_networks
            .contains(&NetworkDescriptor::new("10.0.0.0/24")));
        assert_eq!(config.agent.program.as_deref(), Some("/usr/local/bin/claude"));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_validate_rejects_bad_heartbeat() {
        let config = RelayConfig {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_sessions() {
        let config = RelayConfig {
            max_sessions: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
