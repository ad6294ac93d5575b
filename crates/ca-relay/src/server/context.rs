//! Shared, read-only state handed to every connection

use std::sync::Arc;
use std::time::Duration;

use ca_core::config::{AgentConfig, RelayConfig};
use ca_core::{NetworkMode, TokenStore};

use crate::session::SessionManager;

/// How long a VPN-overlay client has to send an optional init message
const INIT_WINDOW: Duration = Duration::from_millis(500);

/// Shortest heartbeat interval a connection will run with
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Per-connection timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for the init message in local-subnet mode
    pub auth: Duration,
    /// Window for an optional init message in vpn-overlay mode
    pub init_window: Duration,
    /// Interval between server pings
    pub heartbeat_interval: Duration,
    /// Silence after which the connection is dropped
    pub heartbeat_timeout: Duration,
}

impl Timeouts {
    /// Timeouts for `config`, clamped to usable values
    ///
    /// Unvalidated configs are accepted here: the heartbeat interval is
    /// raised to a minimum and the timeout to at least one interval.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            auth: config.auth_timeout,
            init_window: INIT_WINDOW,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
        }
        .clamped()
    }

    /// Interval between pings, never zero
    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL)
    }

    fn clamped(mut self) -> Self {
        let interval = self.heartbeat_period();
        if self.heartbeat_interval != interval || self.heartbeat_timeout < interval {
            tracing::warn!(
                "Heartbeat interval {:?} / timeout {:?} unusable, using {:?} / {:?}",
                self.heartbeat_interval,
                self.heartbeat_timeout,
                interval,
                self.heartbeat_timeout.max(interval)
            );
        }
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = self.heartbeat_timeout.max(interval);
        self
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

/// Everything a connection handler needs
#[derive(Clone)]
pub struct RelayContext {
    /// Mode the listener was bound for; decides whether tokens are checked
    pub mode: NetworkMode,
    pub tokens: Arc<TokenStore>,
    pub sessions: Arc<SessionManager>,
    pub agent: Arc<AgentConfig>,
    pub timeouts: Timeouts,
}

impl RelayContext {
    /// Build a context from the relay configuration
    pub fn new(
        mode: NetworkMode,
        config: &RelayConfig,
        tokens: Arc<TokenStore>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            mode,
            tokens,
            sessions,
            agent: Arc::new(config.agent.clone()),
            timeouts: Timeouts::from_config(config),
        }
    }
}

impl std::fmt::Debug for RelayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("mode", &self.mode)
            .field("sessions", &self.sessions.len())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_from_default_config() {
        let config = RelayConfig::default();
        let timeouts = Timeouts::from_config(&config);
        assert_eq!(timeouts.heartbeat_interval, config.heartbeat_interval);
        assert_eq!(timeouts.heartbeat_timeout, config.heartbeat_timeout);
        assert_eq!(timeouts.init_window, INIT_WINDOW);
    }

    #[test]
    fn test_zero_heartbeat_is_clamped() {
        let config = RelayConfig {
            heartbeat_interval: Duration::ZERO,
            heartbeat_timeout: Duration::ZERO,
            ..Default::default()
        };
        let timeouts = Timeouts::from_config(&config);
        assert_eq!(timeouts.heartbeat_interval, MIN_HEARTBEAT_INTERVAL);
        assert_eq!(timeouts.heartbeat_timeout, MIN_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_heartbeat_period_never_zero() {
        let timeouts = Timeouts {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(timeouts.heartbeat_period(), MIN_HEARTBEAT_INTERVAL);
    }
}
