//! Host lifecycle service
//!
//! Owns the bind state, the token store, the session manager and the running
//! listener, and exposes the hooks a host calls: `start`, `stop` and
//! `mode_changed`. The trusted-network set lives in the configuration and is
//! only read when a bind address is resolved.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use ca_core::config::{self, RelayConfig};
use ca_core::{
    BindDecision, BindError, BindState, NetworkDescriptor, NetworkMode, NetworkProbe,
    NetworkResolver, RelayError, Resolution, ResolveError, SystemProbe, TokenStore,
};

use crate::server::{RelayContext, RelayHandle, RelayServer};
use crate::session::SessionManager;

/// Who asked for the relay to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTrigger {
    /// Host startup or a mode switch; refused on untrusted local networks
    Automatic,
    /// The user asked directly; overrides the trust check
    Explicit,
}

struct Running {
    handle: RelayHandle,
    trigger: StartTrigger,
}

struct ServiceState {
    config: RelayConfig,
    bind: BindState,
    running: Option<Running>,
}

/// The relay as seen by its host application
pub struct RelayService<P: NetworkProbe = SystemProbe> {
    config_path: Option<PathBuf>,
    resolver: NetworkResolver<P>,
    tokens: Arc<TokenStore>,
    sessions: Arc<SessionManager>,
    state: Mutex<ServiceState>,
}

impl RelayService<SystemProbe> {
    /// Service resolving addresses from the real system
    pub fn new(config: RelayConfig, tokens: Arc<TokenStore>) -> Self {
        Self::with_resolver(config, tokens, NetworkResolver::system())
    }
}

impl<P: NetworkProbe> RelayService<P> {
    /// Service with a custom resolver
    pub fn with_resolver(
        config: RelayConfig,
        tokens: Arc<TokenStore>,
        resolver: NetworkResolver<P>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::from_config(&config));
        let bind = BindState::new(config.mode, config.port);
        Self {
            config_path: None,
            resolver,
            tokens,
            sessions,
            state: Mutex::new(ServiceState {
                config,
                bind,
                running: None,
            }),
        }
    }

    /// Persist trusted-network changes to `path`
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Snapshot of the current configuration
    pub async fn config(&self) -> RelayConfig {
        self.state.lock().await.config.clone()
    }

    pub async fn bind_state(&self) -> BindState {
        self.state.lock().await.bind
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running.is_some()
    }

    /// Resolve the bind address for the current state without starting
    pub async fn resolve(&self) -> Result<Resolution, ResolveError> {
        let state = self.state.lock().await;
        self.resolver
            .resolve(&state.bind, &state.config.trusted_networks)
    }

    /// Resolve, apply the trust policy and start listening
    ///
    /// Returns once the socket is bound; connections are served in the
    /// background.
    pub async fn start(&self, trigger: StartTrigger) -> Result<BindDecision, BindError> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state, trigger).await
    }

    /// Stop listening and terminate every session
    ///
    /// Returns whether the relay was running.
    pub async fn stop(&self) -> bool {
        let running = self.state.lock().await.running.take();
        match running {
            Some(running) => {
                running.handle.stop().await;
                true
            }
            None => false,
        }
    }

    /// Switch network mode
    ///
    /// Tears down a running listener, replaces the bind state and restarts
    /// with the trigger the listener was started with. Returns the new
    /// decision when the relay was restarted.
    pub async fn mode_changed(&self, mode: NetworkMode) -> Result<Option<BindDecision>, BindError> {
        let mut state = self.state.lock().await;
        let previous = state.running.take();
        let trigger = match previous {
            Some(running) => {
                running.handle.stop().await;
                Some(running.trigger)
            }
            None => None,
        };

        tracing::info!("Network mode changed: {} -> {}", state.bind.mode, mode);
        state.config.mode = mode;
        state.bind = BindState::new(mode, state.config.port);

        match trigger {
            Some(trigger) => self.start_locked(&mut state, trigger).await.map(Some),
            None => Ok(None),
        }
    }

    /// Apply a reloaded configuration
    ///
    /// The token file is re-read and session limits apply at once. The
    /// trusted set and connection timeouts take effect on the next start;
    /// a different mode or port goes through `mode_changed`.
    pub async fn reload(&self, config: RelayConfig) -> Result<Option<BindDecision>, BindError> {
        match self.tokens.reload() {
            Ok(true) => tracing::info!("Token changed; previous token no longer accepted"),
            Ok(false) => {}
            Err(e) => tracing::warn!("Failed to reload token: {}", e),
        }
        self.sessions.apply_config(&config);

        let (mode, rebind) = {
            let mut state = self.state.lock().await;
            let rebind = config.mode != state.bind.mode || config.port != state.bind.port;
            let mode = config.mode;
            state.config = config;
            (mode, rebind)
        };

        if rebind {
            self.mode_changed(mode).await
        } else {
            tracing::info!("Configuration reloaded");
            Ok(None)
        }
    }

    /// Add the network the host is on to the trusted set
    pub async fn trust_current_network(&self) -> Result<NetworkDescriptor, RelayError> {
        let network = self
            .resolver
            .current_network()
            .ok_or(BindError::Resolve(ResolveError::NoAddressFound(
                NetworkMode::LocalSubnet,
            )))?;

        let mut state = self.state.lock().await;
        if state.config.trusted_networks.insert(network.clone()) {
            tracing::info!("Trusted network {}", network);
            self.persist(&state.config)?;
        }
        Ok(network)
    }

    /// Remove a network from the trusted set
    ///
    /// Returns whether it was present.
    pub async fn untrust_network(&self, network: &NetworkDescriptor) -> Result<bool, RelayError> {
        let mut state = self.state.lock().await;
        let removed = state.config.trusted_networks.remove(network);
        if removed {
            tracing::info!("Untrusted network {}", network);
            self.persist(&state.config)?;
        }
        Ok(removed)
    }

    async fn start_locked(
        &self,
        state: &mut ServiceState,
        trigger: StartTrigger,
    ) -> Result<BindDecision, BindError> {
        if let Some(running) = &state.running {
            return Err(BindError::AlreadyRunning(running.handle.local_addr()));
        }

        let resolution = self
            .resolver
            .resolve(&state.bind, &state.config.trusted_networks)?;

        if !resolution.trusted && trigger == StartTrigger::Automatic {
            let network = resolution
                .network
                .map(|n| n.to_string())
                .unwrap_or_else(|| resolution.decision.address.to_string());
            tracing::warn!("Not starting automatically on untrusted network {}", network);
            return Err(BindError::UntrustedNetwork { network });
        }

        let ctx = RelayContext::new(
            state.bind.mode,
            &state.config,
            Arc::clone(&self.tokens),
            Arc::clone(&self.sessions),
        );
        let handle = RelayServer::start(resolution.decision, ctx).await?;
        let decision = *handle.decision();

        state.bind = state.bind.resolved(decision);
        state.running = Some(Running { handle, trigger });
        Ok(decision)
    }

    fn persist(&self, config: &RelayConfig) -> Result<(), RelayError> {
        if let Some(path) = &self.config_path {
            config::save_config(path, config)?;
            tracing::debug!("Saved config to {}", path.display());
        }
        Ok(())
    }
}
