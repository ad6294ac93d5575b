//! Run the relay in the foreground

use std::path::Path;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use ca_core::config::RelayConfig;
use ca_core::{BindError, NetworkMode};

use crate::output::{format_connection_info, print_error, print_info, print_success, print_warning};
use crate::service::{RelayService, StartTrigger};

/// Command-line overrides for one run
#[derive(Debug, Clone, Copy, Default)]
pub struct ServeOptions {
    pub mode: Option<NetworkMode>,
    pub port: Option<u16>,
    /// Start even on an untrusted local network
    pub force: bool,
}

impl ServeOptions {
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }

    fn trigger(&self) -> StartTrigger {
        if self.force {
            StartTrigger::Explicit
        } else {
            StartTrigger::Automatic
        }
    }
}

/// Start the relay and serve until SIGINT or SIGTERM
///
/// SIGHUP reloads the configuration file; a changed mode or port rebinds.
pub async fn serve_command(config_path: &Path, options: ServeOptions) -> Result<()> {
    let mut config = super::load(config_path)?;
    options.apply(&mut config);

    tracing::info!("Claude Anywhere relay starting ({} mode)...", config.mode);

    let tokens = super::open_tokens(&config, config_path)?;
    let service = RelayService::new(config, tokens).with_config_path(config_path);

    let decision = match service.start(options.trigger()).await {
        Ok(decision) => decision,
        Err(e) => {
            print_error(&e.to_string());
            if matches!(e, BindError::UntrustedNetwork { .. }) {
                print_info("Run 'ca-relay trust add' to trust this network, or 'ca-relay serve --force' to start once");
            }
            return Err(e.into());
        }
    };

    print_success(&format!("Relay listening on {}", decision));
    println!("{}", connection_info(&service, &decision));

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("Failed to install SIGHUP handler")?;

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(()) = reload => reload_config(&service, config_path, options).await,
        }
    }

    print_info("Stopping relay...");
    service.stop().await;
    tracing::info!("Relay shutdown complete");
    Ok(())
}

fn connection_info(service: &RelayService, decision: &ca_core::BindDecision) -> String {
    use crossterm::tty::IsTty;

    if shows_token(decision.mode, std::io::stdout().is_tty()) {
        let token = service.tokens().token();
        format_connection_info(decision, Some(token.as_str()))
    } else {
        format_connection_info(decision, None)
    }
}

/// The token is printed only for a person at a terminal, never into logs
fn shows_token(mode: NetworkMode, interactive: bool) -> bool {
    mode.requires_token() && interactive
}

async fn reload_config(service: &RelayService, config_path: &Path, options: ServeOptions) {
    tracing::info!("Received SIGHUP, reloading {:?}", config_path);

    let mut config = match super::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            print_warning(&format!("Keeping current configuration: {:#}", e));
            return;
        }
    };
    options.apply(&mut config);

    match service.reload(config).await {
        Ok(Some(decision)) => {
            print_success(&format!("Relay now listening on {}", decision));
            println!("{}", connection_info(service, &decision));
        }
        Ok(None) => {
            if service.is_running().await {
                print_info("Configuration reloaded");
                return;
            }
            // A previous reload left the relay stopped
            match service.start(options.trigger()).await {
                Ok(decision) => {
                    print_success(&format!("Relay listening on {}", decision));
                    println!("{}", connection_info(service, &decision));
                }
                Err(e) => print_error(&format!("Relay still stopped: {}", e)),
            }
        }
        Err(e) => {
            print_error(&format!("Relay stopped: {}", e));
            print_info("Fix the configuration and send SIGHUP to retry");
        }
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        shutdown.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_shown_only_on_terminal_in_local_mode() {
        assert!(shows_token(NetworkMode::LocalSubnet, true));
        assert!(!shows_token(NetworkMode::LocalSubnet, false));
        assert!(!shows_token(NetworkMode::VpnOverlay, true));
        assert!(!shows_token(NetworkMode::VpnOverlay, false));
    }
}
