//! Network mode and trusted-network commands

use std::path::Path;

use anyhow::{Context, Result};

use ca_core::config::save_config;
use ca_core::{NetworkDescriptor, NetworkMode, NetworkResolver};

use crate::output::{print_info, print_success, print_warning};

/// Trust the network this machine is on
pub async fn trust_add(config_path: &Path) -> Result<()> {
    let service = super::open_service(config_path)?;
    let network = service.trust_current_network().await?;
    print_success(&format!("Trusted network {}", network));
    Ok(())
}

/// Stop trusting a network
pub async fn trust_remove(config_path: &Path, network: &str) -> Result<()> {
    let service = super::open_service(config_path)?;
    let network = NetworkDescriptor::new(network);
    if service.untrust_network(&network).await? {
        print_success(&format!("Removed {} from trusted networks", network));
    } else {
        print_warning(&format!("{} was not trusted", network));
    }
    Ok(())
}

/// List trusted networks, marking the current one
pub fn trust_list(config_path: &Path) -> Result<()> {
    let config = super::load(config_path)?;
    let current = NetworkResolver::system().current_network();

    if config.trusted_networks.is_empty() {
        print_info("No trusted networks");
    }
    for network in config.trusted_networks.iter() {
        if Some(network) == current.as_ref() {
            println!("{} (current)", network);
        } else {
            println!("{}", network);
        }
    }

    if let Some(current) = current {
        if !config.trusted_networks.contains(&current) {
            print_info(&format!("Current network {} is not trusted", current));
        }
    }
    Ok(())
}

/// Persist a new network mode
pub fn mode_command(config_path: &Path, mode: NetworkMode) -> Result<()> {
    let mut config = super::load(config_path)?;
    if config.mode == mode {
        print_info(&format!("Mode is already {}", mode));
        return Ok(());
    }

    config.mode = mode;
    save_config(config_path, &config)
        .with_context(|| format!("Failed to save config to {:?}", config_path))?;
    print_success(&format!("Mode set to {}", mode));
    print_info("Send SIGHUP to a running relay to apply the change");
    Ok(())
}

/// Show where the relay would listen, without starting it
pub async fn resolve_command(config_path: &Path) -> Result<()> {
    let service = super::open_service(config_path)?;
    let resolution = service.resolve().await?;

    print_success(&format!("Would listen on {}", resolution.decision));
    if let Some(network) = &resolution.network {
        print_info(&format!("Network: {}", network));
    }
    if resolution.trusted {
        print_info("Automatic start allowed");
    } else {
        print_warning("Network is not trusted; start with --force or run 'ca-relay trust add'");
    }
    Ok(())
}
