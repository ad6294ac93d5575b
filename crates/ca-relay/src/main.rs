//! Claude Anywhere relay
//!
//! Runs the relay and manages its token, trusted networks and mode.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ca_core::{config, NetworkMode};
use ca_relay::commands::{self, ServeOptions};

#[derive(Parser)]
#[command(name = "ca-relay")]
#[command(author, version, about = "Relay an AI coding agent's terminal to your other devices")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "CLAUDE_ANYWHERE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Run in foreground with verbose output
    #[arg(short, long, global = true)]
    foreground: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay (default)
    /// Alias: start
    #[command(alias = "start")]
    Serve {
        /// Network mode (local-subnet or vpn-overlay)
        #[arg(short, long)]
        mode: Option<NetworkMode>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Start even if the local network is not trusted
        #[arg(long)]
        force: bool,
    },

    /// Show or rotate the connection token
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Manage trusted local networks
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },

    /// Set the network mode (local-subnet or vpn-overlay)
    Mode {
        mode: NetworkMode,
    },

    /// Show the address the relay would listen on
    Resolve,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Print the current token
    Show,
    /// Generate a new token
    Rotate,
}

#[derive(Subcommand)]
enum TrustAction {
    /// Trust the network this machine is on
    Add,
    /// Stop trusting a network
    Remove {
        /// Network descriptor, e.g. 192.168.1.0/24
        network: String,
    },
    /// List trusted networks
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.foreground { "debug" } else { &cli.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    let command = cli.command.unwrap_or(Commands::Serve {
        mode: None,
        port: None,
        force: false,
    });

    match command {
        Commands::Serve { mode, port, force } => {
            commands::serve_command(&config_path, ServeOptions { mode, port, force }).await?;
        }

        Commands::Token { action } => match action {
            TokenAction::Show => commands::token_show(&config_path)?,
            TokenAction::Rotate => commands::token_rotate(&config_path)?,
        },

        Commands::Trust { action } => match action {
            TrustAction::Add => commands::trust_add(&config_path).await?,
            TrustAction::Remove { network } => commands::trust_remove(&config_path, &network).await?,
            TrustAction::List => commands::trust_list(&config_path)?,
        },

        Commands::Mode { mode } => commands::mode_command(&config_path, mode)?,

        Commands::Resolve => commands::resolve_command(&config_path).await?,

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(&config_path)?,
            ConfigAction::Path => commands::config_path(&config_path)?,
        },
    }

    Ok(())
}
