//! Core error types for Claude Anywhere
//!
//! Each failure class is terminal for exactly one scope: a `BindError`
//! stops the listener from starting, an `AuthError` closes one connection,
//! a `SpawnError` ends one session attempt and a `StreamError` tears down
//! one live session.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::NetworkMode;

/// Top-level error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    /// The listener could not be started
    #[error("Bind failure: {0}")]
    Bind(#[from] BindError),

    /// A connection failed authentication
    #[error("Authentication failure: {0}")]
    Auth(#[from] AuthError),

    /// A session could not be spawned
    #[error("Spawn failure: {0}")]
    Spawn(#[from] SpawnError),

    /// A live session lost one of its streams
    #[error("Stream failure: {0}")]
    Stream(#[from] StreamError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No interface address usable for the requested mode
    #[error("No usable address found for {0} mode")]
    NoAddressFound(NetworkMode),
}

/// Reasons the relay refuses to start listening
#[derive(Error, Debug)]
pub enum BindError {
    /// Resolver found nothing to bind to
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Automatic start on a network the user has not trusted
    #[error("Network {network} is not trusted; start the relay explicitly or trust this network")]
    UntrustedNetwork { network: String },

    /// The listening socket could not be opened
    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The relay is already listening
    #[error("Relay is already running on {0}")]
    AlreadyRunning(SocketAddr),
}

/// Authentication failures (never carry the presented credential)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Init message arrived without a token
    #[error("Missing token")]
    MissingToken,

    /// Token did not match
    #[error("Invalid token")]
    InvalidToken,

    /// No init message within the auth timeout
    #[error("Timed out waiting for init message")]
    Timeout,

    /// First frame was not a valid init message
    #[error("Malformed init message: {0}")]
    Malformed(String),

    /// Socket closed before authenticating
    #[error("Connection closed before authentication")]
    Disconnected,
}

/// Session creation failures
#[derive(Error, Debug)]
pub enum SpawnError {
    /// Pseudo-terminal allocation failed
    #[error("PTY allocation failed: {0}")]
    PtyAllocation(String),

    /// The agent command could not be started
    #[error("Failed to spawn {program}: {reason}")]
    Command { program: String, reason: String },

    /// Could not obtain the PTY reader or writer
    #[error("PTY I/O setup failed: {0}")]
    Io(String),

    /// Session limit exceeded
    #[error("Session limit of {0} reached")]
    LimitExceeded(u32),
}

/// Mid-session I/O failures
#[derive(Error, Debug)]
pub enum StreamError {
    /// WebSocket read or write failed
    #[error("Socket error: {0}")]
    Socket(String),

    /// PTY read or write failed
    #[error("PTY error: {0}")]
    Pty(#[from] std::io::Error),

    /// Peer went silent past the heartbeat timeout
    #[error("No traffic for {0:?}")]
    HeartbeatTimeout(std::time::Duration),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
