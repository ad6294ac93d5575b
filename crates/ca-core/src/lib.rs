//! ca-core: Shared types, configuration and host-facing services for Claude Anywhere
//!
//! This crate provides the error taxonomy, persisted configuration, the
//! Token Store and the Network Resolver used by the relay.

pub mod config;
pub mod error;
pub mod network;
pub mod tailscale;
pub mod token;
pub mod types;

pub use error::{AuthError, BindError, ConfigError, RelayError, ResolveError, SpawnError, StreamError};
pub use network::{BindState, NetworkProbe, NetworkResolver, Resolution, StaticProbe, SystemProbe};
pub use token::{AuthToken, TokenStore};
pub use types::{BindDecision, NetworkDescriptor, NetworkMode, TrustedNetworks};
