//! Core domain types

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Which network the relay listens on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Devices on the same physical network; token required
    #[default]
    LocalSubnet,
    /// Devices on the overlay VPN; the overlay authenticates peers
    VpnOverlay,
}

impl NetworkMode {
    /// Whether connections must present the shared token
    pub fn requires_token(&self) -> bool {
        matches!(self, NetworkMode::LocalSubnet)
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::LocalSubnet => write!(f, "local-subnet"),
            NetworkMode::VpnOverlay => write!(f, "vpn-overlay"),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "local-subnet" | "local" | "lan" => Ok(NetworkMode::LocalSubnet),
            "vpn-overlay" | "vpn" | "tailscale" => Ok(NetworkMode::VpnOverlay),
            other => Err(format!(
                "unknown network mode '{}' (expected local-subnet or vpn-overlay)",
                other
            )),
        }
    }
}

/// Resolved listening address for one server start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindDecision {
    /// Interface address to bind
    pub address: IpAddr,
    /// TCP port
    pub port: u16,
    /// Mode the address was resolved for
    pub mode: NetworkMode,
}

impl BindDecision {
    /// Create a new bind decision
    pub fn new(address: IpAddr, port: u16, mode: NetworkMode) -> Self {
        Self {
            address,
            port,
            mode,
        }
    }

    /// Socket address to pass to the listener
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// URL remote clients connect to
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.socket_addr())
    }
}

impl fmt::Display for BindDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.socket_addr(), self.mode)
    }
}

/// Stable identifier of a local network: its subnet in CIDR form
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkDescriptor(String);

impl NetworkDescriptor {
    /// Wrap an already-formatted descriptor
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self(descriptor.into())
    }

    /// Derive the descriptor from an interface address and its netmask
    ///
    /// `192.168.1.23` with `255.255.255.0` becomes `192.168.1.0/24`. Without a
    /// netmask the host address itself (`/32`) is used.
    pub fn from_subnet(address: Ipv4Addr, netmask: Option<Ipv4Addr>) -> Self {
        let mask = netmask.map(u32::from).unwrap_or(u32::MAX);
        let prefix = mask.leading_ones();
        let network = Ipv4Addr::from(u32::from(address) & mask);
        Self(format!("{}/{}", network, prefix))
    }

    /// Get the raw descriptor string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Networks the user approved for automatic relay startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrustedNetworks(BTreeSet<NetworkDescriptor>);

impl TrustedNetworks {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the descriptor is trusted
    pub fn contains(&self, network: &NetworkDescriptor) -> bool {
        self.0.contains(network)
    }

    /// Trust a network; returns false if it was already trusted
    pub fn insert(&mut self, network: NetworkDescriptor) -> bool {
        self.0.insert(network)
    }

    /// Stop trusting a network; returns false if it was not trusted
    pub fn remove(&mut self, network: &NetworkDescriptor) -> bool {
        self.0.remove(network)
    }

    /// Iterate trusted descriptors in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &NetworkDescriptor> {
        self.0.iter()
    }

    /// Number of trusted networks
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<NetworkDescriptor> for TrustedNetworks {
    fn from_iter<I: IntoIterator<Item = NetworkDescriptor>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
