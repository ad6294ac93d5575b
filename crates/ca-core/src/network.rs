//! Network resolution: which address the relay may bind to
//!
//! Resolution is a pure query over a [`NetworkProbe`]. It never opens the
//! listening socket and never consults mutable process state; the caller
//! hands in a [`BindState`] and the trusted set and gets back a
//! [`Resolution`].
//!
//! # Strategies
//!
//! VPN-overlay mode tries, in order:
//! 1. `tailscale ip -4`
//! 2. `tailscale status --json` self addresses
//! 3. interface enumeration filtered to 100.64.0.0/10
//!
//! and returns the first address inside the overlay range. Local-subnet mode
//! takes the address the default route leaves from, falling back to the
//! first up, non-loopback, non-overlay interface.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use crate::error::ResolveError;
use crate::types::{BindDecision, NetworkDescriptor, NetworkMode, TrustedNetworks};

/// Overlay (CGNAT) range used by Tailscale: 100.64.0.0/10
const OVERLAY_NETWORK: Ipv4Addr = Ipv4Addr::new(100, 64, 0, 0);
const OVERLAY_PREFIX: u32 = 10;

/// Whether `addr` lies in the overlay address range
pub fn is_overlay_address(addr: Ipv4Addr) -> bool {
    let mask = u32::MAX << (32 - OVERLAY_PREFIX);
    u32::from(addr) & mask == u32::from(OVERLAY_NETWORK)
}

/// One IPv4 address assigned to a local interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    /// Interface name (e.g. `en0`, `tailscale0`)
    pub name: String,
    /// Assigned address
    pub address: Ipv4Addr,
    /// Netmask, when reported
    pub netmask: Option<Ipv4Addr>,
    /// Whether this is a loopback interface
    pub loopback: bool,
}

/// Source of facts about the host's network
pub trait NetworkProbe: Send + Sync {
    /// Addresses from `tailscale ip -4`
    fn overlay_cli_addresses(&self) -> Vec<Ipv4Addr>;

    /// Self addresses from `tailscale status --json`
    fn overlay_status_addresses(&self) -> Vec<Ipv4Addr>;

    /// IPv4 addresses of every up interface
    fn interfaces(&self) -> Vec<InterfaceAddr>;

    /// Source address of the default route
    fn primary_route_address(&self) -> Option<Ipv4Addr>;
}

/// Probe backed by the operating system and the tailscale CLI
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl NetworkProbe for SystemProbe {
    fn overlay_cli_addresses(&self) -> Vec<Ipv4Addr> {
        crate::tailscale::ip_v4().unwrap_or_else(|e| {
            tracing::debug!("tailscale ip -4 unavailable: {:#}", e);
            Vec::new()
        })
    }

    fn overlay_status_addresses(&self) -> Vec<Ipv4Addr> {
        crate::tailscale::self_ips_from_status().unwrap_or_else(|e| {
            tracing::debug!("tailscale status unavailable: {:#}", e);
            Vec::new()
        })
    }

    #[cfg(unix)]
    fn interfaces(&self) -> Vec<InterfaceAddr> {
        use nix::ifaddrs::getifaddrs;
        use nix::net::if_::InterfaceFlags;
        use std::net::SocketAddrV4;

        let addrs = match getifaddrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::warn!("Failed to enumerate interfaces: {}", e);
                return Vec::new();
            }
        };

        addrs
            .filter(|ifa| ifa.flags.contains(InterfaceFlags::IFF_UP))
            .filter_map(|ifa| {
                let address = ifa.address.as_ref()?.as_sockaddr_in()?;
                let netmask = ifa
                    .netmask
                    .as_ref()
                    .and_then(|mask| mask.as_sockaddr_in())
                    .map(|mask| *SocketAddrV4::from(*mask).ip());
                Some(InterfaceAddr {
                    name: ifa.interface_name.clone(),
                    address: *SocketAddrV4::from(*address).ip(),
                    netmask,
                    loopback: ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK),
                })
            })
            .collect()
    }

    #[cfg(not(unix))]
    fn interfaces(&self) -> Vec<InterfaceAddr> {
        Vec::new()
    }

    fn primary_route_address(&self) -> Option<Ipv4Addr> {
        // Connecting a UDP socket only selects a route; nothing is sent.
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
        match socket.local_addr().ok()? {
            SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
            _ => None,
        }
    }
}

/// Probe with fixed answers
///
/// Used to pin the relay to known addresses, and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub cli: Vec<Ipv4Addr>,
    pub status: Vec<Ipv4Addr>,
    pub interfaces: Vec<InterfaceAddr>,
    pub primary: Option<Ipv4Addr>,
}

impl NetworkProbe for StaticProbe {
    fn overlay_cli_addresses(&self) -> Vec<Ipv4Addr> {
        self.cli.clone()
    }

    fn overlay_status_addresses(&self) -> Vec<Ipv4Addr> {
        self.status.clone()
    }

    fn interfaces(&self) -> Vec<InterfaceAddr> {
        self.interfaces.clone()
    }

    fn primary_route_address(&self) -> Option<Ipv4Addr> {
        self.primary
    }
}

/// Mode and port the relay should run with, plus the last decision made for them
///
/// A mode switch produces a new `BindState`; an existing one is never edited
/// while a listener is using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindState {
    pub mode: NetworkMode,
    pub port: u16,
    pub decision: Option<BindDecision>,
}

impl BindState {
    /// Unresolved state for a mode and port
    pub fn new(mode: NetworkMode, port: u16) -> Self {
        Self {
            mode,
            port,
            decision: None,
        }
    }

    /// Same mode and port with a fresh decision attached
    pub fn resolved(self, decision: BindDecision) -> Self {
        Self {
            decision: Some(decision),
            ..self
        }
    }
}

/// Outcome of a successful resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Address, port and mode to bind
    pub decision: BindDecision,
    /// Local network the address belongs to (local-subnet mode only)
    pub network: Option<NetworkDescriptor>,
    /// Whether automatic startup is allowed on this network
    pub trusted: bool,
}

/// Picks a bind address for a mode
#[derive(Debug, Clone, Default)]
pub struct NetworkResolver<P = SystemProbe> {
    probe: P,
}

impl NetworkResolver<SystemProbe> {
    /// Resolver backed by the real system
    pub fn system() -> Self {
        Self { probe: SystemProbe }
    }
}

impl<P: NetworkProbe> NetworkResolver<P> {
    /// Resolver backed by a custom probe
    pub fn with_probe(probe: P) -> Self {
        Self { probe }
    }

    /// Resolve the bind address for `state`
    ///
    /// An untrusted local network still resolves; the caller decides whether
    /// that blocks startup.
    pub fn resolve(
        &self,
        state: &BindState,
        trusted: &TrustedNetworks,
    ) -> Result<Resolution, ResolveError> {
        match state.mode {
            NetworkMode::VpnOverlay => {
                let address = self
                    .overlay_address()
                    .ok_or(ResolveError::NoAddressFound(state.mode))?;
                tracing::debug!("Resolved overlay address {}", address);
                Ok(Resolution {
                    decision: BindDecision::new(IpAddr::V4(address), state.port, state.mode),
                    network: None,
                    trusted: true,
                })
            }
            NetworkMode::LocalSubnet => {
                let iface = self
                    .local_interface()
                    .ok_or(ResolveError::NoAddressFound(state.mode))?;
                let network = NetworkDescriptor::from_subnet(iface.address, iface.netmask);
                let is_trusted = trusted.contains(&network);
                tracing::debug!(
                    "Resolved local address {} on {} ({}, trusted: {})",
                    iface.address,
                    iface.name,
                    network,
                    is_trusted
                );
                Ok(Resolution {
                    decision: BindDecision::new(
                        IpAddr::V4(iface.address),
                        state.port,
                        state.mode,
                    ),
                    network: Some(network),
                    trusted: is_trusted,
                })
            }
        }
    }

    /// Descriptor of the network the local-subnet address sits on
    pub fn current_network(&self) -> Option<NetworkDescriptor> {
        self.local_interface()
            .map(|iface| NetworkDescriptor::from_subnet(iface.address, iface.netmask))
    }

    fn overlay_address(&self) -> Option<Ipv4Addr> {
        let first_overlay =
            |addrs: Vec<Ipv4Addr>| addrs.into_iter().find(|addr| is_overlay_address(*addr));

        first_overlay(self.probe.overlay_cli_addresses())
            .or_else(|| first_overlay(self.probe.overlay_status_addresses()))
            .or_else(|| {
                first_overlay(
                    self.probe
                        .interfaces()
                        .into_iter()
                        .map(|iface| iface.address)
                        .collect(),
                )
            })
    }

    fn local_interface(&self) -> Option<InterfaceAddr> {
        let candidates: Vec<InterfaceAddr> = self
            .probe
            .interfaces()
            .into_iter()
            .filter(|iface| {
                !iface.loopback
                    && !iface.address.is_loopback()
                    && !iface.address.is_link_local()
                    && !is_overlay_address(iface.address)
            })
            .collect();

        if let Some(primary) = self.probe.primary_route_address() {
            if let Some(iface) = candidates.iter().find(|iface| iface.address == primary) {
                return Some(iface.clone());
            }
            if !primary.is_loopback() && !is_overlay_address(primary) {
                return Some(InterfaceAddr {
                    name: String::from("default-route"),
                    address: primary,
                    netmask: None,
                    loopback: false,
                });
            }
        }

        candidates
            .iter()
            .find(|iface| iface.address.is_private())
            .or_else(|| candidates.first())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, address: [u8; 4], prefix: u32) -> InterfaceAddr {
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        InterfaceAddr {
            name: name.to_string(),
            address: Ipv4Addr::from(address),
            netmask: Some(Ipv4Addr::from(mask)),
            loopback: name == "lo",
        }
    }

    fn home_network() -> StaticProbe {
        StaticProbe {
            cli: vec![],
            status: vec![],
            interfaces: vec![
                iface("lo", [127, 0, 0, 1], 8),
                iface("en0", [192, 168, 1, 23], 24),
                iface("tailscale0", [100, 88, 7, 9], 32),
            ],
            primary: Some(Ipv4Addr::new(192, 168, 1, 23)),
        }
    }

    #[test]
    fn test_overlay_range() {
        assert!(is_overlay_address(Ipv4Addr::new(100, 64, 0, 1)));
        assert!(is_overlay_address(Ipv4Addr::new(100, 127, 255, 254)));
        assert!(!is_overlay_address(Ipv4Addr::new(100, 128, 0, 1)));
        assert!(!is_overlay_address(Ipv4Addr::new(100, 63, 255, 255)));
        assert!(!is_overlay_address(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_local_subnet_untrusted_still_resolves() {
        let resolver = NetworkResolver::with_probe(home_network());
        let res = resolver
            .resolve(&BindState::new(NetworkMode::LocalSubnet, 8765), &TrustedNetworks::new())
            .unwrap();

        assert_eq!(res.decision.address, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 23)));
        assert_eq!(res.decision.port, 8765);
        assert_eq!(res.network, Some(NetworkDescriptor::new("192.168.1.0/24")));
        assert!(!res.trusted);
    }

    #[test]
    fn test_local_subnet_trusted() {
        let resolver = NetworkResolver::with_probe(home_network());
        let trusted: TrustedNetworks = [NetworkDescriptor::new("192.168.1.0/24")]
            .into_iter()
            .collect();
        let res = resolver
            .resolve(&BindState::new(NetworkMode::LocalSubnet, 8765), &trusted)
            .unwrap();
        assert!(res.trusted);
    }

    #[test]
    fn test_local_subnet_without_route_uses_private_interface() {
        let mut probe = home_network();
        probe.primary = None;
        probe.interfaces.insert(1, iface("utun3", [203, 0, 113, 5], 32));

        let resolver = NetworkResolver::with_probe(probe);
        let res = resolver
            .resolve(&BindState::new(NetworkMode::LocalSubnet, 1), &TrustedNetworks::new())
            .unwrap();
        assert_eq!(res.decision.address, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 23)));
    }

    #[test]
    fn test_local_subnet_no_address() {
        let resolver = NetworkResolver::with_probe(StaticProbe {
            interfaces: vec![iface("lo", [127, 0, 0, 1], 8)],
            ..Default::default()
        });
        let err = resolver
            .resolve(&BindState::new(NetworkMode::LocalSubnet, 1), &TrustedNetworks::new())
            .unwrap_err();
        assert_eq!(err, ResolveError::NoAddressFound(NetworkMode::LocalSubnet));
    }

    #[test]
    fn test_overlay_prefers_cli() {
        let mut probe = home_network();
        probe.cli = vec![Ipv4Addr::new(100, 70, 1, 1)];
        probe.status = vec![Ipv4Addr::new(100, 70, 2, 2)];

        let resolver = NetworkResolver::with_probe(probe);
        let res = resolver
            .resolve(&BindState::new(NetworkMode::VpnOverlay, 8765), &TrustedNetworks::new())
            .unwrap();
        assert_eq!(res.decision.address, IpAddr::V4(Ipv4Addr::new(100, 70, 1, 1)));
        assert_eq!(res.decision.mode, NetworkMode::VpnOverlay);
        assert!(res.trusted);
        assert!(res.network.is_none());
    }

    #[test]
    fn test_overlay_falls_back_to_status_then_interfaces() {
        let mut probe = home_network();
        probe.cli = vec![Ipv4Addr::new(10, 0, 0, 1)];
        probe.status = vec![Ipv4Addr::new(100, 70, 2, 2)];
        let resolver = NetworkResolver::with_probe(probe.clone());
        let res = resolver
            .resolve(&BindState::new(NetworkMode::VpnOverlay, 1), &TrustedNetworks::new())
            .unwrap();
        assert_eq!(res.decision.address, IpAddr::V4(Ipv4Addr::new(100, 70, 2, 2)));

        probe.status.clear();
        let resolver = NetworkResolver::with_probe(probe);
        let res = resolver
            .resolve(&BindState::new(NetworkMode::VpnOverlay, 1), &TrustedNetworks::new())
            .unwrap();
        assert_eq!(res.decision.address, IpAddr::V4(Ipv4Addr::new(100, 88, 7, 9)));
    }

    #[test]
    fn test_overlay_not_found() {
        let mut probe = home_network();
        probe.interfaces.retain(|iface| iface.name != "tailscale0");
        let resolver = NetworkResolver::with_probe(probe);
        let err = resolver
            .resolve(&BindState::new(NetworkMode::VpnOverlay, 1), &TrustedNetworks::new())
            .unwrap_err();
        assert_eq!(err, ResolveError::NoAddressFound(NetworkMode::VpnOverlay));
    }

    #[test]
    fn test_bind_state_resolved_keeps_mode() {
        let state = BindState::new(NetworkMode::VpnOverlay, 9000);
        let decision = BindDecision::new(
            IpAddr::V4(Ipv4Addr::new(100, 64, 0, 2)),
            9000,
            NetworkMode::VpnOverlay,
        );
        let next = state.resolved(decision);
        assert_eq!(next.mode, NetworkMode::VpnOverlay);
        assert_eq!(next.decision, Some(decision));
        assert_eq!(state.decision, None);
    }
}
