//! Shared value types for device/peer configuration and status.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WireGuardError};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};

/// Floor, in seconds, below which a peer is never considered online even
/// if `3 * keepalive` would suggest otherwise (spec.md §4.3).
pub const ONLINE_FLOOR_SECS: i64 = 180;

/// A remote endpoint `host:port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Build an endpoint directly from a socket address.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    /// The underlying socket address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl FromStr for Endpoint {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<SocketAddr>()
            .map(Self)
            .map_err(|e| WireGuardError::InvalidEndpoint(format!("{s}: {e}")))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An allowed-IP CIDR entry on a peer, or a device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllowedIp(IpNet);

impl AllowedIp {
    /// Build from a parsed `IpNet`.
    #[must_use]
    pub fn from_net(net: IpNet) -> Self {
        Self(net)
    }

    /// The underlying network.
    #[must_use]
    pub fn network(&self) -> IpNet {
        self.0
    }

    /// True when this entry is an exact single host (`/32` or `/128`).
    #[must_use]
    pub fn is_host(&self) -> bool {
        self.0.prefix_len() == self.0.max_prefix_len()
    }
}

impl FromStr for AllowedIp {
    type Err = WireGuardError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<IpNet>()
            .map(Self)
            .map_err(|e| WireGuardError::InvalidCidr(format!("{s}: {e}")))
    }
}

impl fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single peer entry within a device configuration, as passed to
/// `DeviceController::configure_device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// The peer's public key — the identity used for replace/remove.
    pub public_key: PublicKey,
    /// Optional preshared key.
    pub preshared_key: Option<PresharedKey>,
    /// The peer's allowed-IP set.
    pub allowed_ips: Vec<AllowedIp>,
    /// The peer's last-known or configured endpoint.
    pub endpoint: Option<Endpoint>,
    /// Persistent keepalive interval in seconds, if any.
    pub persistent_keepalive: Option<u16>,
}

impl PeerConfig {
    /// Start building a peer configuration for the given public key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            allowed_ips: Vec::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    /// Set the preshared key.
    #[must_use]
    pub fn with_preshared_key(mut self, psk: PresharedKey) -> Self {
        self.preshared_key = Some(psk);
        self
    }

    /// Append an allowed-IP entry.
    #[must_use]
    pub fn with_allowed_ip(mut self, ip: AllowedIp) -> Self {
        self.allowed_ips.push(ip);
        self
    }

    /// Set the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Set the persistent keepalive interval.
    #[must_use]
    pub fn with_persistent_keepalive(mut self, seconds: u16) -> Self {
        self.persistent_keepalive = Some(seconds);
        self
    }
}

/// A full, declarative device configuration. `configure_device` always
/// replaces the entire peer set with `peers` — there is no incremental
/// add/remove at the driver's kernel-facing boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// The kernel interface name, e.g. `wg0`.
    pub name: String,
    /// The device's own private key.
    pub private_key: PrivateKey,
    /// UDP listen port.
    pub listen_port: u16,
    /// Addresses assigned to the device itself.
    pub addresses: Vec<AllowedIp>,
    /// The full replacement peer set.
    pub peers: Vec<PeerConfig>,
    /// Optional MTU override.
    pub mtu: Option<u16>,
}

/// Live status of a single peer, as returned by `peer_status`.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    /// The peer's public key.
    pub public_key: PublicKey,
    /// Last-observed endpoint, if any.
    pub endpoint: Option<Endpoint>,
    /// Unix timestamp (seconds) of the last successful handshake.
    pub last_handshake: Option<i64>,
    /// Cumulative bytes received from this peer.
    pub rx_bytes: u64,
    /// Cumulative bytes transmitted to this peer.
    pub tx_bytes: u64,
}

impl PeerStatus {
    /// Derive `online` per spec.md §4.3:
    /// `online == (now - lastHandshake) <= max(180s, 3*keepalive)`.
    #[must_use]
    pub fn is_online(&self, now: i64, keepalive: Option<u16>) -> bool {
        let Some(last) = self.last_handshake else {
            return false;
        };
        let floor = ONLINE_FLOOR_SECS.max(i64::from(keepalive.unwrap_or(0)) * 3);
        now.saturating_sub(last) <= floor
    }
}

/// Live status of a device and all of its peers.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    /// Kernel interface name.
    pub name: String,
    /// The device's public key.
    pub public_key: PublicKey,
    /// UDP listen port, if the device is up.
    pub listen_port: Option<u16>,
    /// Assigned addresses.
    pub addresses: Vec<AllowedIp>,
    /// Per-peer live status.
    pub peers: Vec<PeerStatus>,
}
