//! Persisted domain types — one struct/enum per entity in spec.md §3,
//! plus the "new" structs used to create a row. Field names match the
//! §6 schema exactly since downstream tools depend on them.

use std::fmt;
use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use wgpilot_wireguard::{PresharedKey, PrivateKey, PublicKey};

use crate::error::StoreError;

/// Topology mode of a managed network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// Client traffic egresses via the server with source NAT.
    Gateway,
    /// Peers represent remote site gateways announcing LAN CIDRs.
    SiteToSite,
    /// Peers reach each other through the server with inter-peer forwarding.
    HubRouted,
}

impl NetworkMode {
    const GATEWAY: &'static str = "gateway";
    const SITE_TO_SITE: &'static str = "site-to-site";
    const HUB_ROUTED: &'static str = "hub-routed";
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gateway => Self::GATEWAY,
            Self::SiteToSite => Self::SITE_TO_SITE,
            Self::HubRouted => Self::HUB_ROUTED,
        };
        f.write_str(s)
    }
}

impl FromStr for NetworkMode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::GATEWAY => Ok(Self::Gateway),
            Self::SITE_TO_SITE => Ok(Self::SiteToSite),
            Self::HUB_ROUTED => Ok(Self::HubRouted),
            other => Err(StoreError::InvalidStoredValue {
                field: "networks.mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Direction of a bridge between two networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeDirection {
    /// Traffic flows from network A into network B only.
    AToB,
    /// Traffic flows from network B into network A only.
    BToA,
    /// Traffic flows both ways.
    Bidirectional,
}

impl BridgeDirection {
    const A_TO_B: &'static str = "a_to_b";
    const B_TO_A: &'static str = "b_to_a";
    const BIDIRECTIONAL: &'static str = "bidirectional";
}

impl fmt::Display for BridgeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AToB => Self::A_TO_B,
            Self::BToA => Self::B_TO_A,
            Self::Bidirectional => Self::BIDIRECTIONAL,
        };
        f.write_str(s)
    }
}

impl FromStr for BridgeDirection {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::A_TO_B => Ok(Self::AToB),
            Self::B_TO_A => Ok(Self::BToA),
            Self::BIDIRECTIONAL => Ok(Self::Bidirectional),
            other => Err(StoreError::InvalidStoredValue {
                field: "network_bridges.direction",
                value: other.to_string(),
            }),
        }
    }
}

/// Role of a peer within its network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// An ordinary client device.
    Client,
    /// A remote site gateway announcing LAN CIDRs.
    SiteGateway,
}

impl PeerRole {
    const CLIENT: &'static str = "client";
    const SITE_GATEWAY: &'static str = "site-gateway";
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Client => Self::CLIENT,
            Self::SiteGateway => Self::SITE_GATEWAY,
        };
        f.write_str(s)
    }
}

impl FromStr for PeerRole {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            Self::CLIENT => Ok(Self::Client),
            Self::SITE_GATEWAY => Ok(Self::SiteGateway),
            other => Err(StoreError::InvalidStoredValue {
                field: "peers.role",
                value: other.to_string(),
            }),
        }
    }
}

/// A managed WireGuard interface, as persisted in `networks`.
#[derive(Debug, Clone)]
pub struct Network {
    /// Primary key.
    pub id: i64,
    /// Human-readable display name.
    pub name: String,
    /// Kernel interface name, e.g. `wg0`.
    pub interface: String,
    /// Topology mode.
    pub mode: NetworkMode,
    /// Private IPv4 CIDR for this network, within RFC1918.
    pub subnet: Ipv4Net,
    /// UDP listen port.
    pub listen_port: u16,
    /// The network's own private key.
    pub private_key: PrivateKey,
    /// The network's own public key, derived from `private_key`.
    pub public_key: PublicKey,
    /// DNS servers pushed to peers, comma-separated.
    pub dns_servers: String,
    /// Whether a masquerade rule should exist for this interface.
    pub nat_enabled: bool,
    /// Whether inter-peer forwarding should be enabled on this interface.
    pub inter_peer_routing: bool,
    /// Whether this network is active.
    pub enabled: bool,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

/// Fields needed to create a new `Network` row.
#[derive(Debug, Clone)]
pub struct NewNetwork {
    /// See [`Network::name`].
    pub name: String,
    /// See [`Network::interface`].
    pub interface: String,
    /// See [`Network::mode`].
    pub mode: NetworkMode,
    /// See [`Network::subnet`].
    pub subnet: Ipv4Net,
    /// See [`Network::listen_port`].
    pub listen_port: u16,
    /// See [`Network::private_key`].
    pub private_key: PrivateKey,
    /// See [`Network::public_key`].
    pub public_key: PublicKey,
    /// See [`Network::dns_servers`].
    pub dns_servers: String,
    /// See [`Network::nat_enabled`].
    pub nat_enabled: bool,
    /// See [`Network::inter_peer_routing`].
    pub inter_peer_routing: bool,
}

/// Mutable fields of an existing network, applied on top of the current
/// row (config edits per spec.md §3 "mutated by config edits").
#[derive(Debug, Clone, Default)]
pub struct NetworkUpdate {
    /// New display name, if changing.
    pub name: Option<String>,
    /// New DNS servers, if changing.
    pub dns_servers: Option<String>,
    /// New NAT flag, if changing.
    pub nat_enabled: Option<bool>,
    /// New inter-peer routing flag, if changing.
    pub inter_peer_routing: Option<bool>,
    /// New enabled flag, if changing.
    pub enabled: Option<bool>,
}

/// A client or site gateway attached to exactly one `Network`.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Primary key.
    pub id: i64,
    /// Foreign key to `networks.id`.
    pub network_id: i64,
    /// Human-readable display name.
    pub name: String,
    /// Optional contact email.
    pub email: Option<String>,
    /// The peer's own private key.
    pub private_key: PrivateKey,
    /// The peer's own public key, derived from `private_key`.
    pub public_key: PublicKey,
    /// Optional preshared key shared with the server.
    pub preshared_key: Option<PresharedKey>,
    /// Comma-separated CIDR list, always containing exactly one `/32`.
    pub allowed_ips: String,
    /// Optional `host:port` endpoint.
    pub endpoint: Option<String>,
    /// Persistent keepalive interval in seconds, in `[0, 65535]`.
    pub persistent_keepalive: Option<u16>,
    /// Client or site-gateway.
    pub role: PeerRole,
    /// Comma-separated site-network CIDRs (role = site-gateway only).
    pub site_networks: String,
    /// Whether this peer is active.
    pub enabled: bool,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

/// Fields needed to create a new `Peer` row.
#[derive(Debug, Clone)]
pub struct NewPeer {
    /// See [`Peer::network_id`].
    pub network_id: i64,
    /// See [`Peer::name`].
    pub name: String,
    /// See [`Peer::email`].
    pub email: Option<String>,
    /// See [`Peer::private_key`].
    pub private_key: PrivateKey,
    /// See [`Peer::public_key`].
    pub public_key: PublicKey,
    /// See [`Peer::preshared_key`].
    pub preshared_key: Option<PresharedKey>,
    /// See [`Peer::allowed_ips`].
    pub allowed_ips: String,
    /// See [`Peer::endpoint`].
    pub endpoint: Option<String>,
    /// See [`Peer::persistent_keepalive`].
    pub persistent_keepalive: Option<u16>,
    /// See [`Peer::role`].
    pub role: PeerRole,
    /// See [`Peer::site_networks`].
    pub site_networks: String,
}

/// Mutable fields of an existing peer.
#[derive(Debug, Clone, Default)]
pub struct PeerUpdate {
    /// New display name, if changing.
    pub name: Option<String>,
    /// New email, if changing.
    pub email: Option<Option<String>>,
    /// New endpoint, if changing.
    pub endpoint: Option<Option<String>>,
    /// New keepalive, if changing.
    pub persistent_keepalive: Option<Option<u16>>,
    /// New allowed-IPs CSV, if changing.
    pub allowed_ips: Option<String>,
    /// New site-network CSV, if changing.
    pub site_networks: Option<String>,
    /// New enabled flag, if changing.
    pub enabled: Option<bool>,
}

/// A policy forwarding relationship between two networks.
#[derive(Debug, Clone)]
pub struct Bridge {
    /// Primary key.
    pub id: i64,
    /// First network in the ordered pair (forward order as created).
    pub network_a_id: i64,
    /// Second network in the ordered pair.
    pub network_b_id: i64,
    /// Direction of traffic flow.
    pub direction: BridgeDirection,
    /// Optional comma-separated CIDR allow-list restricting the bridge.
    pub allowed_cidrs: String,
    /// Whether this bridge is active.
    pub enabled: bool,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

/// Fields needed to create a new `Bridge` row.
#[derive(Debug, Clone)]
pub struct NewBridge {
    /// See [`Bridge::network_a_id`].
    pub network_a_id: i64,
    /// See [`Bridge::network_b_id`].
    pub network_b_id: i64,
    /// See [`Bridge::direction`].
    pub direction: BridgeDirection,
    /// See [`Bridge::allowed_cidrs`].
    pub allowed_cidrs: String,
}

/// Mutable fields of an existing bridge.
#[derive(Debug, Clone, Default)]
pub struct BridgeUpdate {
    /// New direction, if changing.
    pub direction: Option<BridgeDirection>,
    /// New CIDR allow-list, if changing.
    pub allowed_cidrs: Option<String>,
    /// New enabled flag, if changing.
    pub enabled: Option<bool>,
}

/// A timestamped sample of a peer's live counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// Foreign key to `peers.id`.
    pub peer_id: i64,
    /// Unix seconds.
    pub timestamp: i64,
    /// Cumulative bytes received from this peer, monotonic from creation.
    pub rx_bytes: u64,
    /// Cumulative bytes transmitted to this peer, monotonic from creation.
    pub tx_bytes: u64,
    /// Whether the peer was online at sample time.
    pub online: bool,
}
