//! Re-exports of the persisted domain types plus the in-memory status
//! shapes the Monitor produces. The entity types themselves live in
//! `wgpilot_store::types` (see `DESIGN.md`'s Open Question 5) — this
//! module is the single place callers of `wgpilot-core` import them
//! from, so the split is invisible at the call site.

pub use wgpilot_store::types::{
    Bridge, BridgeDirection, BridgeUpdate, Network, NetworkMode, NetworkUpdate, NewBridge,
    NewNetwork, NewPeer, Peer, PeerRole, PeerSnapshot, PeerUpdate,
};

/// Live status of one peer, as surfaced by the Monitor to `GET
/// /api/status`, the SSE stream, and the Prometheus scrape path.
#[derive(Debug, Clone)]
pub struct PeerLiveStatus {
    /// The peer's id in the Store.
    pub peer_id: i64,
    /// The peer's display name, for Prometheus labels.
    pub name: String,
    /// Cumulative bytes received from this peer.
    pub rx_bytes: u64,
    /// Cumulative bytes transmitted to this peer.
    pub tx_bytes: u64,
    /// Unix seconds of the last successful handshake, if any.
    pub last_handshake: Option<i64>,
    /// Derived online/offline state, per spec.md §4.3.
    pub online: bool,
}

/// Live status of one network, published on the Monitor's fan-out
/// channel and rendered by the Prometheus exposition path.
#[derive(Debug, Clone)]
pub struct NetworkLiveStatus {
    /// The network's id in the Store.
    pub network_id: i64,
    /// The kernel interface name, used as the `network` metric label.
    pub interface: String,
    /// Whether the kernel device currently exists and matches the
    /// Store's desired config.
    pub interface_up: bool,
    /// Live status of every enabled peer on this network.
    pub peers: Vec<PeerLiveStatus>,
}

impl NetworkLiveStatus {
    /// Number of peers in this sample, regardless of online state.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Number of peers this sample found online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.peers.iter().filter(|p| p.online).count()
    }

    /// Cumulative bytes received across every peer on this network, per
    /// spec.md §4.7 ("cumulative `wg_transfer_bytes_total{direction=rx|tx}`").
    #[must_use]
    pub fn total_rx_bytes(&self) -> u64 {
        self.peers.iter().map(|p| p.rx_bytes).sum()
    }

    /// Cumulative bytes transmitted across every peer on this network.
    #[must_use]
    pub fn total_tx_bytes(&self) -> u64 {
        self.peers.iter().map(|p| p.tx_bytes).sum()
    }
}
