//! The Monitor: periodic polling of live peer counters, snapshot
//! persistence, retention compaction, SSE fan-out, and Prometheus
//! exposition (spec.md §4.7).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use wgpilot_store::types::PeerSnapshot;
use wgpilot_store::Store;
use wgpilot_wireguard::WireGuardDriver;

use crate::types::{NetworkLiveStatus, PeerLiveStatus};

/// Default poll tick (spec.md §4.7: "default 30 s").
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Default compaction tick (spec.md §4.7: "default 24 h").
pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Default snapshot retention horizon (spec.md §4.7: "default 30 d").
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);
/// Per-subscriber fan-out buffer depth; slow consumers are dropped by
/// `tokio::sync::broadcast`'s own lagged-receiver semantics rather than
/// blocking the publishing tick (spec.md §4.7, §9).
const FANOUT_CAPACITY: usize = 32;

/// Tunable intervals for one Monitor instance.
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    /// How often to sample live peer counters.
    pub poll_interval: Duration,
    /// How often to delete snapshots past the retention horizon.
    pub compaction_interval: Duration,
    /// How far back snapshots are kept before compaction deletes them.
    pub retention: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Owns the polling loop, the compaction loop, the SSE fan-out
/// registry, and the most-recent-by-network cache the Prometheus scrape
/// path reads from.
pub struct Monitor<W: WireGuardDriver> {
    store: Store,
    wg: Arc<W>,
    config: MonitorConfig,
    channels: SyncMutex<HashMap<i64, broadcast::Sender<NetworkLiveStatus>>>,
    cache: SyncRwLock<HashMap<i64, NetworkLiveStatus>>,
}

impl<W: WireGuardDriver> Monitor<W> {
    /// Construct a Monitor over the shared Store and WireGuard driver.
    pub fn new(store: Store, wg: Arc<W>, config: MonitorConfig) -> Self {
        Self {
            store,
            wg,
            config,
            channels: SyncMutex::new(HashMap::new()),
            cache: SyncRwLock::new(HashMap::new()),
        }
    }

    /// The most recently published status for a network, or `None` if
    /// no tick has sampled it yet. SSE subscribers read this once on
    /// connect (spec.md §4.7: "initial connect sends one immediate
    /// status message before entering the tick loop") before calling
    /// [`Monitor::subscribe`] for subsequent ticks.
    #[must_use]
    pub fn current_status(&self, network_id: i64) -> Option<NetworkLiveStatus> {
        self.cache.read().get(&network_id).cloned()
    }

    /// Every network's most recent status, for the Prometheus scrape
    /// path and the `GET /api/status` view.
    #[must_use]
    pub fn all_statuses(&self) -> Vec<NetworkLiveStatus> {
        self.cache.read().values().cloned().collect()
    }

    /// Subscribe to live status updates for one network. The returned
    /// receiver gets every tick's status from this point on; a slow
    /// subscriber that falls behind the bounded buffer is dropped
    /// (`RecvError::Lagged`) rather than the tick blocking on it.
    #[must_use]
    pub fn subscribe(&self, network_id: i64) -> broadcast::Receiver<NetworkLiveStatus> {
        let mut channels = self.channels.lock();
        channels
            .entry(network_id)
            .or_insert_with(|| broadcast::channel(FANOUT_CAPACITY).0)
            .subscribe()
    }

    /// Run the polling loop forever, ticking at `config.poll_interval`,
    /// until `cancel` fires.
    pub async fn run_poll_loop(&self, correlation_id: &str, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("monitor poll loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.poll_once(correlation_id).await;
                }
            }
        }
    }

    /// Run the compaction loop forever, ticking at
    /// `config.compaction_interval`, until `cancel` fires.
    pub async fn run_compaction_loop(&self, correlation_id: &str, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.compaction_interval);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("monitor compaction loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.compact_once(correlation_id).await;
                }
            }
        }
    }

    /// One polling tick: sample every enabled network's live peers,
    /// persist a snapshot per peer, publish to subscribers, and update
    /// the Prometheus cache.
    pub async fn poll_once(&self, correlation_id: &str) {
        let networks = match self.store.list_networks(correlation_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "monitor failed to list networks");
                return;
            }
        };
        let now = crate::orchestrator::now();

        for network in networks.iter().filter(|n| n.enabled) {
            let live_status = match self.wg.peer_status(&network.interface).await {
                Ok(statuses) => {
                    let peers = self.store.list_peers_by_network(network.id, correlation_id).await.unwrap_or_default();
                    let mut peer_live = Vec::with_capacity(statuses.len());
                    for status in &statuses {
                        let Some(peer) = peers.iter().find(|p| p.public_key == status.public_key) else {
                            continue;
                        };
                        let online = status.is_online(now, peer.persistent_keepalive);
                        let snapshot = PeerSnapshot {
                            peer_id: peer.id,
                            timestamp: now,
                            rx_bytes: status.rx_bytes,
                            tx_bytes: status.tx_bytes,
                            online,
                        };
                        if let Err(e) = self.store.record_peer_snapshot(&snapshot, correlation_id).await {
                            warn!(peer_id = peer.id, error = %e, "failed to record peer snapshot");
                        }
                        peer_live.push(PeerLiveStatus {
                            peer_id: peer.id,
                            name: peer.name.clone(),
                            rx_bytes: status.rx_bytes,
                            tx_bytes: status.tx_bytes,
                            last_handshake: status.last_handshake,
                            online,
                        });
                    }
                    NetworkLiveStatus {
                        network_id: network.id,
                        interface: network.interface.clone(),
                        interface_up: true,
                        peers: peer_live,
                    }
                }
                Err(e) => {
                    warn!(interface = %network.interface, error = %e, "monitor failed to sample live peers");
                    NetworkLiveStatus {
                        network_id: network.id,
                        interface: network.interface.clone(),
                        interface_up: false,
                        peers: Vec::new(),
                    }
                }
            };

            self.cache.write().insert(network.id, live_status.clone());

            let mut channels = self.channels.lock();
            let sender = channels.entry(network.id).or_insert_with(|| broadcast::channel(FANOUT_CAPACITY).0);
            // No receivers is not an error — it just means nobody is
            // subscribed to this network's SSE stream right now.
            let _ = sender.send(live_status);
        }
    }

    /// One compaction tick: delete snapshots older than the retention
    /// horizon.
    pub async fn compact_once(&self, correlation_id: &str) {
        let cutoff = crate::orchestrator::now() - self.config.retention.as_secs() as i64;
        match self.store.compact_peer_snapshots(cutoff, correlation_id).await {
            Ok(deleted) if deleted > 0 => info!(deleted, cutoff, "compacted peer snapshots"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to compact peer snapshots"),
        }
    }

    /// Render the current cache as Prometheus text exposition format.
    /// Synchronous relative to the drivers: it only ever reads the
    /// cache the polling tick already populated, per spec.md §4.7.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let cache = self.cache.read();
        let mut out = String::new();
        let _ = writeln!(out, "# HELP wg_interface_up Whether a managed interface is up and reconciled.");
        let _ = writeln!(out, "# TYPE wg_interface_up gauge");
        for status in cache.values() {
            let _ = writeln!(out, "wg_interface_up{{network=\"{}\"}} {}", status.interface, u8::from(status.interface_up));
        }

        let _ = writeln!(out, "# HELP wg_peers_total Number of peers configured on a network.");
        let _ = writeln!(out, "# TYPE wg_peers_total gauge");
        for status in cache.values() {
            let _ = writeln!(out, "wg_peers_total{{network=\"{}\"}} {}", status.interface, status.peer_count());
        }

        let _ = writeln!(out, "# HELP wg_peers_online Number of peers currently considered online.");
        let _ = writeln!(out, "# TYPE wg_peers_online gauge");
        for status in cache.values() {
            let _ = writeln!(out, "wg_peers_online{{network=\"{}\"}} {}", status.interface, status.online_count());
        }

        let _ = writeln!(out, "# HELP wg_transfer_bytes_total Cumulative bytes transferred per interface.");
        let _ = writeln!(out, "# TYPE wg_transfer_bytes_total counter");
        for status in cache.values() {
            let _ = writeln!(
                out,
                "wg_transfer_bytes_total{{network=\"{}\",direction=\"rx\"}} {}",
                status.interface,
                status.total_rx_bytes()
            );
            let _ = writeln!(
                out,
                "wg_transfer_bytes_total{{network=\"{}\",direction=\"tx\"}} {}",
                status.interface,
                status.total_tx_bytes()
            );
        }

        let _ = writeln!(out, "# HELP wg_peer_last_handshake_seconds Seconds between the last handshake and now.");
        let _ = writeln!(out, "# TYPE wg_peer_last_handshake_seconds gauge");
        let now = crate::orchestrator::now();
        for status in cache.values() {
            for peer in &status.peers {
                if let Some(last) = peer.last_handshake {
                    let _ = writeln!(
                        out,
                        "wg_peer_last_handshake_seconds{{network=\"{}\",peer=\"{}\"}} {}",
                        status.interface,
                        peer.name,
                        now.saturating_sub(last)
                    );
                }
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpilot_store::test_support::temp_store;
    use wgpilot_store::types::{NetworkMode, NewNetwork, NewPeer, PeerRole};
    use wgpilot_wireguard::{FakeWireGuardDriver, KeyPair, PeerConfig, WireGuardDriver as _};

    async fn seeded() -> (Store, tempfile::NamedTempFile, Arc<FakeWireGuardDriver>, i64, String, String) {
        let (store, file) = temp_store().await;
        let net_keys = KeyPair::generate();
        let network = store
            .create_network(
                &NewNetwork {
                    name: "Home VPN".to_string(),
                    interface: "wg0".to_string(),
                    mode: NetworkMode::Gateway,
                    subnet: "10.0.0.0/24".parse().expect("valid cidr"),
                    listen_port: 51820,
                    private_key: net_keys.private,
                    public_key: net_keys.public,
                    dns_servers: String::new(),
                    nat_enabled: true,
                    inter_peer_routing: false,
                },
                0,
                "seed",
            )
            .await
            .expect("seed network");

        let wg = Arc::new(FakeWireGuardDriver::new());
        let peer_keys = KeyPair::generate();
        let peer = store
            .create_peer(
                &NewPeer {
                    network_id: network.id,
                    name: "Phone".to_string(),
                    email: None,
                    private_key: peer_keys.private,
                    public_key: peer_keys.public,
                    preshared_key: None,
                    allowed_ips: "10.0.0.2/32".to_string(),
                    endpoint: None,
                    persistent_keepalive: Some(25),
                    role: PeerRole::Client,
                    site_networks: String::new(),
                },
                0,
                "seed",
            )
            .await
            .expect("seed peer");

        wg.create_interface(&wgpilot_wireguard::DeviceConfig {
            name: network.interface.clone(),
            private_key: network.private_key.clone(),
            listen_port: network.listen_port,
            addresses: Vec::new(),
            peers: vec![PeerConfig::new(peer.public_key)],
            mtu: None,
        })
        .await
        .expect("seed kernel interface");

        (store, file, wg, network.id, network.interface, peer.public_key.to_base64())
    }

    #[tokio::test]
    async fn seed_scenario_6_prometheus_output_matches_bit_exact_metric_names() {
        let (store, _file, wg, network_id, interface, peer_key) = seeded().await;
        let last_handshake = crate::orchestrator::now() - 10;
        wg.simulate_handshake(&interface, &peer_key, last_handshake, 5000, 3000).await;

        let monitor = Monitor::new(store, wg, MonitorConfig::default());
        monitor.poll_once("t").await;

        let text = monitor.render_prometheus();
        assert!(text.contains(&format!("wg_transfer_bytes_total{{network=\"{interface}\",direction=\"rx\"}} 5000")));
        assert!(text.contains(&format!("wg_peer_last_handshake_seconds{{network=\"{interface}\",peer=\"Phone\"}} 10")));
        assert!(text.contains(&format!("wg_interface_up{{network=\"{interface}\"}} 1")));
        assert!(text.contains(&format!("wg_peers_total{{network=\"{interface}\"}} 1")));

        let status = monitor.current_status(network_id).expect("status cached");
        assert_eq!(status.peer_count(), 1);
    }

    #[tokio::test]
    async fn subscriber_receives_published_tick() {
        let (store, _file, wg, network_id, _interface, _peer_key) = seeded().await;
        let monitor = Monitor::new(store, wg, MonitorConfig::default());
        let mut rx = monitor.subscribe(network_id);

        monitor.poll_once("t").await;
        let status = rx.recv().await.expect("status published");
        assert_eq!(status.network_id, network_id);
    }
}
