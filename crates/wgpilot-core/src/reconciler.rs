//! The Reconciler: startup alignment of live kernel state with the
//! Store's desired state (spec.md §4.5). Runs once before the process
//! begins accepting mutating traffic; idempotent by construction — a
//! no-drift system performs only read calls, since every write step
//! first compares the target configuration against what is already
//! live and skips the call when they already match.

use std::collections::HashSet;
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{info, warn};

use wgpilot_firewall::{Applier, FirewallDriver, ManagedRule};
use wgpilot_store::types::{Bridge, Network};
use wgpilot_store::Store;
use wgpilot_wireguard::{AllowedIp, DeviceConfig, DeviceController, WireGuardDriver};

use crate::orchestrator::{build_peer_config, non_empty, to_fw_direction};

/// What happened during one reconciliation pass, for startup logging
/// and for surfacing residual drift without blocking the server from
/// serving (spec.md §4.5: "partial failures... do not prevent the
/// server from serving").
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Interfaces created because an enabled Network had no device.
    pub interfaces_created: Vec<String>,
    /// Interfaces torn down because no enabled Network backed them.
    pub interfaces_removed: Vec<String>,
    /// Interfaces whose peer set was rewritten to match the Store.
    pub peer_sets_reapplied: Vec<String>,
    /// `(context, message)` pairs for every step that failed; the
    /// corresponding network remains marked enabled but is visible as
    /// `interface-down` in status until a later reconcile succeeds.
    pub failures: Vec<(String, String)>,
}

impl ReconcileReport {
    /// True when every step succeeded and nothing needed changing —
    /// the steady-state case.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.interfaces_created.is_empty()
            && self.interfaces_removed.is_empty()
            && self.peer_sets_reapplied.is_empty()
            && self.failures.is_empty()
    }
}

/// Runs the six-step reconciliation process once at process start.
pub struct Reconciler<W, A>
where
    W: WireGuardDriver,
    A: Applier,
{
    store: Store,
    wg: Arc<W>,
    firewall: Arc<FirewallDriver<A>>,
}

impl<W, A> Reconciler<W, A>
where
    W: WireGuardDriver,
    A: Applier,
{
    /// Construct a reconciler over the same Store and driver instances
    /// the Orchestrator uses.
    pub fn new(store: Store, wg: Arc<W>, firewall: Arc<FirewallDriver<A>>) -> Self {
        Self { store, wg, firewall }
    }

    /// Run all six steps. Never returns an error itself — every
    /// failure is recorded in the returned report so the caller can log
    /// it and continue starting up.
    pub async fn reconcile(&self, correlation_id: &str) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let networks = match self.store.list_networks(correlation_id).await {
            Ok(n) => n,
            Err(e) => {
                report.failures.push(("list_networks".to_string(), e.to_string()));
                return report;
            }
        };
        let enabled: Vec<&Network> = networks.iter().filter(|n| n.enabled).collect();

        let live = match self.wg.devices().await {
            Ok(d) => d,
            Err(e) => {
                report.failures.push(("devices".to_string(), e.to_string()));
                Vec::new()
            }
        };

        for info in &live {
            if !enabled.iter().any(|n| n.interface == info.name) {
                match self.wg.delete_interface(&info.name).await {
                    Ok(()) => {
                        info!(interface = %info.name, "reconciler removed orphaned interface");
                        report.interfaces_removed.push(info.name.clone());
                    }
                    Err(e) => {
                        warn!(interface = %info.name, error = %e, "reconciler failed to remove orphaned interface");
                        report.failures.push((info.name.clone(), e.to_string()));
                    }
                }
            }
        }

        for network in &enabled {
            let exists = live.iter().any(|i| i.name == network.interface);
            if exists {
                continue;
            }
            match wgpilot_net::server_host(network.subnet) {
                Some(server_host) => {
                    let Ok(ip_net) = ipnet::Ipv4Net::new(server_host, 32) else {
                        report.failures.push((network.interface.clone(), "invalid server address".to_string()));
                        continue;
                    };
                    let cfg = DeviceConfig {
                        name: network.interface.clone(),
                        private_key: network.private_key.clone(),
                        listen_port: network.listen_port,
                        addresses: vec![AllowedIp::from_net(IpNet::V4(ip_net))],
                        peers: Vec::new(),
                        mtu: None,
                    };
                    match self.wg.create_interface(&cfg).await {
                        Ok(()) => {
                            info!(interface = %network.interface, "reconciler recreated missing interface");
                            report.interfaces_created.push(network.interface.clone());
                        }
                        Err(e) => {
                            warn!(interface = %network.interface, error = %e, "reconciler failed to recreate interface");
                            report.failures.push((network.interface.clone(), e.to_string()));
                        }
                    }
                }
                None => {
                    report.failures.push((network.interface.clone(), format!("subnet {} has no usable host", network.subnet)));
                }
            }
        }

        for network in &enabled {
            let peers = match self.store.list_peers_by_network(network.id, correlation_id).await {
                Ok(p) => p,
                Err(e) => {
                    report.failures.push((network.interface.clone(), e.to_string()));
                    continue;
                }
            };

            let mut target_peers = Vec::new();
            let mut build_failed = false;
            for peer in peers.into_iter().filter(|p| p.enabled) {
                match build_peer_config(
                    peer.public_key,
                    peer.preshared_key.clone(),
                    &peer.allowed_ips,
                    peer.endpoint.as_deref(),
                    peer.persistent_keepalive,
                ) {
                    Ok(cfg) => target_peers.push(cfg),
                    Err(e) => {
                        build_failed = true;
                        report.failures.push((network.interface.clone(), format!("peer {}: {e}", peer.id)));
                    }
                }
            }
            if build_failed {
                continue;
            }

            let Some(server_host) = wgpilot_net::server_host(network.subnet) else {
                continue;
            };
            let Ok(ip_net) = ipnet::Ipv4Net::new(server_host, 32) else {
                continue;
            };
            let target = DeviceConfig {
                name: network.interface.clone(),
                private_key: network.private_key.clone(),
                listen_port: network.listen_port,
                addresses: vec![AllowedIp::from_net(IpNet::V4(ip_net))],
                peers: target_peers,
                mtu: None,
            };

            let current = self.wg.current_config(&network.interface).await.ok().flatten();
            if current.as_ref() == Some(&target) {
                continue;
            }
            match self.wg.configure_device(&target).await {
                Ok(()) => {
                    info!(interface = %network.interface, "reconciler reapplied peer set");
                    report.peer_sets_reapplied.push(network.interface.clone());
                }
                Err(e) => {
                    warn!(interface = %network.interface, error = %e, "reconciler failed to reapply peer set");
                    report.failures.push((network.interface.clone(), e.to_string()));
                }
            }
        }

        let target_rules = self.derive_target_rules(&enabled, correlation_id).await;
        if let Err(e) = self.firewall.reconcile(target_rules).await {
            warn!(error = %e, "reconciler failed to reapply firewall rules");
            report.failures.push(("firewall".to_string(), e.to_string()));
        } else {
            info!("reconciler reapplied firewall rules from store flags");
        }

        report
    }

    async fn derive_target_rules(&self, enabled: &[&Network], correlation_id: &str) -> Vec<ManagedRule> {
        let mut rules = Vec::new();
        for network in enabled {
            if network.nat_enabled {
                rules.push(ManagedRule::NatMasquerade {
                    iface: network.interface.clone(),
                    subnet: network.subnet,
                });
            }
            if network.inter_peer_routing {
                rules.push(ManagedRule::InterPeerForward {
                    iface: network.interface.clone(),
                });
            }
        }

        let mut seen_bridges = HashSet::new();
        for network in enabled {
            let bridges: Vec<Bridge> = self
                .store
                .list_bridges_by_network(network.id, correlation_id)
                .await
                .unwrap_or_default();
            for bridge in bridges {
                if !bridge.enabled || !seen_bridges.insert(bridge.id) {
                    continue;
                }
                let other_id = if bridge.network_a_id == network.id { bridge.network_b_id } else { bridge.network_a_id };
                let Some(other) = enabled.iter().find(|n| n.id == other_id) else {
                    continue;
                };
                let (iface_a, iface_b) = if bridge.network_a_id == network.id {
                    (network.interface.clone(), other.interface.clone())
                } else {
                    (other.interface.clone(), network.interface.clone())
                };
                rules.push(ManagedRule::BridgeForward {
                    iface_a,
                    iface_b,
                    direction: to_fw_direction(bridge.direction),
                    allowed_cidrs: non_empty(&bridge.allowed_cidrs),
                });
            }
        }
        rules
    }
}
