//! The Orchestrator: staged, compensating coordination across the
//! Store, the WireGuard driver, and the Firewall driver for every
//! mutating operation (spec.md §4.6).
//!
//! Every staged operation follows the same shape: perform driver-level
//! side effects first, track what has actually been applied, and if a
//! later step fails, unwind the applied steps in LIFO order before
//! surfacing the original error. The Store write is always the final,
//! authoritative step — a failure there is the only case that triggers
//! a driver-side rollback, since everything before it was already
//! committed to the kernel.

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::{IpNet, Ipv4Net};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use wgpilot_firewall::{Applier, Direction as FwDirection, FirewallDriver};
use wgpilot_net::next_free_host;
use wgpilot_store::types::{
    Bridge, BridgeDirection, BridgeUpdate, Network, NetworkMode, NetworkUpdate, NewBridge,
    NewNetwork, NewPeer, Peer, PeerRole, PeerUpdate,
};
use wgpilot_store::Store;
use wgpilot_wireguard::{generate_keypair, AllowedIp, DeviceConfig, Endpoint, PeerConfig, PresharedKey, PublicKey, WireGuardDriver};

use crate::error::{ConflictContext, Result, WgpilotError};
use crate::validation::{validate_allowed_cidrs, validate_new_bridge, validate_new_network, validate_new_peer};

/// Driver-call budget, per spec.md §5 ("timeouts default to 30s for
/// driver operations").
const DRIVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a caller supplies to create a network; the interface
/// name and key pair are generated by the Orchestrator itself.
#[derive(Debug, Clone)]
pub struct NewNetworkRequest {
    /// Display name.
    pub name: String,
    /// Topology mode.
    pub mode: NetworkMode,
    /// Private IPv4 subnet, within RFC1918, /16 to /30.
    pub subnet: Ipv4Net,
    /// UDP listen port.
    pub listen_port: u16,
    /// Comma-separated DNS servers pushed to peers.
    pub dns_servers: String,
    /// Whether to install a masquerade rule for this interface.
    pub nat_enabled: bool,
    /// Whether to enable inter-peer forwarding on this interface.
    pub inter_peer_routing: bool,
}

/// Everything a caller supplies to create a peer; `allowedIPs` is
/// computed server-side from the network's subnet (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct NewPeerRequest {
    /// Display name.
    pub name: String,
    /// Optional contact email.
    pub email: Option<String>,
    /// Client or site-gateway.
    pub role: PeerRole,
    /// Comma-separated site-network CIDRs; must be empty for `role =
    /// client`.
    pub site_networks: String,
    /// Optional `host:port` endpoint.
    pub endpoint: Option<String>,
    /// Persistent keepalive interval in seconds.
    pub persistent_keepalive: Option<u16>,
}

/// Everything a caller supplies to create or update a bridge, before
/// ascending-id normalization.
#[derive(Debug, Clone)]
pub struct NewBridgeRequest {
    /// First network in the caller's order.
    pub network_a_id: i64,
    /// Second network in the caller's order.
    pub network_b_id: i64,
    /// Direction, relative to `(network_a_id, network_b_id)` as given.
    pub direction: BridgeDirection,
    /// Optional comma-separated CIDR allow-list.
    pub allowed_cidrs: String,
}

/// Coordinates mutating operations across the Store and the two kernel
/// drivers. One instance is constructed at process start and shared by
/// every request handler and the Setup State Machine.
pub struct Orchestrator<W, A>
where
    W: WireGuardDriver,
    A: Applier,
{
    store: Store,
    wg: Arc<W>,
    firewall: Arc<FirewallDriver<A>>,
    /// Per-network mutexes serializing mutation within one network
    /// (spec.md §5: "mutations within a single Network are totally
    /// ordered by the per-network mutex"). The outer map is a plain sync
    /// lock since acquiring or inserting an entry never awaits.
    network_locks: SyncMutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
    /// Serializes the "pick the lowest unused wgN interface name" step
    /// of Create Network against itself, so two concurrent creations
    /// never race onto the same index.
    interface_lock: AsyncMutex<()>,
}

impl<W, A> Orchestrator<W, A>
where
    W: WireGuardDriver,
    A: Applier,
{
    /// Construct an Orchestrator over an opened Store and the two
    /// driver instances injected at process start.
    pub fn new(store: Store, wg: Arc<W>, firewall: Arc<FirewallDriver<A>>) -> Self {
        Self {
            store,
            wg,
            firewall,
            network_locks: SyncMutex::new(HashMap::new()),
            interface_lock: AsyncMutex::new(()),
        }
    }

    /// Borrow the underlying Store, for callers (the Monitor, the
    /// Reconciler, the Setup State Machine) that share it rather than
    /// opening a second handle.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Borrow the WireGuard driver.
    #[must_use]
    pub fn wireguard(&self) -> &Arc<W> {
        &self.wg
    }

    /// Borrow the firewall driver.
    #[must_use]
    pub fn firewall(&self) -> &Arc<FirewallDriver<A>> {
        &self.firewall
    }

    fn network_lock(&self, id: i64) -> Arc<AsyncMutex<()>> {
        self.network_locks.lock().entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    async fn guard_driver<T>(
        cancel: &CancellationToken,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(WgpilotError::InternalError("operation cancelled".to_string())),
            res = tokio::time::timeout(DRIVER_TIMEOUT, fut) => {
                res.unwrap_or_else(|_| Err(WgpilotError::InternalError("driver operation timed out".to_string())))
            }
        }
    }

    // ---------------------------------------------------------------
    // Networks
    // ---------------------------------------------------------------

    /// Create a network: validate, pick the lowest free `wgN` interface
    /// name, generate a key pair, bring up the kernel device and
    /// firewall rules, then persist. Any failure from step 2 onward
    /// unwinds the already-applied steps in LIFO order.
    #[instrument(skip(self, cancel), fields(correlation_id))]
    pub async fn create_network(
        &self,
        req: NewNetworkRequest,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Network> {
        validate_new_network(&req)?;

        let _iface_guard = self.interface_lock.lock().await;
        self.check_network_conflicts(&req, correlation_id).await?;
        let interface = self.next_free_interface(correlation_id).await?;

        let keypair = generate_keypair();
        let server_host = wgpilot_net::server_host(req.subnet)
            .ok_or_else(|| WgpilotError::ValidationError(format!("subnet {} has no usable host", req.subnet)))?;
        let address = AllowedIp::from_net(IpNet::V4(
            Ipv4Net::new(server_host, 32).map_err(|e| WgpilotError::ValidationError(e.to_string()))?,
        ));
        let device_cfg = DeviceConfig {
            name: interface.clone(),
            private_key: keypair.private.clone(),
            listen_port: req.listen_port,
            addresses: vec![address],
            peers: Vec::new(),
            mtu: None,
        };

        let mut nat_applied = false;
        let mut inter_peer_applied = false;

        let result: Result<Network> = async {
            Self::guard_driver(cancel, async {
                self.wg.create_interface(&device_cfg).await.map_err(WgpilotError::from)
            })
            .await?;

            if req.nat_enabled {
                Self::guard_driver(cancel, async {
                    self.firewall.add_nat_masquerade(&interface, req.subnet).await.map_err(WgpilotError::from)
                })
                .await?;
                nat_applied = true;
            }

            if req.inter_peer_routing {
                Self::guard_driver(cancel, async {
                    self.firewall.enable_inter_peer_forwarding(&interface).await.map_err(WgpilotError::from)
                })
                .await?;
                inter_peer_applied = true;
            }

            let new = NewNetwork {
                name: req.name.clone(),
                interface: interface.clone(),
                mode: req.mode,
                subnet: req.subnet,
                listen_port: req.listen_port,
                private_key: keypair.private.clone(),
                public_key: keypair.public,
                dns_servers: req.dns_servers.clone(),
                nat_enabled: req.nat_enabled,
                inter_peer_routing: req.inter_peer_routing,
            };
            self.store
                .create_network(&new, now(), correlation_id)
                .await
                .map_err(|e| WgpilotError::from_store_conflict(e, ConflictContext::Network))
        }
        .await;

        if let Err(ref err) = result {
            warn!(interface = %interface, error = %err, "create_network failed, rolling back applied steps");
            if inter_peer_applied {
                let _ = self.firewall.disable_inter_peer_forwarding(&interface).await;
            }
            if nat_applied {
                let _ = self.firewall.remove_nat_masquerade(&interface).await;
            }
            let _ = self.wg.delete_interface(&interface).await;
        } else {
            info!(interface = %interface, "created network");
        }
        result
    }

    /// Update a network's mutable fields. Topology fields (mode,
    /// subnet, listen port) are immutable after creation — only the
    /// flags spec.md §3 calls out as "mutated by config edits" can
    /// change here, and each flag change re-derives the corresponding
    /// firewall rule.
    #[instrument(skip(self, cancel))]
    pub async fn update_network(
        &self,
        id: i64,
        patch: NetworkUpdate,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Network> {
        let lock = self.network_lock(id);
        let _guard = lock.lock().await;

        let before = self.store.get_network(id, correlation_id).await?.ok_or(WgpilotError::NetworkNotFound)?;

        let updated = self
            .store
            .update_network(id, &patch, now(), correlation_id)
            .await
            .map_err(|e| WgpilotError::from_store_conflict(e, ConflictContext::Network))?
            .ok_or(WgpilotError::NetworkNotFound)?;

        if updated.nat_enabled != before.nat_enabled {
            let outcome = if updated.nat_enabled {
                Self::guard_driver(cancel, async {
                    self.firewall.add_nat_masquerade(&updated.interface, updated.subnet).await.map_err(WgpilotError::from)
                })
                .await
            } else {
                Self::guard_driver(cancel, async {
                    self.firewall.remove_nat_masquerade(&updated.interface).await.map_err(WgpilotError::from)
                })
                .await
            };
            if let Err(err) = outcome {
                warn!(network_id = id, error = %err, "failed to apply nat_enabled change");
            }
        }

        if updated.inter_peer_routing != before.inter_peer_routing {
            let outcome = if updated.inter_peer_routing {
                Self::guard_driver(cancel, async {
                    self.firewall.enable_inter_peer_forwarding(&updated.interface).await.map_err(WgpilotError::from)
                })
                .await
            } else {
                Self::guard_driver(cancel, async {
                    self.firewall.disable_inter_peer_forwarding(&updated.interface).await.map_err(WgpilotError::from)
                })
                .await
            };
            if let Err(err) = outcome {
                warn!(network_id = id, error = %err, "failed to apply inter_peer_routing change");
            }
        }

        info!(network_id = id, "updated network");
        Ok(updated)
    }

    /// Delete a network. Every clean-up step is best-effort and
    /// proceeds even if an earlier one failed; the Store delete
    /// (cascading to peers, bridges, and snapshots) is the final
    /// authoritative step.
    #[instrument(skip(self, cancel))]
    pub async fn delete_network(&self, id: i64, correlation_id: &str, cancel: &CancellationToken) -> Result<()> {
        let lock = self.network_lock(id);
        let _guard = lock.lock().await;

        let network = self.store.get_network(id, correlation_id).await?.ok_or(WgpilotError::NetworkNotFound)?;

        let bridges = self.store.list_bridges_by_network(id, correlation_id).await?;
        for bridge in &bridges {
            let other_id = if bridge.network_a_id == id { bridge.network_b_id } else { bridge.network_a_id };
            if let Ok(Some(other)) = self.store.get_network(other_id, correlation_id).await {
                if let Err(err) = self.firewall.remove_bridge(&network.interface, &other.interface).await {
                    warn!(network_id = id, bridge_id = bridge.id, error = %err, "failed to remove bridge rule during network delete");
                }
            }
        }

        if let Err(err) = Self::guard_driver(cancel, async {
            self.firewall.remove_nat_masquerade(&network.interface).await.map_err(WgpilotError::from)
        })
        .await
        {
            warn!(network_id = id, error = %err, "failed to remove nat rule during network delete");
        }
        if let Err(err) = Self::guard_driver(cancel, async {
            self.firewall.disable_inter_peer_forwarding(&network.interface).await.map_err(WgpilotError::from)
        })
        .await
        {
            warn!(network_id = id, error = %err, "failed to remove inter-peer rule during network delete");
        }
        if let Err(err) = Self::guard_driver(cancel, async {
            self.wg.delete_interface(&network.interface).await.map_err(WgpilotError::from)
        })
        .await
        {
            warn!(network_id = id, error = %err, "failed to delete kernel interface during network delete");
        }

        let removed = self.store.delete_network(id, correlation_id).await?;
        if !removed {
            return Err(WgpilotError::NetworkNotFound);
        }
        info!(network_id = id, "deleted network");
        Ok(())
    }

    async fn check_network_conflicts(&self, req: &NewNetworkRequest, correlation_id: &str) -> Result<()> {
        for existing in self.store.list_networks(correlation_id).await? {
            if existing.listen_port == req.listen_port {
                return Err(WgpilotError::PortInUse);
            }
            if existing.subnet == req.subnet || existing.subnet.contains(&req.subnet.network()) || req.subnet.contains(&existing.subnet.network())
            {
                return Err(WgpilotError::SubnetConflict);
            }
        }
        Ok(())
    }

    async fn next_free_interface(&self, correlation_id: &str) -> Result<String> {
        let existing = self.store.list_networks(correlation_id).await?;
        let used: BTreeSet<u32> = existing
            .iter()
            .filter_map(|n| n.interface.strip_prefix("wg").and_then(|idx| idx.parse::<u32>().ok()))
            .collect();
        let mut index = 0u32;
        while used.contains(&index) {
            index += 1;
        }
        Ok(format!("wg{index}"))
    }

    // ---------------------------------------------------------------
    // Peers
    // ---------------------------------------------------------------

    /// Create a peer. Allocates the next free host address from the
    /// network's subnet under the network's mutex, generates key
    /// material, pushes the peer to the kernel, then persists.
    #[instrument(skip(self, cancel))]
    pub async fn create_peer(
        &self,
        network_id: i64,
        req: NewPeerRequest,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Peer> {
        validate_new_peer(&req)?;

        let lock = self.network_lock(network_id);
        let _guard = lock.lock().await;

        let network = self.store.get_network(network_id, correlation_id).await?.ok_or(WgpilotError::NetworkNotFound)?;

        let used_csv = self.store.peer_allowed_ips_in_use(network_id, correlation_id).await?;
        let used: BTreeSet<Ipv4Addr> = used_csv.iter().filter_map(|csv| host_address_of(csv)).collect();
        let host = next_free_host(network.subnet, &used)?;

        let keypair = generate_keypair();
        let preshared_key = PresharedKey::generate();

        let mut allowed_ips = format!("{host}/32");
        if req.role == PeerRole::SiteGateway && !req.site_networks.trim().is_empty() {
            allowed_ips.push(',');
            allowed_ips.push_str(req.site_networks.trim());
        }

        let peer_cfg = build_peer_config(keypair.public, Some(preshared_key.clone()), &allowed_ips, req.endpoint.as_deref(), req.persistent_keepalive)?;

        Self::guard_driver(cancel, async {
            self.wg.add_peer(&network.interface, peer_cfg).await.map_err(WgpilotError::from)
        })
        .await?;

        let new = NewPeer {
            network_id,
            name: req.name.clone(),
            email: req.email.clone(),
            private_key: keypair.private,
            public_key: keypair.public,
            preshared_key: Some(preshared_key),
            allowed_ips,
            endpoint: req.endpoint.clone(),
            persistent_keepalive: req.persistent_keepalive,
            role: req.role,
            site_networks: req.site_networks.clone(),
        };

        match self.store.create_peer(&new, now(), correlation_id).await {
            Ok(peer) => {
                info!(network_id, peer_id = peer.id, "created peer");
                Ok(peer)
            }
            Err(err) => {
                warn!(network_id, error = %err, "create_peer store write failed, removing kernel peer");
                let _ = self.wg.remove_peer(&network.interface, &keypair.public).await;
                Err(err.into())
            }
        }
    }

    /// Update a peer's mutable fields, re-pushing the peer's full
    /// configuration to the kernel when any driver-visible field
    /// changes (endpoint, keepalive, allowed IPs, or enabled state).
    #[instrument(skip(self, cancel))]
    pub async fn update_peer(
        &self,
        peer_id: i64,
        patch: PeerUpdate,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Peer> {
        let before = self.store.get_peer(peer_id, correlation_id).await?.ok_or(WgpilotError::PeerNotFound)?;
        let lock = self.network_lock(before.network_id);
        let _guard = lock.lock().await;

        let network = self
            .store
            .get_network(before.network_id, correlation_id)
            .await?
            .ok_or(WgpilotError::NetworkNotFound)?;

        if let Some(allowed_ips) = &patch.allowed_ips {
            validate_allowed_cidrs(allowed_ips)?;
        }

        let updated = self
            .store
            .update_peer(peer_id, &patch, now(), correlation_id)
            .await?
            .ok_or(WgpilotError::PeerNotFound)?;

        let driver_fields_changed = updated.allowed_ips != before.allowed_ips
            || updated.endpoint != before.endpoint
            || updated.persistent_keepalive != before.persistent_keepalive
            || updated.enabled != before.enabled;

        if driver_fields_changed {
            let outcome: Result<()> = if updated.enabled {
                let cfg = build_peer_config(
                    updated.public_key,
                    updated.preshared_key.clone(),
                    &updated.allowed_ips,
                    updated.endpoint.as_deref(),
                    updated.persistent_keepalive,
                )?;
                Self::guard_driver(cancel, async {
                    if before.enabled {
                        self.wg.update_peer(&network.interface, cfg).await.map_err(WgpilotError::from)
                    } else {
                        self.wg.add_peer(&network.interface, cfg).await.map_err(WgpilotError::from)
                    }
                })
                .await
            } else {
                Self::guard_driver(cancel, async {
                    self.wg.remove_peer(&network.interface, &updated.public_key).await.map_err(WgpilotError::from)
                })
                .await
            };
            if let Err(err) = outcome {
                warn!(peer_id, error = %err, "failed to push peer update to kernel; store and kernel may now differ until next reconcile");
            }
        }

        info!(peer_id, "updated peer");
        Ok(updated)
    }

    /// Delete a peer. On Store failure, re-adds the peer to the kernel
    /// device to compensate for the already-applied removal.
    #[instrument(skip(self, cancel))]
    pub async fn delete_peer(&self, peer_id: i64, correlation_id: &str, cancel: &CancellationToken) -> Result<()> {
        let peer = self.store.get_peer(peer_id, correlation_id).await?.ok_or(WgpilotError::PeerNotFound)?;
        let lock = self.network_lock(peer.network_id);
        let _guard = lock.lock().await;

        let network = self
            .store
            .get_network(peer.network_id, correlation_id)
            .await?
            .ok_or(WgpilotError::NetworkNotFound)?;

        Self::guard_driver(cancel, async {
            match self.wg.remove_peer(&network.interface, &peer.public_key).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(WgpilotError::from(e)),
            }
        })
        .await?;

        let removed = self.store.delete_peer(peer_id, correlation_id).await;
        match removed {
            Ok(true) => {
                info!(peer_id, "deleted peer");
                Ok(())
            }
            Ok(false) => Err(WgpilotError::PeerNotFound),
            Err(err) => {
                warn!(peer_id, error = %err, "delete_peer store write failed, re-adding kernel peer");
                if let Ok(cfg) = build_peer_config(
                    peer.public_key,
                    peer.preshared_key.clone(),
                    &peer.allowed_ips,
                    peer.endpoint.as_deref(),
                    peer.persistent_keepalive,
                ) {
                    let _ = self.wg.add_peer(&network.interface, cfg).await;
                }
                Err(err.into())
            }
        }
    }

    // ---------------------------------------------------------------
    // Bridges
    // ---------------------------------------------------------------

    /// Create a bridge. Normalizes the network pair to ascending id
    /// order (flipping direction if needed) and always acquires both
    /// network locks in that same ascending order, so a concurrent
    /// bridge creation between the same two networks in the opposite
    /// caller order can never deadlock (spec.md §5).
    #[instrument(skip(self, cancel))]
    pub async fn create_bridge(
        &self,
        req: NewBridgeRequest,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Bridge> {
        validate_new_bridge(&req)?;
        let (lo, hi, direction) = normalize_pair(req.network_a_id, req.network_b_id, req.direction);

        let lock_lo = self.network_lock(lo);
        let _guard_lo = lock_lo.lock().await;
        let lock_hi = self.network_lock(hi);
        let _guard_hi = lock_hi.lock().await;

        let net_lo = self.store.get_network(lo, correlation_id).await?.ok_or(WgpilotError::NetworkNotFound)?;
        let net_hi = self.store.get_network(hi, correlation_id).await?.ok_or(WgpilotError::NetworkNotFound)?;

        if self.store.get_bridge_by_pair(lo, hi, correlation_id).await?.is_some() {
            return Err(WgpilotError::BridgeAlreadyExists);
        }

        Self::guard_driver(cancel, async {
            self.firewall
                .add_bridge(&net_lo.interface, &net_hi.interface, to_fw_direction(direction), non_empty(&req.allowed_cidrs))
                .await
                .map_err(WgpilotError::from)
        })
        .await?;

        let new = NewBridge {
            network_a_id: lo,
            network_b_id: hi,
            direction,
            allowed_cidrs: req.allowed_cidrs.clone(),
        };

        match self.store.create_bridge(&new, now(), correlation_id).await {
            Ok(bridge) => {
                info!(bridge_id = bridge.id, network_a_id = lo, network_b_id = hi, "created bridge");
                Ok(bridge)
            }
            Err(err) => {
                warn!(network_a_id = lo, network_b_id = hi, error = %err, "create_bridge store write failed, removing firewall rule");
                let _ = self.firewall.remove_bridge(&net_lo.interface, &net_hi.interface).await;
                Err(WgpilotError::from_store_conflict(err, ConflictContext::Bridge))
            }
        }
    }

    /// Update a bridge's direction, CIDR allow-list, or enabled flag.
    #[instrument(skip(self, cancel))]
    pub async fn update_bridge(
        &self,
        bridge_id: i64,
        patch: BridgeUpdate,
        correlation_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Bridge> {
        if let Some(cidrs) = &patch.allowed_cidrs {
            validate_allowed_cidrs(cidrs)?;
        }

        let before = self.store.get_bridge(bridge_id, correlation_id).await?.ok_or(WgpilotError::BridgeNotFound)?;
        let (lo, hi) = (before.network_a_id, before.network_b_id);

        let lock_lo = self.network_lock(lo);
        let _guard_lo = lock_lo.lock().await;
        let lock_hi = self.network_lock(hi);
        let _guard_hi = lock_hi.lock().await;

        let net_lo = self.store.get_network(lo, correlation_id).await?.ok_or(WgpilotError::NetworkNotFound)?;
        let net_hi = self.store.get_network(hi, correlation_id).await?.ok_or(WgpilotError::NetworkNotFound)?;

        let updated = self
            .store
            .update_bridge(bridge_id, &patch, now(), correlation_id)
            .await?
            .ok_or(WgpilotError::BridgeNotFound)?;

        let outcome: Result<()> = if updated.enabled {
            Self::guard_driver(cancel, async {
                self.firewall
                    .update_bridge(&net_lo.interface, &net_hi.interface, to_fw_direction(updated.direction), non_empty(&updated.allowed_cidrs))
                    .await
                    .map_err(WgpilotError::from)
            })
            .await
        } else {
            Self::guard_driver(cancel, async {
                self.firewall.remove_bridge(&net_lo.interface, &net_hi.interface).await.map_err(WgpilotError::from)
            })
            .await
        };
        if let Err(err) = outcome {
            warn!(bridge_id, error = %err, "failed to apply bridge update to firewall");
        }

        info!(bridge_id, "updated bridge");
        Ok(updated)
    }

    /// Delete a bridge. On Store failure, re-adds the firewall rule to
    /// compensate for the already-applied removal.
    #[instrument(skip(self, cancel))]
    pub async fn delete_bridge(&self, bridge_id: i64, correlation_id: &str, cancel: &CancellationToken) -> Result<()> {
        let bridge = self.store.get_bridge(bridge_id, correlation_id).await?.ok_or(WgpilotError::BridgeNotFound)?;
        let (lo, hi) = (bridge.network_a_id, bridge.network_b_id);

        let lock_lo = self.network_lock(lo);
        let _guard_lo = lock_lo.lock().await;
        let lock_hi = self.network_lock(hi);
        let _guard_hi = lock_hi.lock().await;

        let net_lo = self.store.get_network(lo, correlation_id).await?.ok_or(WgpilotError::NetworkNotFound)?;
        let net_hi = self.store.get_network(hi, correlation_id).await?.ok_or(WgpilotError::NetworkNotFound)?;

        Self::guard_driver(cancel, async {
            self.firewall.remove_bridge(&net_lo.interface, &net_hi.interface).await.map_err(WgpilotError::from)
        })
        .await?;

        match self.store.delete_bridge(bridge_id, correlation_id).await {
            Ok(true) => {
                info!(bridge_id, "deleted bridge");
                Ok(())
            }
            Ok(false) => Err(WgpilotError::BridgeNotFound),
            Err(err) => {
                warn!(bridge_id, error = %err, "delete_bridge store write failed, re-adding firewall rule");
                let _ = self
                    .firewall
                    .add_bridge(&net_lo.interface, &net_hi.interface, to_fw_direction(bridge.direction), non_empty(&bridge.allowed_cidrs))
                    .await;
                Err(err.into())
            }
        }
    }
}

fn normalize_pair(a: i64, b: i64, direction: BridgeDirection) -> (i64, i64, BridgeDirection) {
    if a <= b {
        (a, b, direction)
    } else {
        let flipped = match direction {
            BridgeDirection::AToB => BridgeDirection::BToA,
            BridgeDirection::BToA => BridgeDirection::AToB,
            BridgeDirection::Bidirectional => BridgeDirection::Bidirectional,
        };
        (b, a, flipped)
    }
}

pub(crate) fn to_fw_direction(direction: BridgeDirection) -> FwDirection {
    match direction {
        BridgeDirection::AToB => FwDirection::AToB,
        BridgeDirection::BToA => FwDirection::BToA,
        BridgeDirection::Bidirectional => FwDirection::Bidirectional,
    }
}

pub(crate) fn non_empty(cidrs: &str) -> Option<String> {
    let trimmed = cidrs.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Pull the single `/32` host address out of a peer's full `allowedIPs`
/// CSV, ignoring any site-network CIDRs alongside it.
fn host_address_of(allowed_ips: &str) -> Option<Ipv4Addr> {
    allowed_ips.split(',').map(str::trim).find_map(|entry| {
        let net: Ipv4Net = entry.parse().ok()?;
        (net.prefix_len() == 32).then(|| net.network())
    })
}

pub(crate) fn build_peer_config(
    public_key: PublicKey,
    preshared_key: Option<PresharedKey>,
    allowed_ips: &str,
    endpoint: Option<&str>,
    persistent_keepalive: Option<u16>,
) -> Result<PeerConfig> {
    let mut cfg = PeerConfig::new(public_key);
    if let Some(psk) = preshared_key {
        cfg = cfg.with_preshared_key(psk);
    }
    for entry in allowed_ips.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let ip: AllowedIp = entry.parse().map_err(WgpilotError::from)?;
        cfg = cfg.with_allowed_ip(ip);
    }
    if let Some(ep) = endpoint {
        let parsed: Endpoint = ep.parse().map_err(WgpilotError::from)?;
        cfg = cfg.with_endpoint(parsed);
    }
    if let Some(keepalive) = persistent_keepalive {
        cfg = cfg.with_persistent_keepalive(keepalive);
    }
    Ok(cfg)
}

pub(crate) fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpilot_firewall::FakeApplier;
    use wgpilot_store::test_support::temp_store;
    use wgpilot_wireguard::FakeWireGuardDriver;

    // Leaks the backing temp file's handle for the duration of the test
    // process rather than threading it through every test body; each
    // test opens its own file so this never accumulates meaningfully.
    async fn fresh_orchestrator() -> Orchestrator<FakeWireGuardDriver, FakeApplier> {
        let (store, guard) = temp_store().await;
        Box::leak(Box::new(guard));
        Orchestrator::new(store, Arc::new(FakeWireGuardDriver::new()), Arc::new(FirewallDriver::new(FakeApplier::new())))
    }

    fn gateway_request(port: u16, subnet: &str) -> NewNetworkRequest {
        NewNetworkRequest {
            name: "Home VPN".to_string(),
            mode: NetworkMode::Gateway,
            subnet: subnet.parse().expect("valid cidr"),
            listen_port: port,
            dns_servers: String::new(),
            nat_enabled: true,
            inter_peer_routing: false,
        }
    }

    #[tokio::test]
    async fn seed_scenario_1_create_network_assigns_wg0_and_nat_rule() {
        let orch = fresh_orchestrator().await;
        let cancel = CancellationToken::new();
        let network = orch
            .create_network(gateway_request(51820, "10.0.0.0/24"), "test", &cancel)
            .await
            .expect("create network");
        assert_eq!(network.interface, "wg0");
        let keys = orch.firewall().rule_keys().await;
        assert_eq!(keys, vec!["nat:wg0".to_string()]);
    }

    #[tokio::test]
    async fn second_network_gets_wg1() {
        let orch = fresh_orchestrator().await;
        let cancel = CancellationToken::new();
        orch.create_network(gateway_request(51820, "10.0.0.0/24"), "t1", &cancel).await.expect("first");
        let second = orch
            .create_network(gateway_request(51821, "10.1.0.0/24"), "t2", &cancel)
            .await
            .expect("second");
        assert_eq!(second.interface, "wg1");
    }

    #[tokio::test]
    async fn duplicate_listen_port_is_rejected() {
        let orch = fresh_orchestrator().await;
        let cancel = CancellationToken::new();
        orch.create_network(gateway_request(51820, "10.0.0.0/24"), "t1", &cancel).await.expect("first");
        let err = orch
            .create_network(gateway_request(51820, "10.1.0.0/24"), "t2", &cancel)
            .await
            .expect_err("duplicate port must be rejected");
        assert_eq!(err.code(), "port-in-use");
    }

    #[tokio::test]
    async fn seed_scenario_2_peers_get_sequential_host_addresses() {
        let orch = fresh_orchestrator().await;
        let cancel = CancellationToken::new();
        let network = orch.create_network(gateway_request(51820, "10.0.0.0/24"), "t", &cancel).await.expect("network");

        let peer_req = || NewPeerRequest {
            name: "Phone".to_string(),
            email: None,
            role: PeerRole::Client,
            site_networks: String::new(),
            endpoint: None,
            persistent_keepalive: None,
        };
        let first = orch.create_peer(network.id, peer_req(), "t", &cancel).await.expect("first peer");
        assert_eq!(first.allowed_ips, "10.0.0.2/32");
        let second = orch.create_peer(network.id, peer_req(), "t", &cancel).await.expect("second peer");
        assert_eq!(second.allowed_ips, "10.0.0.3/32");
    }

    #[tokio::test]
    async fn seed_scenario_3_pool_exhaustion_on_slash_30() {
        let orch = fresh_orchestrator().await;
        let cancel = CancellationToken::new();
        let network = orch
            .create_network(gateway_request(51820, "10.0.0.0/30"), "t", &cancel)
            .await
            .expect("network");

        let peer_req = || NewPeerRequest {
            name: "Phone".to_string(),
            email: None,
            role: PeerRole::Client,
            site_networks: String::new(),
            endpoint: None,
            persistent_keepalive: None,
        };
        let first = orch.create_peer(network.id, peer_req(), "t", &cancel).await.expect("first peer fits");
        assert_eq!(first.allowed_ips, "10.0.0.2/32");
        let err = orch.create_peer(network.id, peer_req(), "t", &cancel).await.expect_err("pool exhausted");
        assert_eq!(err.code(), "ip-pool-exhausted");
    }

    #[tokio::test]
    async fn seed_scenario_4_and_5_bridge_dedup_and_cascade() {
        let orch = fresh_orchestrator().await;
        let cancel = CancellationToken::new();
        let a = orch.create_network(gateway_request(51820, "10.0.0.0/24"), "t", &cancel).await.expect("network a");
        let b = orch.create_network(gateway_request(51821, "10.1.0.0/24"), "t", &cancel).await.expect("network b");

        let bridge = orch
            .create_bridge(
                NewBridgeRequest {
                    network_a_id: a.id,
                    network_b_id: b.id,
                    direction: BridgeDirection::Bidirectional,
                    allowed_cidrs: String::new(),
                },
                "t",
                &cancel,
            )
            .await
            .expect("create bridge");
        assert_eq!(orch.firewall().rule_keys().await, vec!["bridge:wg0:wg1".to_string()]);

        let err = orch
            .create_bridge(
                NewBridgeRequest {
                    network_a_id: b.id,
                    network_b_id: a.id,
                    direction: BridgeDirection::AToB,
                    allowed_cidrs: String::new(),
                },
                "t",
                &cancel,
            )
            .await
            .expect_err("reversed duplicate pair must be rejected");
        assert_eq!(err.code(), "bridge-already-exists");

        orch.delete_network(a.id, "t", &cancel).await.expect("delete network a");
        assert!(orch.firewall().rule_keys().await.is_empty());
        assert!(orch.store().get_bridge(bridge.id, "t").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn site_gateway_peer_keeps_site_networks_in_allowed_ips() {
        let orch = fresh_orchestrator().await;
        let cancel = CancellationToken::new();
        let network = orch.create_network(gateway_request(51820, "10.0.0.0/24"), "t", &cancel).await.expect("network");
        let peer = orch
            .create_peer(
                network.id,
                NewPeerRequest {
                    name: "Branch".to_string(),
                    email: None,
                    role: PeerRole::SiteGateway,
                    site_networks: "192.168.50.0/24".to_string(),
                    endpoint: None,
                    persistent_keepalive: None,
                },
                "t",
                &cancel,
            )
            .await
            .expect("create site gateway peer");
        assert_eq!(peer.allowed_ips, "10.0.0.2/32,192.168.50.0/24");
    }

    #[tokio::test]
    async fn delete_peer_removes_kernel_and_store_state() {
        let orch = fresh_orchestrator().await;
        let cancel = CancellationToken::new();
        let network = orch.create_network(gateway_request(51820, "10.0.0.0/24"), "t", &cancel).await.expect("network");
        let peer = orch
            .create_peer(
                network.id,
                NewPeerRequest {
                    name: "Phone".to_string(),
                    email: None,
                    role: PeerRole::Client,
                    site_networks: String::new(),
                    endpoint: None,
                    persistent_keepalive: None,
                },
                "t",
                &cancel,
            )
            .await
            .expect("create peer");

        orch.delete_peer(peer.id, "t", &cancel).await.expect("delete peer");
        assert!(orch.store().get_peer(peer.id, "t").await.expect("lookup").is_none());
        let status = orch.wireguard().peer_status(&network.interface).await.expect("status");
        assert!(status.is_empty());
    }
}
