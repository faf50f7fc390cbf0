//! An in-memory `WireGuardDriver` for tests: no kernel, no root, no
//! `CAP_NET_ADMIN`. Mirrors the shape of a real kernel backend closely
//! enough that Orchestrator/Reconciler tests exercise the same code
//! paths a production run would.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::driver::{DeviceController, LinkController, WireGuardDriver};
use crate::error::{Result, WireGuardError};
use crate::keys::PrivateKey;
use crate::types::{AllowedIp, DeviceConfig, InterfaceInfo, PeerStatus};

#[derive(Clone)]
struct FakeInterface {
    config: DeviceConfig,
    link_up: bool,
    /// Per-peer injected handshake/traffic state, keyed by base64 public key.
    peer_state: HashMap<String, (Option<i64>, u64, u64)>,
}

/// An in-memory stand-in for a kernel-backed WireGuard driver.
#[derive(Clone, Default)]
pub struct FakeWireGuardDriver {
    interfaces: Arc<RwLock<HashMap<String, FakeInterface>>>,
}

impl FakeWireGuardDriver {
    /// Construct an empty fake driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a handshake/traffic sample for `peer` on `interface`, as if
    /// the kernel had just reported it. Used by Monitor and Reconciler
    /// tests to drive `peer_status`/`configure_device` without a live
    /// WireGuard device.
    pub async fn simulate_handshake(
        &self,
        interface: &str,
        peer_public_key: &str,
        last_handshake: i64,
        rx_bytes: u64,
        tx_bytes: u64,
    ) {
        let mut guard = self.interfaces.write().await;
        if let Some(iface) = guard.get_mut(interface) {
            iface.peer_state.insert(
                peer_public_key.to_string(),
                (Some(last_handshake), rx_bytes, tx_bytes),
            );
        }
    }

    /// Number of interfaces currently tracked.
    pub async fn interface_count(&self) -> usize {
        self.interfaces.read().await.len()
    }
}

impl DeviceController for FakeWireGuardDriver {
    async fn configure_device(&self, cfg: &DeviceConfig) -> Result<()> {
        let mut guard = self.interfaces.write().await;
        let entry = guard
            .entry(cfg.name.clone())
            .or_insert_with(|| FakeInterface {
                config: cfg.clone(),
                link_up: false,
                peer_state: HashMap::new(),
            });
        entry.config = cfg.clone();
        // Drop peer_state for peers no longer present; keep the rest so
        // handshake history survives an unrelated config update.
        let keep: Vec<String> = cfg.peers.iter().map(|p| p.public_key.to_base64()).collect();
        entry.peer_state.retain(|k, _| keep.contains(k));
        Ok(())
    }

    async fn device(&self, name: &str) -> Result<Option<InterfaceInfo>> {
        let guard = self.interfaces.read().await;
        let Some(iface) = guard.get(name) else {
            return Ok(None);
        };
        let peers = iface
            .config
            .peers
            .iter()
            .map(|p| {
                let (last_handshake, rx_bytes, tx_bytes) = iface
                    .peer_state
                    .get(&p.public_key.to_base64())
                    .copied()
                    .unwrap_or((None, 0, 0));
                PeerStatus {
                    public_key: p.public_key,
                    endpoint: p.endpoint,
                    last_handshake,
                    rx_bytes,
                    tx_bytes,
                }
            })
            .collect();
        Ok(Some(InterfaceInfo {
            name: iface.config.name.clone(),
            public_key: iface.config.private_key.public_key(),
            listen_port: iface.link_up.then_some(iface.config.listen_port),
            addresses: iface.config.addresses.clone(),
            peers,
        }))
    }

    async fn devices(&self) -> Result<Vec<InterfaceInfo>> {
        let names: Vec<String> = self.interfaces.read().await.keys().cloned().collect();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(info) = self.device(&name).await? {
                out.push(info);
            }
        }
        Ok(out)
    }

    async fn close(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

impl LinkController for FakeWireGuardDriver {
    async fn create(&self, name: &str) -> Result<()> {
        let mut guard = self.interfaces.write().await;
        if guard.contains_key(name) {
            return Err(WireGuardError::InterfaceExists(name.to_string()));
        }
        guard.insert(
            name.to_string(),
            FakeInterface {
                config: DeviceConfig {
                    name: name.to_string(),
                    private_key: PrivateKey::generate(),
                    listen_port: 0,
                    addresses: Vec::new(),
                    peers: Vec::new(),
                    mtu: None,
                },
                link_up: false,
                peer_state: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut guard = self.interfaces.write().await;
        if guard.remove(name).is_none() {
            return Err(WireGuardError::InterfaceNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn up(&self, name: &str) -> Result<()> {
        let mut guard = self.interfaces.write().await;
        let iface = guard
            .get_mut(name)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(name.to_string()))?;
        iface.link_up = true;
        Ok(())
    }

    async fn down(&self, name: &str) -> Result<()> {
        let mut guard = self.interfaces.write().await;
        let iface = guard
            .get_mut(name)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(name.to_string()))?;
        iface.link_up = false;
        Ok(())
    }

    async fn add_address(&self, name: &str, cidr: AllowedIp) -> Result<()> {
        let mut guard = self.interfaces.write().await;
        let iface = guard
            .get_mut(name)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(name.to_string()))?;
        if !iface.config.addresses.contains(&cidr) {
            iface.config.addresses.push(cidr);
        }
        Ok(())
    }

    async fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.interfaces.read().await.contains_key(name))
    }
}

impl WireGuardDriver for FakeWireGuardDriver {
    async fn current_config(&self, name: &str) -> Result<Option<DeviceConfig>> {
        Ok(self
            .interfaces
            .read()
            .await
            .get(name)
            .map(|iface| iface.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;
    use crate::types::PeerConfig;

    fn cfg(name: &str) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            private_key: PrivateKey::generate(),
            listen_port: 51820,
            addresses: vec!["10.0.0.1/24".parse().expect("cidr")],
            peers: Vec::new(),
            mtu: Some(1420),
        }
    }

    #[tokio::test]
    async fn create_interface_is_idempotent() {
        let driver = FakeWireGuardDriver::new();
        let c = cfg("wg0");
        driver.create_interface(&c).await.expect("first create");
        driver.create_interface(&c).await.expect("second create is a no-op");
        assert_eq!(driver.interface_count().await, 1);
    }

    #[tokio::test]
    async fn delete_interface_is_idempotent() {
        let driver = FakeWireGuardDriver::new();
        driver.create_interface(&cfg("wg0")).await.expect("create");
        driver.delete_interface("wg0").await.expect("first delete");
        driver.delete_interface("wg0").await.expect("second delete is a no-op");
    }

    #[tokio::test]
    async fn add_peer_then_status_round_trips() {
        let driver = FakeWireGuardDriver::new();
        driver.create_interface(&cfg("wg0")).await.expect("create");

        let peer_key = PrivateKey::generate().public_key();
        let peer = PeerConfig::new(peer_key).with_allowed_ip("10.0.0.2/32".parse().expect("cidr"));
        driver.add_peer("wg0", peer).await.expect("add peer");

        driver
            .simulate_handshake("wg0", &peer_key.to_base64(), 1_000, 500, 300)
            .await;

        let status = driver.peer_status("wg0").await.expect("status");
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].last_handshake, Some(1_000));
        assert_eq!(status[0].rx_bytes, 500);
        assert_eq!(status[0].tx_bytes, 300);
    }

    #[tokio::test]
    async fn add_duplicate_peer_fails() {
        let driver = FakeWireGuardDriver::new();
        driver.create_interface(&cfg("wg0")).await.expect("create");
        let peer_key = PrivateKey::generate().public_key();
        let peer = PeerConfig::new(peer_key);
        driver.add_peer("wg0", peer.clone()).await.expect("first add");
        let err = driver.add_peer("wg0", peer).await.unwrap_err();
        assert!(matches!(err, WireGuardError::PeerExists(..)));
    }

    #[tokio::test]
    async fn remove_missing_peer_fails() {
        let driver = FakeWireGuardDriver::new();
        driver.create_interface(&cfg("wg0")).await.expect("create");
        let peer_key = PrivateKey::generate().public_key();
        let err = driver.remove_peer("wg0", &peer_key).await.unwrap_err();
        assert!(matches!(err, WireGuardError::PeerNotFound(..)));
    }

    #[tokio::test]
    async fn remove_peer_drops_it_from_status() {
        let driver = FakeWireGuardDriver::new();
        driver.create_interface(&cfg("wg0")).await.expect("create");
        let peer_key = PrivateKey::generate().public_key();
        driver.add_peer("wg0", PeerConfig::new(peer_key)).await.expect("add");
        driver.remove_peer("wg0", &peer_key).await.expect("remove");
        let status = driver.peer_status("wg0").await.expect("status");
        assert!(status.is_empty());
    }
}
