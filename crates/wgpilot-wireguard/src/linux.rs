//! Kernel-backed `WireGuardDriver`, implemented on top of
//! `defguard_wireguard_rs`'s netlink bindings. Requires `CAP_NET_ADMIN`
//! and the in-kernel `wireguard` module; exercised in CI only behind
//! `--ignored` (see the test module below).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use defguard_wireguard_rs::host::Peer as DgPeer;
use defguard_wireguard_rs::key::Key as DgKey;
use defguard_wireguard_rs::net::IpAddrMask;
use defguard_wireguard_rs::{InterfaceConfiguration, Kernel, WGApi, WireguardInterfaceApi};
use tokio::sync::RwLock;

use crate::driver::{DeviceController, LinkController, WireGuardDriver};
use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::{AllowedIp, DeviceConfig, InterfaceInfo, PeerConfig, PeerStatus};

fn to_ip_addr_mask(ip: AllowedIp) -> IpAddrMask {
    let net = ip.network();
    IpAddrMask::new(net.addr(), net.prefix_len())
}

fn to_defguard_key(bytes: &[u8; 32]) -> DgKey {
    DgKey::from(*bytes)
}

fn build_defguard_peer(peer: &PeerConfig) -> DgPeer {
    let mut dg_peer = DgPeer::new(to_defguard_key(peer.public_key.as_bytes()));
    if let Some(psk) = &peer.preshared_key {
        dg_peer.preshared_key = Some(to_defguard_key(psk.as_bytes()));
    }
    dg_peer.allowed_ips = peer.allowed_ips.iter().map(|ip| to_ip_addr_mask(*ip)).collect();
    if let Some(endpoint) = &peer.endpoint {
        dg_peer.endpoint = Some(endpoint.addr());
    }
    if let Some(keepalive) = peer.persistent_keepalive {
        dg_peer.persistent_keepalive_interval = Some(keepalive);
    }
    dg_peer
}

fn map_err(name: &str, err: impl std::fmt::Display) -> WireGuardError {
    let message = err.to_string();
    if message.contains("ENODEV") || message.contains("No such device") {
        WireGuardError::InterfaceNotFound(name.to_string())
    } else {
        WireGuardError::InterfaceError(format!("{name}: {message}"))
    }
}

/// Kernel-backed driver. Holds one `WGApi<Kernel>` per managed interface
/// plus the last `DeviceConfig` applied, since the kernel's own read-back
/// (`read_interface_data`) does not round-trip the private key.
pub struct LinuxWireGuardDriver {
    configs: Arc<RwLock<HashMap<String, DeviceConfig>>>,
}

impl Default for LinuxWireGuardDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxWireGuardDriver {
    /// Construct a driver with no interfaces yet tracked.
    #[must_use]
    pub fn new() -> Self {
        Self {
            configs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn api(name: &str) -> Result<WGApi<Kernel>> {
        WGApi::<Kernel>::new(name.to_string())
            .map_err(|e| WireGuardError::InterfaceError(format!("{name}: {e}")))
    }
}

impl DeviceController for LinuxWireGuardDriver {
    async fn configure_device(&self, cfg: &DeviceConfig) -> Result<()> {
        let api = Self::api(&cfg.name)?;
        let peers: Vec<DgPeer> = cfg.peers.iter().map(build_defguard_peer).collect();
        let iface_config = InterfaceConfiguration {
            name: cfg.name.clone(),
            prvkey: to_defguard_key(cfg.private_key.as_bytes()).to_string(),
            addresses: cfg.addresses.iter().map(|a| to_ip_addr_mask(*a)).collect(),
            port: u32::from(cfg.listen_port),
            peers,
            mtu: cfg.mtu.map(u32::from),
        };
        api.configure_interface(&iface_config)
            .map_err(|e| map_err(&cfg.name, e))?;
        self.configs.write().await.insert(cfg.name.clone(), cfg.clone());
        Ok(())
    }

    async fn device(&self, name: &str) -> Result<Option<InterfaceInfo>> {
        let api = Self::api(name)?;
        let data = match api.read_interface_data() {
            Ok(data) => data,
            Err(e) => {
                let mapped = map_err(name, e);
                return if mapped.is_not_found() {
                    Ok(None)
                } else {
                    Err(mapped)
                };
            }
        };

        let public_key = PublicKey::from_bytes(*data.private_key.public_key().as_array());
        let peers = data
            .peers
            .values()
            .map(|p| PeerStatus {
                public_key: PublicKey::from_bytes(*p.public_key.as_array()),
                endpoint: p.endpoint.map(crate::types::Endpoint::new),
                last_handshake: p.last_handshake.and_then(|t| {
                    t.duration_since(SystemTime::UNIX_EPOCH).ok().map(|d| d.as_secs() as i64)
                }),
                rx_bytes: p.rx_bytes,
                tx_bytes: p.tx_bytes,
            })
            .collect();

        let addresses: Vec<AllowedIp> = data
            .addresses
            .iter()
            .map(|a| AllowedIp::from_net(ipnet::IpNet::new(a.ip, a.cidr).unwrap_or_else(|_| {
                ipnet::IpNet::new(IpAddr::from([0, 0, 0, 0]), 0).expect("0.0.0.0/0 is always valid")
            })))
            .collect();

        Ok(Some(InterfaceInfo {
            name: name.to_string(),
            public_key,
            listen_port: Some(data.listen_port as u16),
            addresses,
            peers,
        }))
    }

    async fn devices(&self) -> Result<Vec<InterfaceInfo>> {
        let names: Vec<String> = self.configs.read().await.keys().cloned().collect();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            if let Some(info) = self.device(&name).await? {
                out.push(info);
            }
        }
        Ok(out)
    }

    async fn close(&self, name: &str) -> Result<()> {
        self.configs.write().await.remove(name);
        Ok(())
    }
}

impl LinkController for LinuxWireGuardDriver {
    async fn create(&self, name: &str) -> Result<()> {
        let api = Self::api(name)?;
        api.create_interface().map_err(|e| map_err(name, e))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let api = Self::api(name)?;
        api.remove_interface().map_err(|e| map_err(name, e))?;
        self.configs.write().await.remove(name);
        Ok(())
    }

    async fn up(&self, name: &str) -> Result<()> {
        // defguard's configure_interface brings the link up as part of
        // applying the configuration; nothing further to do here.
        let _ = name;
        Ok(())
    }

    async fn down(&self, name: &str) -> Result<()> {
        let api = Self::api(name)?;
        api.remove_interface().map_err(|e| map_err(name, e))
    }

    async fn add_address(&self, name: &str, cidr: AllowedIp) -> Result<()> {
        let api = Self::api(name)?;
        api.assign_address(&to_ip_addr_mask(cidr))
            .map_err(|e| map_err(name, e))
    }

    async fn link_exists(&self, name: &str) -> Result<bool> {
        match self.device(name).await? {
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }
}

impl WireGuardDriver for LinuxWireGuardDriver {
    async fn current_config(&self, name: &str) -> Result<Option<DeviceConfig>> {
        Ok(self.configs.read().await.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[tokio::test]
    #[ignore = "requires root and the in-kernel wireguard module"]
    async fn create_and_tear_down_real_interface() {
        let driver = LinuxWireGuardDriver::new();
        let keys = KeyPair::generate();
        let cfg = DeviceConfig {
            name: "wgtest0".to_string(),
            private_key: keys.private,
            listen_port: 51821,
            addresses: vec!["10.250.0.1/24".parse().expect("cidr")],
            peers: Vec::new(),
            mtu: Some(1420),
        };
        driver.create_interface(&cfg).await.expect("create");
        let info = driver.device("wgtest0").await.expect("read").expect("present");
        assert_eq!(info.public_key, keys.public);
        driver.delete_interface("wgtest0").await.expect("delete");
    }
}
