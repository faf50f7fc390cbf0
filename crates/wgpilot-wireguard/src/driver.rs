//! Driver trait boundary: two low-level capability sets
//! (`DeviceController`, `LinkController`) plus the high-level operations
//! the Orchestrator actually calls (`WireGuardDriver`).

use crate::error::Result;
use crate::types::{AllowedIp, DeviceConfig, InterfaceInfo, PeerConfig, PeerStatus};
use crate::PublicKey;

/// Declarative, replace-semantics device configuration. Calling
/// `configure_device` with a peer list replaces the whole peer set
/// atomically — there is no incremental peer add/remove at this layer.
#[allow(async_fn_in_trait)]
pub trait DeviceController: Send + Sync {
    /// Create or update the device to match `cfg` exactly.
    async fn configure_device(&self, cfg: &DeviceConfig) -> Result<()>;

    /// Current live status of one device, or `None` if it does not exist.
    async fn device(&self, name: &str) -> Result<Option<InterfaceInfo>>;

    /// Current live status of every managed device.
    async fn devices(&self) -> Result<Vec<InterfaceInfo>>;

    /// Release any driver-held resources for `name`. Not the same as
    /// deleting the kernel interface — see `LinkController::delete`.
    async fn close(&self, name: &str) -> Result<()>;
}

/// Link/address-level kernel operations.
#[allow(async_fn_in_trait)]
pub trait LinkController: Send + Sync {
    /// Create the kernel device. Idempotent no-op if it already exists.
    async fn create(&self, name: &str) -> Result<()>;
    /// Remove the kernel device. No-op if absent.
    async fn delete(&self, name: &str) -> Result<()>;
    /// Bring the link up.
    async fn up(&self, name: &str) -> Result<()>;
    /// Bring the link down.
    async fn down(&self, name: &str) -> Result<()>;
    /// Assign an address to the device.
    async fn add_address(&self, name: &str, cidr: AllowedIp) -> Result<()>;
    /// Whether the named kernel device currently exists.
    async fn link_exists(&self, name: &str) -> Result<bool>;
}

/// The high-level operations the Orchestrator calls, built on top of the
/// two capability sets above. A conforming implementation must remember
/// the last full `DeviceConfig` applied per device (private key, listen
/// port, addresses, mtu, and peer set) so that `add_peer`/`update_peer`/
/// `remove_peer` can express themselves as a single replace-semantics
/// `configure_device` call, per spec.md §4.3.
#[allow(async_fn_in_trait)]
pub trait WireGuardDriver: DeviceController + LinkController {
    /// The full configuration last applied to `name` via
    /// `configure_device`, or `None` if the device is unmanaged.
    async fn current_config(&self, name: &str) -> Result<Option<DeviceConfig>>;

    /// Create the kernel device (idempotent), assign the server address,
    /// set listen port and private key, and bring it up. Idempotent when
    /// called against an already-compliant device.
    async fn create_interface(&self, cfg: &DeviceConfig) -> Result<()> {
        if !self.link_exists(&cfg.name).await? {
            self.create(&cfg.name).await?;
        }
        for addr in &cfg.addresses {
            self.add_address(&cfg.name, *addr).await?;
        }
        self.configure_device(cfg).await?;
        self.up(&cfg.name).await?;
        Ok(())
    }

    /// Remove the kernel device. No-op if it is already absent.
    async fn delete_interface(&self, name: &str) -> Result<()> {
        match self.delete(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Add one peer, expressed underneath as a full replace of the peer
    /// set plus the new entry.
    async fn add_peer(&self, name: &str, peer: PeerConfig) -> Result<()> {
        let mut cfg = self.require_config(name).await?;
        if cfg.peers.iter().any(|p| p.public_key == peer.public_key) {
            return Err(crate::WireGuardError::PeerExists(
                peer.public_key.to_base64(),
                name.to_string(),
            ));
        }
        cfg.peers.push(peer);
        self.configure_device(&cfg).await
    }

    /// Replace one peer's configuration by public key.
    async fn update_peer(&self, name: &str, peer: PeerConfig) -> Result<()> {
        let mut cfg = self.require_config(name).await?;
        let Some(slot) = cfg.peers.iter_mut().find(|p| p.public_key == peer.public_key) else {
            return Err(crate::WireGuardError::PeerNotFound(
                peer.public_key.to_base64(),
                name.to_string(),
            ));
        };
        *slot = peer;
        self.configure_device(&cfg).await
    }

    /// Remove one peer by public key.
    async fn remove_peer(&self, name: &str, public_key: &PublicKey) -> Result<()> {
        let mut cfg = self.require_config(name).await?;
        let before = cfg.peers.len();
        cfg.peers.retain(|p| &p.public_key != public_key);
        if cfg.peers.len() == before {
            return Err(crate::WireGuardError::PeerNotFound(
                public_key.to_base64(),
                name.to_string(),
            ));
        }
        self.configure_device(&cfg).await
    }

    /// Live per-peer status: public key, endpoint, last handshake, and
    /// transfer counters.
    async fn peer_status(&self, name: &str) -> Result<Vec<PeerStatus>> {
        Ok(self
            .device(name)
            .await?
            .map(|info| info.peers)
            .unwrap_or_default())
    }

    /// Internal helper: fetch the current config or fail with
    /// `interface-not-found`.
    async fn require_config(&self, name: &str) -> Result<DeviceConfig> {
        self.current_config(name)
            .await?
            .ok_or_else(|| crate::WireGuardError::InterfaceNotFound(name.to_string()))
    }
}
