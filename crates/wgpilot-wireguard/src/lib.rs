//! Key material, device/peer value types, the `WireGuardDriver` trait
//! boundary, a kernel-backed implementation, an in-memory fake for
//! tests, and wg-quick config rendering.

pub mod config;
pub mod driver;
pub mod error;
pub mod fake;
pub mod keys;
#[cfg(feature = "linux")]
pub mod linux;
pub mod types;

pub use config::{parse_peer_config, render_peer_config, ParsedPeerConfig, PeerArtifact};
pub use driver::{DeviceController, LinkController, WireGuardDriver};
pub use error::{Result, WireGuardError};
pub use fake::FakeWireGuardDriver;
pub use keys::{generate_keypair, KeyPair, PresharedKey, PrivateKey, PublicKey, KEY_SIZE};
#[cfg(feature = "linux")]
pub use linux::LinuxWireGuardDriver;
pub use types::{
    AllowedIp, DeviceConfig, Endpoint, InterfaceInfo, PeerConfig, PeerStatus, ONLINE_FLOOR_SECS,
};
