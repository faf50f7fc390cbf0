//! wg-quick compatible INI generation for peer artifacts (spec.md §6).
//!
//! QR-code rendering of this text is explicitly out of scope (spec.md
//! §1, "QR/config file generation") — only the INI text itself is
//! produced here.

use std::fmt::Write as _;
use std::net::IpAddr;

use crate::error::{Result, WireGuardError};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::types::{AllowedIp, Endpoint};

/// Everything needed to render the wg-quick config a peer imports on
/// their own device.
#[derive(Debug, Clone)]
pub struct PeerArtifact {
    /// The peer's own private key.
    pub peer_private_key: PrivateKey,
    /// The peer's assigned host address (and any site-network CIDRs).
    pub peer_addresses: Vec<AllowedIp>,
    /// DNS servers to push, if any.
    pub dns: Vec<IpAddr>,
    /// The server's public key.
    pub server_public_key: PublicKey,
    /// The server's reachable endpoint, if known.
    pub server_endpoint: Option<Endpoint>,
    /// Optional preshared key shared with the server.
    pub preshared_key: Option<PresharedKey>,
    /// Routes pushed to the peer (the network's subnet, plus any bridged
    /// networks, depending on topology).
    pub allowed_ips: Vec<AllowedIp>,
    /// Persistent keepalive in seconds, if configured.
    pub persistent_keepalive: Option<u16>,
}

/// Render a wg-quick compatible `.conf` for this peer.
#[must_use]
pub fn render_peer_config(artifact: &PeerArtifact) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", artifact.peer_private_key.to_base64());
    let addrs: Vec<String> = artifact.peer_addresses.iter().map(ToString::to_string).collect();
    let _ = writeln!(out, "Address = {}", addrs.join(", "));
    if !artifact.dns.is_empty() {
        let dns: Vec<String> = artifact.dns.iter().map(ToString::to_string).collect();
        let _ = writeln!(out, "DNS = {}", dns.join(", "));
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Peer]");
    let _ = writeln!(out, "PublicKey = {}", artifact.server_public_key.to_base64());
    if let Some(psk) = &artifact.preshared_key {
        let _ = writeln!(out, "PresharedKey = {}", psk.to_base64());
    }
    let allowed: Vec<String> = artifact.allowed_ips.iter().map(ToString::to_string).collect();
    let _ = writeln!(out, "AllowedIPs = {}", allowed.join(", "));
    if let Some(endpoint) = &artifact.server_endpoint {
        let _ = writeln!(out, "Endpoint = {endpoint}");
    }
    if let Some(keepalive) = artifact.persistent_keepalive {
        let _ = writeln!(out, "PersistentKeepalive = {keepalive}");
    }
    out
}

/// A minimally parsed wg-quick document, enough to validate round-trips
/// in tests and to support import tooling outside the core.
#[derive(Debug, Clone, Default)]
pub struct ParsedPeerConfig {
    /// `[Interface] PrivateKey`.
    pub private_key: Option<String>,
    /// `[Interface] Address`, split on commas.
    pub addresses: Vec<String>,
    /// `[Peer] PublicKey`.
    pub peer_public_key: Option<String>,
    /// `[Peer] AllowedIPs`, split on commas.
    pub allowed_ips: Vec<String>,
    /// `[Peer] Endpoint`.
    pub endpoint: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

/// Parse a wg-quick INI document back into its fields.
pub fn parse_peer_config(text: &str) -> Result<ParsedPeerConfig> {
    let mut parsed = ParsedPeerConfig::default();
    let mut section = Section::None;

    for (idx, raw_line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') {
            section = match line {
                "[Interface]" => Section::Interface,
                "[Peer]" => Section::Peer,
                other => {
                    return Err(WireGuardError::ParseError {
                        line: line_no,
                        message: format!("unknown section {other}"),
                    });
                }
            };
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(WireGuardError::ParseError {
                line: line_no,
                message: "expected key = value".to_string(),
            });
        };
        let key = key.trim();
        let value = value.trim();

        match (section, key) {
            (Section::Interface, "PrivateKey") => parsed.private_key = Some(value.to_string()),
            (Section::Interface, "Address") => {
                parsed.addresses = value.split(',').map(|s| s.trim().to_string()).collect();
            }
            (Section::Peer, "PublicKey") => parsed.peer_public_key = Some(value.to_string()),
            (Section::Peer, "AllowedIPs") => {
                parsed.allowed_ips = value.split(',').map(|s| s.trim().to_string()).collect();
            }
            (Section::Peer, "Endpoint") => parsed.endpoint = Some(value.to_string()),
            (Section::None, _) => {
                return Err(WireGuardError::ParseError {
                    line: line_no,
                    message: "key outside of any section".to_string(),
                });
            }
            _ => {} // Unrecognized keys (DNS, PresharedKey, PersistentKeepalive, …) are ignored here.
        }
    }

    Ok(parsed)
}
