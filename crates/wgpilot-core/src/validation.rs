//! Input validation for the Orchestrator's create/update entrypoints.
//!
//! Per spec.md §7's propagation policy, validation errors never reach a
//! driver or the Store — everything here runs before the Orchestrator
//! begins a staged operation, so a rejected request leaves no side
//! effects behind to unwind.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net};

use wgpilot_store::types::PeerRole;

use crate::error::{Result, WgpilotError};
use crate::orchestrator::{NewBridgeRequest, NewNetworkRequest, NewPeerRequest};

/// Minimum and maximum network prefix length a managed subnet may use
/// (spec.md §3: "private IPv4 CIDR for this network... /16 to /30").
const MIN_PREFIX_LEN: u8 = 16;
const MAX_PREFIX_LEN: u8 = 30;

fn invalid(message: impl Into<String>) -> WgpilotError {
    WgpilotError::ValidationError(message.into())
}

/// True when every address in `subnet` falls within one of the three
/// RFC1918 private ranges.
fn is_rfc1918(subnet: Ipv4Net) -> bool {
    const BLOCKS: [(&str, u8); 3] = [("10.0.0.0", 8), ("172.16.0.0", 12), ("192.168.0.0", 16)];
    BLOCKS.iter().any(|(addr, prefix)| {
        let block = Ipv4Net::new(addr.parse().expect("literal RFC1918 base is valid"), *prefix)
            .expect("literal RFC1918 block is valid");
        block.contains(&subnet.network()) && block.contains(&subnet.broadcast())
    })
}

/// Validate a network creation request before any conflict check or
/// driver call runs.
pub fn validate_new_network(req: &NewNetworkRequest) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(invalid("network name must not be empty"));
    }
    if req.listen_port == 0 {
        return Err(invalid("listen port must be non-zero"));
    }
    if !(MIN_PREFIX_LEN..=MAX_PREFIX_LEN).contains(&req.subnet.prefix_len()) {
        return Err(invalid(format!(
            "subnet prefix length must be between /{MIN_PREFIX_LEN} and /{MAX_PREFIX_LEN}, got /{}",
            req.subnet.prefix_len()
        )));
    }
    if !is_rfc1918(req.subnet) {
        return Err(invalid(format!("subnet {} is not within an RFC1918 private range", req.subnet)));
    }
    for entry in req.dns_servers.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        IpAddr::from_str(entry).map_err(|e| invalid(format!("invalid dns server {entry}: {e}")))?;
    }
    Ok(())
}

/// Validate a peer creation request. `allowedIPs` itself is computed
/// server-side by the Orchestrator (spec.md §4.6) and is not part of
/// this request, so there is nothing to validate there; this function
/// covers everything the caller does supply.
pub fn validate_new_peer(req: &NewPeerRequest) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(invalid("peer name must not be empty"));
    }
    if let Some(endpoint) = &req.endpoint {
        endpoint
            .parse::<wgpilot_wireguard::Endpoint>()
            .map_err(|e| invalid(format!("invalid endpoint {endpoint}: {e}")))?;
    }
    let site_networks: Vec<&str> = req
        .site_networks
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    match req.role {
        PeerRole::Client if !site_networks.is_empty() => {
            return Err(WgpilotError::InvalidAllowedIps(
                "a client peer must not declare site-network CIDRs".to_string(),
            ));
        }
        PeerRole::SiteGateway => {
            for cidr in &site_networks {
                IpNet::from_str(cidr)
                    .map_err(|e| WgpilotError::InvalidAllowedIps(format!("{cidr}: {e}")))?;
            }
        }
        PeerRole::Client => {}
    }
    Ok(())
}

/// Validate a bridge creation/update request's shape, excluding the
/// self-reference and duplicate-pair checks, which depend on the
/// caller's already-loaded network ids and are performed by the
/// Orchestrator where those ids are in scope.
pub fn validate_new_bridge(req: &NewBridgeRequest) -> Result<()> {
    if req.network_a_id == req.network_b_id {
        return Err(WgpilotError::BridgeSelfReference);
    }
    validate_allowed_cidrs(&req.allowed_cidrs)
}

/// Validate a standalone CIDR allow-list string, as used by both bridge
/// creation and bridge updates.
pub fn validate_allowed_cidrs(allowed_cidrs: &str) -> Result<()> {
    for cidr in allowed_cidrs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        IpNet::from_str(cidr).map_err(|e| WgpilotError::InvalidAllowedIps(format!("{cidr}: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wgpilot_store::types::NetworkMode;

    fn base_network_req() -> NewNetworkRequest {
        NewNetworkRequest {
            name: "Home VPN".to_string(),
            mode: NetworkMode::Gateway,
            subnet: "10.0.0.0/24".parse().expect("valid cidr"),
            listen_port: 51820,
            dns_servers: String::new(),
            nat_enabled: true,
            inter_peer_routing: false,
        }
    }

    #[test]
    fn accepts_well_formed_gateway_network() {
        assert!(validate_new_network(&base_network_req()).is_ok());
    }

    #[test]
    fn rejects_non_rfc1918_subnet() {
        let mut req = base_network_req();
        req.subnet = "8.8.8.0/24".parse().expect("valid cidr");
        let err = validate_new_network(&req).expect_err("public subnet must be rejected");
        assert_eq!(err.code(), "validation-error");
    }

    #[test]
    fn rejects_prefix_outside_allowed_range() {
        let mut req = base_network_req();
        req.subnet = "10.0.0.0/8".parse().expect("valid cidr");
        assert!(validate_new_network(&req).is_err());

        let mut req = base_network_req();
        req.subnet = "10.0.0.0/31".parse().expect("valid cidr");
        assert!(validate_new_network(&req).is_err());
    }

    #[test]
    fn rejects_zero_listen_port() {
        let mut req = base_network_req();
        req.listen_port = 0;
        assert!(validate_new_network(&req).is_err());
    }

    fn base_peer_req() -> NewPeerRequest {
        NewPeerRequest {
            name: "Phone".to_string(),
            email: None,
            role: PeerRole::Client,
            site_networks: String::new(),
            endpoint: None,
            persistent_keepalive: None,
        }
    }

    #[test]
    fn client_with_site_networks_is_rejected() {
        let mut req = base_peer_req();
        req.site_networks = "192.168.50.0/24".to_string();
        let err = validate_new_peer(&req).expect_err("client must not carry site networks");
        assert_eq!(err.code(), "invalid-allowed-ips");
    }

    #[test]
    fn site_gateway_requires_valid_cidrs() {
        let mut req = base_peer_req();
        req.role = PeerRole::SiteGateway;
        req.site_networks = "not-a-cidr".to_string();
        assert!(validate_new_peer(&req).is_err());

        req.site_networks = "192.168.50.0/24,192.168.51.0/24".to_string();
        assert!(validate_new_peer(&req).is_ok());
    }

    #[test]
    fn bridge_self_reference_is_rejected() {
        let req = NewBridgeRequest {
            network_a_id: 1,
            network_b_id: 1,
            direction: wgpilot_store::types::BridgeDirection::Bidirectional,
            allowed_cidrs: String::new(),
        };
        let err = validate_new_bridge(&req).expect_err("self reference must be rejected");
        assert_eq!(err.code(), "bridge-self-reference");
    }
}
