//! Stateless per-subnet host address allocation.
//!
//! `next_free_host` is a pure function: given a subnet and the set of
//! addresses already assigned to peers in that network, it returns the
//! lowest unused host address, skipping the network address, the
//! broadcast address, and the first host (reserved for the server's own
//! tunnel endpoint). Concurrency safety is the caller's responsibility —
//! callers must serialize `{read used, allocate, insert}` per network.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{AllocatorError, Result};

/// Returns the lowest-numbered unused host address in `subnet`.
///
/// `used` must contain only addresses that are themselves members of
/// `subnet`; addresses outside the subnet are rejected rather than
/// silently ignored, since a caller passing them is almost certainly
/// tracking the wrong network.
pub fn next_free_host(subnet: Ipv4Net, used: &BTreeSet<Ipv4Addr>) -> Result<Ipv4Addr> {
    for addr in used {
        if !subnet.contains(addr) {
            return Err(AllocatorError::AddressNotInSubnet {
                addr: *addr,
                subnet,
            });
        }
    }

    let mut hosts = subnet.hosts();
    // The first host address is reserved for the server's own endpoint.
    hosts.next().ok_or(AllocatorError::NoUsableHosts(subnet))?;

    for addr in hosts {
        if !used.contains(&addr) {
            return Ok(addr);
        }
    }

    Err(AllocatorError::PoolExhausted)
}

/// The host address reserved for the server's own tunnel endpoint —
/// the first host in the subnet.
#[must_use]
pub fn server_host(subnet: Ipv4Net) -> Option<Ipv4Addr> {
    subnet.hosts().next()
}
