use std::net::Ipv4Addr;

/// Errors produced by the IP allocator.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AllocatorError {
    /// No unused host address remains in the subnet.
    #[error("ip pool exhausted")]
    PoolExhausted,
    /// The subnet's prefix length leaves no usable host range (e.g. /31, /32).
    #[error("subnet {0} has no usable host addresses")]
    NoUsableHosts(ipnet::Ipv4Net),
    /// A supplied "used" address does not fall within the subnet.
    #[error("address {addr} is not a member of subnet {subnet}")]
    AddressNotInSubnet {
        /// The offending address.
        addr: Ipv4Addr,
        /// The subnet it was checked against.
        subnet: ipnet::Ipv4Net,
    },
}

/// Stable error code, matching the closed taxonomy in the reference catalog.
impl AllocatorError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PoolExhausted => "ip-pool-exhausted",
            Self::NoUsableHosts(_) | Self::AddressNotInSubnet { .. } => "validation-error",
        }
    }
}

/// Convenience result alias for this crate.
pub type Result<T> = std::result::Result<T, AllocatorError>;
