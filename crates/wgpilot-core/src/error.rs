//! The closed error taxonomy (spec.md §7): one stable string code per
//! variant, used verbatim by every external collaborator. Every
//! `WgpilotError` either originates here (validation, setup ordering) or
//! wraps a lower-crate error with the operation it was attempted in,
//! per the propagation policy: "validation errors never reach the
//! drivers... driver errors are wrapped with the operation they were
//! attempted in and mapped to the corresponding code."

use wgpilot_firewall::FirewallError;
use wgpilot_net::AllocatorError;
use wgpilot_store::StoreError;
use wgpilot_wireguard::WireGuardError;

/// The full closed-set taxonomy from spec.md §7.
#[derive(Debug, thiserror::Error)]
pub enum WgpilotError {
    /// No network exists with the given id or interface name.
    #[error("network not found")]
    NetworkNotFound,
    /// A network with this interface name or listen port already exists.
    #[error("network already exists: {0}")]
    NetworkAlreadyExists(String),
    /// The WireGuard driver failed to create the kernel device.
    #[error("failed to create interface: {0}")]
    InterfaceCreateFailed(String),
    /// The requested subnet overlaps an existing network's subnet.
    #[error("subnet conflicts with an existing network")]
    SubnetConflict,
    /// The requested listen port is already in use by another network.
    #[error("port already in use")]
    PortInUse,
    /// No peer exists with the given id.
    #[error("peer not found")]
    PeerNotFound,
    /// The WireGuard driver failed to add the peer.
    #[error("failed to add peer: {0}")]
    PeerAddFailed(String),
    /// The network's subnet has no unused host address left.
    #[error("ip pool exhausted")]
    IpPoolExhausted,
    /// A supplied `allowedIPs` value was malformed or violated the
    /// "exactly one /32 from the parent subnet" invariant.
    #[error("invalid allowed-ips: {0}")]
    InvalidAllowedIps(String),
    /// No bridge exists with the given id or network pair.
    #[error("bridge not found")]
    BridgeNotFound,
    /// A bridge already exists for this unordered network pair.
    #[error("bridge already exists between these networks")]
    BridgeAlreadyExists,
    /// A bridge was requested between a network and itself.
    #[error("a bridge cannot reference the same network twice")]
    BridgeSelfReference,
    /// No alert exists with the given id.
    #[error("alert not found")]
    AlertNotFound,
    /// Setup is not complete; this mutating operation is gated until it is.
    #[error("setup is not complete")]
    SetupRequired,
    /// Setup has already reached S4; this setup-only step cannot repeat.
    #[error("setup is already complete")]
    SetupAlreadyComplete,
    /// The supplied one-time password did not match the bootstrap value.
    #[error("invalid one-time password")]
    InvalidOtp,
    /// A setup step was attempted out of its strict linear order.
    #[error("setup step attempted out of order")]
    StepOrderViolation,
    /// Input failed validation before reaching any driver or the Store.
    #[error("validation error: {0}")]
    ValidationError(String),
    /// An unexpected failure with no more specific closed-set code.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl WgpilotError {
    /// The stable string code every external collaborator matches on.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NetworkNotFound => "network-not-found",
            Self::NetworkAlreadyExists(_) => "network-already-exists",
            Self::InterfaceCreateFailed(_) => "interface-create-failed",
            Self::SubnetConflict => "subnet-conflict",
            Self::PortInUse => "port-in-use",
            Self::PeerNotFound => "peer-not-found",
            Self::PeerAddFailed(_) => "peer-add-failed",
            Self::IpPoolExhausted => "ip-pool-exhausted",
            Self::InvalidAllowedIps(_) => "invalid-allowed-ips",
            Self::BridgeNotFound => "bridge-not-found",
            Self::BridgeAlreadyExists => "bridge-already-exists",
            Self::BridgeSelfReference => "bridge-self-reference",
            Self::AlertNotFound => "alert-not-found",
            Self::SetupRequired => "setup-required",
            Self::SetupAlreadyComplete => "setup-already-complete",
            Self::InvalidOtp => "invalid-otp",
            Self::StepOrderViolation => "step-order-violation",
            Self::ValidationError(_) => "validation-error",
            Self::InternalError(_) => "internal-error",
        }
    }

    /// Wrap a lower-crate error with the Orchestrator operation it
    /// occurred in, for errors whose meaning depends on context (e.g. a
    /// `StoreError::Conflict` during Create Network is
    /// `network-already-exists`, but during Create Bridge it is
    /// `bridge-already-exists`).
    #[must_use]
    pub fn from_store_conflict(err: StoreError, during: ConflictContext) -> Self {
        match (&err, during) {
            (StoreError::Conflict(_), ConflictContext::Network) => {
                Self::NetworkAlreadyExists(err.to_string())
            }
            (StoreError::Conflict(_), ConflictContext::Bridge) => Self::BridgeAlreadyExists,
            _ => Self::InternalError(err.to_string()),
        }
    }
}

/// Disambiguates a `StoreError::Conflict` (the Store can't tell apart a
/// duplicate interface, duplicate port, or duplicate bridge pair — they
/// all collide into one SQLite unique-constraint error) by the
/// Orchestrator operation that was running when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictContext {
    /// A Create/Update Network operation.
    Network,
    /// A Create/Update Bridge operation.
    Bridge,
}

impl From<StoreError> for WgpilotError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(_) => Self::NetworkAlreadyExists(err.to_string()),
            other => Self::InternalError(other.to_string()),
        }
    }
}

impl From<WireGuardError> for WgpilotError {
    fn from(err: WireGuardError) -> Self {
        match err {
            WireGuardError::InterfaceNotFound(_) => Self::NetworkNotFound,
            WireGuardError::PeerNotFound(..) => Self::PeerNotFound,
            WireGuardError::PeerExists(..) => Self::PeerAddFailed(err.to_string()),
            WireGuardError::InterfaceExists(_) => Self::NetworkAlreadyExists(err.to_string()),
            WireGuardError::InvalidKey(_)
            | WireGuardError::InvalidBase64(_)
            | WireGuardError::InvalidKeyLength(_)
            | WireGuardError::InvalidCidr(_)
            | WireGuardError::InvalidEndpoint(_)
            | WireGuardError::InvalidConfig(_)
            | WireGuardError::ParseError { .. } => Self::ValidationError(err.to_string()),
            WireGuardError::InterfaceError(_) => Self::InterfaceCreateFailed(err.to_string()),
        }
    }
}

impl From<AllocatorError> for WgpilotError {
    fn from(err: AllocatorError) -> Self {
        match err {
            AllocatorError::PoolExhausted => Self::IpPoolExhausted,
            other => Self::ValidationError(other.to_string()),
        }
    }
}

impl From<FirewallError> for WgpilotError {
    fn from(err: FirewallError) -> Self {
        Self::InternalError(err.to_string())
    }
}

/// Convenience result alias for this crate.
pub type Result<T> = std::result::Result<T, WgpilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_spec_literal_strings() {
        assert_eq!(WgpilotError::NetworkNotFound.code(), "network-not-found");
        assert_eq!(WgpilotError::IpPoolExhausted.code(), "ip-pool-exhausted");
        assert_eq!(WgpilotError::StepOrderViolation.code(), "step-order-violation");
        assert_eq!(WgpilotError::BridgeSelfReference.code(), "bridge-self-reference");
    }

    #[test]
    fn store_conflict_disambiguates_by_context() {
        let network_err = WgpilotError::from_store_conflict(
            StoreError::Conflict("duplicate interface".to_string()),
            ConflictContext::Network,
        );
        assert_eq!(network_err.code(), "network-already-exists");

        let bridge_err = WgpilotError::from_store_conflict(
            StoreError::Conflict("duplicate pair".to_string()),
            ConflictContext::Bridge,
        );
        assert_eq!(bridge_err.code(), "bridge-already-exists");
    }
}
