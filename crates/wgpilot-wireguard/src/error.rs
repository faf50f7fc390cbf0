/// Errors produced by key handling, device/link control, and config
/// generation.
#[derive(Debug, thiserror::Error)]
pub enum WireGuardError {
    /// A base64-encoded key did not decode to a valid Curve25519 point.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A key string was not valid base64.
    #[error("invalid base64: {0}")]
    InvalidBase64(String),

    /// A decoded key was not exactly 32 bytes.
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// A CIDR string failed to parse.
    #[error("invalid cidr: {0}")]
    InvalidCidr(String),

    /// An endpoint `host:port` string failed to parse.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The target device configuration was internally inconsistent.
    #[error("invalid device configuration: {0}")]
    InvalidConfig(String),

    /// Attempted to create a device that already exists.
    #[error("interface {0} already exists")]
    InterfaceExists(String),

    /// The kernel reported ENODEV or equivalent for the named device.
    #[error("interface {0} not found")]
    InterfaceNotFound(String),

    /// Attempted to add a peer that is already configured.
    #[error("peer {0} already exists on interface {1}")]
    PeerExists(String, String),

    /// The named peer is not configured on the device.
    #[error("peer {0} not found on interface {1}")]
    PeerNotFound(String, String),

    /// A wg-quick INI document failed to parse.
    #[error("parse error at line {line}: {message}")]
    ParseError {
        /// 1-based line number.
        line: usize,
        /// Human-readable description.
        message: String,
    },

    /// The underlying kernel/netlink call failed for a reason other than
    /// "device not found".
    #[error("interface operation failed: {0}")]
    InterfaceError(String),
}

impl WireGuardError {
    /// Stable error code from the closed taxonomy, where applicable. Keys
    /// and config errors surface as `validation-error`; device/peer
    /// lifecycle errors map onto the Orchestrator's codes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidKey(_)
            | Self::InvalidBase64(_)
            | Self::InvalidKeyLength(_)
            | Self::InvalidCidr(_)
            | Self::InvalidEndpoint(_)
            | Self::InvalidConfig(_)
            | Self::ParseError { .. } => "validation-error",
            Self::InterfaceExists(_) => "network-already-exists",
            Self::InterfaceNotFound(_) => "interface-not-found",
            Self::PeerExists(..) => "peer-add-failed",
            Self::PeerNotFound(..) => "peer-not-found",
            Self::InterfaceError(_) => "interface-create-failed",
        }
    }

    /// True when the underlying failure means "already absent" — the
    /// Orchestrator's compensating rollback treats this as success.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::InterfaceNotFound(_) | Self::PeerNotFound(..))
    }
}

/// Convenience result alias for this crate.
pub type Result<T> = std::result::Result<T, WireGuardError>;
