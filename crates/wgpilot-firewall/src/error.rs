/// Errors produced by the firewall driver.
#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    /// The `Applier` rejected the flattened rule list; the rule map has
    /// been restored to its pre-mutation snapshot.
    #[error("failed to apply firewall ruleset: {0}")]
    ApplyFailed(String),
}

impl FirewallError {
    /// Stable error code from the closed taxonomy. Every variant here
    /// surfaces as the generic internal error code — the Orchestrator
    /// is the one that knows whether a failed apply happened during
    /// network or bridge creation and picks the more specific code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ApplyFailed(_) => "internal-error",
        }
    }
}

/// Convenience result alias for this crate.
pub type Result<T> = std::result::Result<T, FirewallError>;
