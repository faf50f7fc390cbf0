//! The firewall driver: a single nftables table named `wgpilot`
//! modeled as a pure in-memory rule map, mutated under copy/apply/
//! rollback semantics and flattened to concrete kernel entries only at
//! the `Applier` boundary.

pub mod applier;
pub mod driver;
pub mod error;
#[cfg(feature = "linux")]
pub mod nftables_applier;
pub mod types;

pub use applier::{Applier, FakeApplier};
pub use driver::FirewallDriver;
pub use error::{FirewallError, Result};
#[cfg(feature = "linux")]
pub use nftables_applier::NftablesApplier;
pub use types::{Chain, Direction, ManagedRule, RuleKey};
