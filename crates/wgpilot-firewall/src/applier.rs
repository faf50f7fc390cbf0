//! The `Applier` capability: hides the kernel-facing nftables call
//! behind a trait so the driver's copy/apply/rollback logic is
//! unit-testable without a real nftables table.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::types::ManagedRule;

/// Applies a flattened rule list to the kernel (or, in tests, to an
/// in-memory stand-in). A production implementation replaces the prior
/// `wgpilot` table contents wholesale on every call — there is no
/// incremental kernel-side diffing, matching spec.md §4.4's "effectively
/// replacing the prior wgpilot table contents."
#[allow(async_fn_in_trait)]
pub trait Applier: Send + Sync {
    /// Replace the `wgpilot` table's contents with exactly these rules.
    async fn apply(&self, rules: &[ManagedRule]) -> Result<()>;
}

/// An in-memory `Applier` for tests and diagnostics: records the last
/// ruleset it was asked to apply and can be told to fail on demand to
/// exercise the driver's rollback path.
#[derive(Clone, Default)]
pub struct FakeApplier {
    state: Arc<Mutex<FakeApplierState>>,
}

#[derive(Default)]
struct FakeApplierState {
    last_applied: Vec<ManagedRule>,
    apply_count: usize,
    fail_next: bool,
}

impl FakeApplier {
    /// Construct a fake applier that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `apply` call fail, to exercise rollback.
    pub async fn fail_next_apply(&self) {
        self.state.lock().await.fail_next = true;
    }

    /// The rule list passed to the most recent successful `apply` call.
    pub async fn last_applied(&self) -> Vec<ManagedRule> {
        self.state.lock().await.last_applied.clone()
    }

    /// Total number of `apply` calls that reached the kernel boundary
    /// (including ones that then failed), for asserting idempotent calls
    /// made no additional apply.
    pub async fn apply_count(&self) -> usize {
        self.state.lock().await.apply_count
    }
}

impl Applier for FakeApplier {
    async fn apply(&self, rules: &[ManagedRule]) -> Result<()> {
        let mut guard = self.state.lock().await;
        guard.apply_count += 1;
        if std::mem::take(&mut guard.fail_next) {
            return Err(crate::error::FirewallError::ApplyFailed(
                "fake applier instructed to fail".to_string(),
            ));
        }
        guard.last_applied = rules.to_vec();
        Ok(())
    }
}
