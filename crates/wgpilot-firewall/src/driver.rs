//! The `FirewallDriver`: an in-memory rule map guarded by a single lock
//! covering both read and apply, with copy/apply/rollback semantics on
//! every mutation per spec.md §4.4.

use std::collections::BTreeMap;
use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::applier::Applier;
use crate::error::Result;
use crate::types::{Chain, Direction, ManagedRule, RuleKey};

type RuleMap = BTreeMap<RuleKey, ManagedRule>;

/// Owns the single nftables table named `wgpilot` (two chains:
/// `postrouting` nat priority 100, `forward` filter priority 0) as a
/// pure in-memory rule map. Every mutating method is
/// `{copy current map → apply change → Applier::apply(flattened) →
/// on failure, restore the copy}`, serialized by one lock so concurrent
/// callers never interleave a read with an in-flight apply.
pub struct FirewallDriver<A: Applier> {
    rules: Mutex<RuleMap>,
    applier: Arc<A>,
}

impl<A: Applier> FirewallDriver<A> {
    /// Construct a driver with an empty rule map. Call
    /// [`FirewallDriver::reconcile`] at startup to align it with a
    /// persisted set of flags before serving mutating traffic.
    pub fn new(applier: A) -> Self {
        Self {
            rules: Mutex::new(BTreeMap::new()),
            applier: Arc::new(applier),
        }
    }

    /// Idempotently ensure a masquerade rule exists for `iface`/`subnet`.
    /// A second call with identical arguments is a no-op (spec.md §8).
    pub async fn add_nat_masquerade(&self, iface: &str, subnet: Ipv4Net) -> Result<()> {
        let rule = ManagedRule::NatMasquerade {
            iface: iface.to_string(),
            subnet,
        };
        self.upsert(rule).await
    }

    /// Remove the masquerade rule for `iface`. No-op if absent.
    pub async fn remove_nat_masquerade(&self, iface: &str) -> Result<()> {
        self.remove(&RuleKey::nat_masquerade(iface)).await
    }

    /// Idempotently ensure an inter-peer-forwarding accept rule exists
    /// for `iface`.
    pub async fn enable_inter_peer_forwarding(&self, iface: &str) -> Result<()> {
        let rule = ManagedRule::InterPeerForward {
            iface: iface.to_string(),
        };
        self.upsert(rule).await
    }

    /// Remove the inter-peer-forwarding rule for `iface`. No-op if
    /// absent.
    pub async fn disable_inter_peer_forwarding(&self, iface: &str) -> Result<()> {
        self.remove(&RuleKey::inter_peer_forward(iface)).await
    }

    /// Create (or, if the unordered pair already has one, atomically
    /// update) a bridge rule between `iface_a` and `iface_b`. Direction
    /// is interpreted relative to the `(iface_a, iface_b)` order passed
    /// here, not the sorted key order — see spec.md §4.4.
    ///
    /// Used for both the initial create and later direction changes:
    /// "changing a bridge's direction is a single atomic update: remove
    /// old rules, add new ones, call apply once" falls out naturally
    /// from the copy/mutate/apply model, since the old entry at this
    /// key is simply replaced.
    pub async fn add_bridge(
        &self,
        iface_a: &str,
        iface_b: &str,
        direction: Direction,
        allowed_cidrs: Option<String>,
    ) -> Result<()> {
        let rule = ManagedRule::BridgeForward {
            iface_a: iface_a.to_string(),
            iface_b: iface_b.to_string(),
            direction,
            allowed_cidrs,
        };
        self.upsert(rule).await
    }

    /// Alias for [`FirewallDriver::add_bridge`] used at call sites that
    /// are explicitly updating an existing bridge's direction or CIDR
    /// allow-list, for readability — the underlying upsert is identical.
    pub async fn update_bridge(
        &self,
        iface_a: &str,
        iface_b: &str,
        direction: Direction,
        allowed_cidrs: Option<String>,
    ) -> Result<()> {
        self.add_bridge(iface_a, iface_b, direction, allowed_cidrs).await
    }

    /// Remove the bridge rule between `iface_a` and `iface_b`
    /// (order-independent). No-op if absent.
    pub async fn remove_bridge(&self, iface_a: &str, iface_b: &str) -> Result<()> {
        self.remove(&RuleKey::bridge_forward(iface_a, iface_b)).await
    }

    /// Replace the entire rule map with `target` in one atomic apply.
    /// Used by the Reconciler at startup to re-derive firewall state
    /// from the Store's flags (spec.md §4.5 step 6) without an
    /// incremental add/remove dance.
    pub async fn reconcile(&self, target: Vec<ManagedRule>) -> Result<()> {
        let mut guard = self.rules.lock().await;
        let before = guard.clone();
        let mut next = RuleMap::new();
        for rule in target {
            next.insert(rule.key(), rule);
        }
        if next == *guard {
            return Ok(());
        }
        *guard = next;
        if let Err(e) = self.apply_locked(&guard).await {
            warn!(error = %e, "reconcile apply failed, restoring prior firewall state");
            *guard = before;
            return Err(e);
        }
        info!(rule_count = guard.len(), "reconciled firewall rules from store");
        Ok(())
    }

    /// A deterministic, sorted textual dump of the current rule map, for
    /// tests and diagnostics.
    pub async fn dump_rules(&self) -> Vec<String> {
        self.rules.lock().await.values().map(ManagedRule::render).collect()
    }

    /// The current rule map, keyed by canonical key, for invariant
    /// assertions in tests (e.g. "at most one bridge entry per
    /// unordered pair").
    pub async fn rule_keys(&self) -> Vec<String> {
        self.rules
            .lock()
            .await
            .keys()
            .map(|k| k.as_str().to_string())
            .collect()
    }

    /// Every rule currently keyed under the `forward:` or `bridge:`
    /// namespace that mentions `iface` on either side, plus the `nat:`
    /// rule for `iface` itself — the set a Network delete must tear
    /// down.
    pub async fn rules_mentioning(&self, iface: &str) -> Vec<RuleKey> {
        self.rules
            .lock()
            .await
            .iter()
            .filter(|(_, rule)| rule_mentions(rule, iface))
            .map(|(key, _)| key.clone())
            .collect()
    }

    async fn upsert(&self, rule: ManagedRule) -> Result<()> {
        let key = rule.key();
        let mut guard = self.rules.lock().await;
        if guard.get(&key) == Some(&rule) {
            return Ok(());
        }
        let before = guard.clone();
        guard.insert(key.clone(), rule);
        if let Err(e) = self.apply_locked(&guard).await {
            warn!(error = %e, rule_key = %key, "firewall apply failed, rolling back");
            *guard = before;
            return Err(e);
        }
        info!(rule_key = %key, "applied firewall rule");
        Ok(())
    }

    async fn remove(&self, key: &RuleKey) -> Result<()> {
        let mut guard = self.rules.lock().await;
        if !guard.contains_key(key) {
            return Ok(());
        }
        let before = guard.clone();
        guard.remove(key);
        if let Err(e) = self.apply_locked(&guard).await {
            warn!(error = %e, rule_key = %key, "firewall apply failed, rolling back");
            *guard = before;
            return Err(e);
        }
        info!(rule_key = %key, "removed firewall rule");
        Ok(())
    }

    async fn apply_locked(&self, guard: &RuleMap) -> Result<()> {
        let flattened: Vec<ManagedRule> = guard.values().cloned().collect();
        self.applier.apply(&flattened).await
    }
}

fn rule_mentions(rule: &ManagedRule, iface: &str) -> bool {
    match rule {
        ManagedRule::NatMasquerade { iface: i, .. } | ManagedRule::InterPeerForward { iface: i } => {
            i == iface
        }
        ManagedRule::BridgeForward { iface_a, iface_b, .. } => iface_a == iface || iface_b == iface,
    }
}

/// The chain a rule kind is destined for, exposed for tests that assert
/// on table structure without reaching into the rule map directly.
#[must_use]
pub fn chain_for(rule: &ManagedRule) -> Chain {
    rule.chain()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::FakeApplier;
    use std::str::FromStr;

    fn subnet(s: &str) -> Ipv4Net {
        Ipv4Net::from_str(s).expect("valid test cidr")
    }

    #[tokio::test]
    async fn nat_masquerade_add_is_idempotent() {
        let applier = FakeApplier::new();
        let driver = FirewallDriver::new(applier.clone());
        driver.add_nat_masquerade("wg0", subnet("10.0.0.0/24")).await.expect("first add");
        let after_first = applier.apply_count().await;
        driver.add_nat_masquerade("wg0", subnet("10.0.0.0/24")).await.expect("second add");
        assert_eq!(applier.apply_count().await, after_first, "identical add must not re-apply");
    }

    #[tokio::test]
    async fn remove_absent_rule_is_a_no_op() {
        let applier = FakeApplier::new();
        let driver = FirewallDriver::new(applier.clone());
        driver.remove_nat_masquerade("wg0").await.expect("remove of absent rule succeeds");
        assert_eq!(applier.apply_count().await, 0);
    }

    #[tokio::test]
    async fn bridge_key_collides_regardless_of_call_order() {
        let driver = FirewallDriver::new(FakeApplier::new());
        driver
            .add_bridge("wg0", "wg1", Direction::Bidirectional, None)
            .await
            .expect("add bridge");
        let keys = driver.rule_keys().await;
        assert_eq!(keys, vec!["bridge:wg0:wg1".to_string()]);

        // Re-adding with swapped arguments updates the same entry rather
        // than creating a second one.
        driver
            .add_bridge("wg1", "wg0", Direction::AToB, None)
            .await
            .unwrap_or_else(|_| panic!("update bridge"));
        let keys = driver.rule_keys().await;
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test]
    async fn failed_apply_restores_prior_rule_map() {
        let applier = FakeApplier::new();
        let driver = FirewallDriver::new(applier.clone());
        driver.add_nat_masquerade("wg0", subnet("10.0.0.0/24")).await.expect("seed rule");
        let before = driver.dump_rules().await;

        applier.fail_next_apply().await;
        let err = driver
            .enable_inter_peer_forwarding("wg0")
            .await
            .expect_err("apply is instructed to fail");
        assert_eq!(err.code(), "internal-error");

        let after = driver.dump_rules().await;
        assert_eq!(before, after, "rule map must be unchanged after a failed apply");
    }

    #[tokio::test]
    async fn reconcile_replaces_whole_map_in_one_apply() {
        let applier = FakeApplier::new();
        let driver = FirewallDriver::new(applier.clone());
        driver.add_nat_masquerade("wg0", subnet("10.0.0.0/24")).await.expect("seed");
        driver.add_nat_masquerade("wg1", subnet("10.1.0.0/24")).await.expect("seed");

        driver
            .reconcile(vec![ManagedRule::NatMasquerade {
                iface: "wg0".to_string(),
                subnet: subnet("10.0.0.0/24"),
            }])
            .await
            .expect("reconcile");

        assert_eq!(driver.rule_keys().await, vec!["nat:wg0".to_string()]);
    }

    #[tokio::test]
    async fn rules_mentioning_iface_covers_nat_forward_and_bridge() {
        let driver = FirewallDriver::new(FakeApplier::new());
        driver.add_nat_masquerade("wg0", subnet("10.0.0.0/24")).await.expect("nat");
        driver.enable_inter_peer_forwarding("wg0").await.expect("forward");
        driver
            .add_bridge("wg0", "wg1", Direction::Bidirectional, None)
            .await
            .expect("bridge");

        let mut mentioning: Vec<String> = driver
            .rules_mentioning("wg0")
            .await
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();
        mentioning.sort();
        assert_eq!(
            mentioning,
            vec!["bridge:wg0:wg1".to_string(), "forward:wg0".to_string(), "nat:wg0".to_string()]
        );
    }
}
