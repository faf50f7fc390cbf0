//! The rule-map model: canonical keys, the closed direction set, and the
//! managed rule kinds from spec.md §4.4's table.

use std::fmt;

use ipnet::Ipv4Net;

/// Direction of a bridge's traffic flow. A closed, exhaustive set — no
/// other value can reach the driver, since the type itself forbids it
/// (spec.md §4.4: "any other value is rejected before any mutation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Traffic flows from the first interface to the second only.
    AToB,
    /// Traffic flows from the second interface to the first only.
    BToA,
    /// Traffic flows both ways.
    Bidirectional,
}

/// The canonical key a rule is stored and deduplicated under.
///
/// `nat:<iface>` and `forward:<iface>` are per-interface; `bridge:<a>:<b>`
/// is built from the *lexicographically sorted* interface pair so that
/// `bridge(A, B)` and `bridge(B, A)` collide on the same map entry,
/// regardless of which order a caller supplies them in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleKey(String);

impl RuleKey {
    pub(crate) fn nat_masquerade(iface: &str) -> Self {
        Self(format!("nat:{iface}"))
    }

    pub(crate) fn inter_peer_forward(iface: &str) -> Self {
        Self(format!("forward:{iface}"))
    }

    pub(crate) fn bridge_forward(iface_a: &str, iface_b: &str) -> Self {
        let (lo, hi) = if iface_a <= iface_b {
            (iface_a, iface_b)
        } else {
            (iface_b, iface_a)
        };
        Self(format!("bridge:{lo}:{hi}"))
    }

    /// The key as it appears in `dumpRules()` output and log fields.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The nftables chain a rule's concrete entries live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    /// `type nat, hook postrouting, priority 100`.
    Postrouting,
    /// `type filter, hook forward, priority 0`.
    Forward,
}

/// One managed rule, keyed and deduplicated by `RuleKey`. This is the
/// in-memory model the driver's rule map holds; `dump_rules` renders it
/// to text and the `Applier` flattens it into concrete kernel entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedRule {
    /// `nat:<iface>` — masquerade traffic entering on `iface` leaving any
    /// other interface.
    NatMasquerade {
        /// The managed interface.
        iface: String,
        /// The interface's subnet, named in the masquerade match per
        /// invariant 4 ("exactly one masquerade rule for that
        /// interface+subnet").
        subnet: Ipv4Net,
    },
    /// `forward:<iface>` — accept packets with iifname == oifname ==
    /// `iface`.
    InterPeerForward {
        /// The managed interface.
        iface: String,
    },
    /// `bridge:<sorted pair>` — one or two accept rules depending on
    /// direction, expanded relative to `iface_a`/`iface_b` in the order
    /// they were supplied (not the sorted key order).
    BridgeForward {
        /// The interface direction is expressed "from".
        iface_a: String,
        /// The interface direction is expressed "to".
        iface_b: String,
        /// a_to_b / b_to_a / bidirectional, relative to `iface_a`/`iface_b`.
        direction: Direction,
        /// Optional comma-separated CIDR allow-list restricting the bridge.
        allowed_cidrs: Option<String>,
    },
}

impl ManagedRule {
    /// This rule's canonical dedup key.
    #[must_use]
    pub fn key(&self) -> RuleKey {
        match self {
            Self::NatMasquerade { iface, .. } => RuleKey::nat_masquerade(iface),
            Self::InterPeerForward { iface } => RuleKey::inter_peer_forward(iface),
            Self::BridgeForward { iface_a, iface_b, .. } => {
                RuleKey::bridge_forward(iface_a, iface_b)
            }
        }
    }

    /// The chain this rule's concrete entries belong to.
    #[must_use]
    pub fn chain(&self) -> Chain {
        match self {
            Self::NatMasquerade { .. } => Chain::Postrouting,
            Self::InterPeerForward { .. } | Self::BridgeForward { .. } => Chain::Forward,
        }
    }

    /// Render this rule's deterministic textual form for `dump_rules`.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::NatMasquerade { iface, subnet } => {
                format!("nat:{iface} masquerade iifname {iface} subnet {subnet}")
            }
            Self::InterPeerForward { iface } => {
                format!("forward:{iface} accept iifname {iface} oifname {iface}")
            }
            Self::BridgeForward {
                iface_a,
                iface_b,
                direction,
                allowed_cidrs,
            } => {
                let dir = match direction {
                    Direction::AToB => format!("{iface_a}->{iface_b}"),
                    Direction::BToA => format!("{iface_b}->{iface_a}"),
                    Direction::Bidirectional => format!("{iface_a}<->{iface_b}"),
                };
                let key = RuleKey::bridge_forward(iface_a, iface_b);
                match allowed_cidrs {
                    Some(cidrs) if !cidrs.is_empty() => {
                        format!("{key} accept {dir} cidrs={cidrs}")
                    }
                    _ => format!("{key} accept {dir}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_key_collides_regardless_of_argument_order() {
        assert_eq!(
            RuleKey::bridge_forward("wg0", "wg1"),
            RuleKey::bridge_forward("wg1", "wg0")
        );
    }

    #[test]
    fn nat_and_forward_keys_are_namespaced_per_interface() {
        assert_eq!(RuleKey::nat_masquerade("wg0").as_str(), "nat:wg0");
        assert_eq!(RuleKey::inter_peer_forward("wg0").as_str(), "forward:wg0");
    }
}
