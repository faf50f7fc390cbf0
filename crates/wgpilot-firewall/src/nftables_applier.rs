//! The kernel-backed `Applier`: translates the flattened rule list into
//! an nftables JSON ruleset and replaces the `wgpilot` table's contents
//! via `nft -j`.

use nftables::batch::Batch;
use nftables::expr::{Expression, NamedExpression, Payload, PayloadField};
use nftables::helper::{apply_ruleset, NftablesError};
use nftables::schema::Nftables;
use nftables::stmt::{Match, Masquerade, Operator, Statement};
use nftables::types::{NfChainPolicy, NfChainType, NfFamily, NfHook};

use crate::error::{FirewallError, Result};
use crate::types::{Direction, ManagedRule};

/// The single nftables table this driver owns end to end.
const TABLE_NAME: &str = "wgpilot";
const POSTROUTING_CHAIN: &str = "postrouting";
const FORWARD_CHAIN: &str = "forward";

/// Production `Applier` backed by the real `nft` binary via the
/// `nftables` crate's JSON schema bindings.
#[derive(Default)]
pub struct NftablesApplier;

impl NftablesApplier {
    /// Construct a new applier. Stateless: every `apply` call rebuilds
    /// the table from scratch from the rule list it is given.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl crate::applier::Applier for NftablesApplier {
    async fn apply(&self, rules: &[ManagedRule]) -> Result<()> {
        let ruleset = build_ruleset(rules);
        apply_ruleset(&ruleset).map_err(map_nft_error)
    }
}

fn build_ruleset(rules: &[ManagedRule]) -> Nftables<'static> {
    let mut batch = Batch::new();
    batch.add(nftables::schema::NfListObject::Table(nftables::schema::Table::new(
        NfFamily::INet,
        TABLE_NAME.to_string(),
    )));
    batch.add(nftables::schema::NfListObject::Chain(
        nftables::schema::Chain::new(
            NfFamily::INet,
            TABLE_NAME.to_string(),
            POSTROUTING_CHAIN.to_string(),
            Some(NfChainType::NAT),
            Some(NfHook::Postrouting),
            Some(100),
            Some(NfChainPolicy::Accept),
            None,
        ),
    ));
    batch.add(nftables::schema::NfListObject::Chain(
        nftables::schema::Chain::new(
            NfFamily::INet,
            TABLE_NAME.to_string(),
            FORWARD_CHAIN.to_string(),
            Some(NfChainType::Filter),
            Some(NfHook::Forward),
            Some(0),
            Some(NfChainPolicy::Accept),
            None,
        ),
    ));

    for rule in rules {
        for stmt_set in concrete_statements(rule) {
            let chain = match rule.chain() {
                crate::types::Chain::Postrouting => POSTROUTING_CHAIN,
                crate::types::Chain::Forward => FORWARD_CHAIN,
            };
            batch.add(nftables::schema::NfListObject::Rule(nftables::schema::Rule::new(
                NfFamily::INet,
                TABLE_NAME.to_string(),
                chain.to_string(),
                stmt_set,
            )));
        }
    }

    batch.to_nftables()
}

/// Expand one `ManagedRule` into one or more concrete statement lists —
/// a bidirectional bridge expands to two accept rules, per spec.md
/// §4.4's rule table.
fn concrete_statements(rule: &ManagedRule) -> Vec<Vec<Statement<'static>>> {
    match rule {
        ManagedRule::NatMasquerade { iface, .. } => {
            vec![vec![
                iifname_match(iface.clone()),
                Statement::Masquerade(Some(Masquerade::default())),
            ]]
        }
        ManagedRule::InterPeerForward { iface } => {
            vec![vec![
                iifname_match(iface.clone()),
                oifname_match(iface.clone()),
                Statement::Accept(None),
            ]]
        }
        ManagedRule::BridgeForward {
            iface_a,
            iface_b,
            direction,
            ..
        } => match direction {
            Direction::AToB => vec![vec![
                iifname_match(iface_a.clone()),
                oifname_match(iface_b.clone()),
                Statement::Accept(None),
            ]],
            Direction::BToA => vec![vec![
                iifname_match(iface_b.clone()),
                oifname_match(iface_a.clone()),
                Statement::Accept(None),
            ]],
            Direction::Bidirectional => vec![
                vec![
                    iifname_match(iface_a.clone()),
                    oifname_match(iface_b.clone()),
                    Statement::Accept(None),
                ],
                vec![
                    iifname_match(iface_b.clone()),
                    oifname_match(iface_a.clone()),
                    Statement::Accept(None),
                ],
            ],
        },
    }
}

fn iifname_match(iface: String) -> Statement<'static> {
    name_match("iifname", iface)
}

fn oifname_match(iface: String) -> Statement<'static> {
    name_match("oifname", iface)
}

fn name_match(field: &'static str, iface: String) -> Statement<'static> {
    Statement::Match(Match {
        left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
            protocol: "meta".into(),
            field: field.into(),
        }))),
        right: Expression::String(iface.into()),
        op: Operator::EQ,
    })
}

fn map_nft_error(err: NftablesError) -> FirewallError {
    FirewallError::ApplyFailed(err.to_string())
}
