// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Policy attestation: canonical policy hashing and decision receipts.
//!
//! The policy hash covers configuration only. Runtime counters
//! (`spent_total`, window `current_spent`, timestamps) are excluded so the
//! hash is stable across spends and changes exactly when the guardrails do.

use crate::merkle::{leaf_hash, MerkleTree};
use crate::policy::SpendingPolicy;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Canonical JSON payload fed into the policy hash.
pub fn canonicalize_policy_for_hash(policy: &SpendingPolicy) -> String {
    // BTreeMap-backed serde_json::Value is not ordering-stable across
    // insertion patterns, so the payload is built field by field in a fixed
    // order instead of serializing the struct and deleting keys.
    let windows: Vec<serde_json::Value> = [
        ("daily", &policy.daily_limit),
        ("weekly", &policy.weekly_limit),
        ("monthly", &policy.monthly_limit),
    ]
    .iter()
    .map(|(name, window)| match window {
        Some(w) => json!({
            "window": name,
            "window_secs": w.window_secs,
            "limit_amount": w.limit_amount.to_string(),
        }),
        None => json!({ "window": name }),
    })
    .collect();

    json!({
        "agent_id": policy.agent_id,
        "limit_per_tx": policy.limit_per_tx.to_string(),
        "limit_total": policy.limit_total.to_string(),
        "windows": windows,
        "allowed_chains": policy.allowed_chains,
        "allowed_tokens": policy.allowed_tokens,
        "allowed_destination_addresses": policy.allowed_destination_addresses,
        "blocked_destination_addresses": policy.blocked_destination_addresses,
        "blocked_merchants": policy.blocked_merchants,
    })
    .to_string()
}

/// SHA-256 over the canonical policy payload, hex.
pub fn compute_policy_hash(policy: &SpendingPolicy) -> String {
    hex::encode(leaf_hash(canonicalize_policy_for_hash(policy).as_bytes()))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionReceipt {
    pub policy_hash: String,
    pub context_hash: String,
    pub decision_hash: String,
    pub merkle_root: String,
    /// `"merkle::" + merkle_root`, the anchor recorded alongside the payment.
    pub audit_anchor: String,
}

/// Bind a policy decision to the policy and evaluation context it was made
/// under. The three hashes become Merkle leaves; the root anchors the
/// decision.
pub fn build_decision_receipt(
    policy: &SpendingPolicy,
    decision: &str,
    reason: &str,
    context: &serde_json::Value,
) -> DecisionReceipt {
    let policy_hash = compute_policy_hash(policy);
    let context_hash = hex::encode(leaf_hash(context.to_string().as_bytes()));
    let decision_hash = hex::encode(leaf_hash(
        format!("{}|{}", decision, reason).as_bytes(),
    ));

    let mut tree = MerkleTree::new();
    tree.push(leaf_hash(policy_hash.as_bytes()));
    tree.push(leaf_hash(context_hash.as_bytes()));
    tree.push(leaf_hash(decision_hash.as_bytes()));
    let merkle_root = hex::encode(tree.root());

    DecisionReceipt {
        policy_hash,
        context_hash,
        decision_hash,
        audit_anchor: format!("merkle::{}", merkle_root),
        merkle_root,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::create_default_policy;
    use rust_decimal::Decimal;

    #[test]
    fn test_policy_hash_ignores_mutable_spend_state() {
        let mut policy = create_default_policy("agent_1");
        policy.spent_total = Decimal::new(10, 0);
        let hash_a = compute_policy_hash(&policy);

        policy.spent_total = Decimal::new(999, 0);
        policy.daily_limit.as_mut().unwrap().current_spent = Decimal::new(50, 0);
        policy.updated_at += 1000;
        let hash_b = compute_policy_hash(&policy);

        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn test_policy_hash_changes_when_guardrails_change() {
        let mut policy = create_default_policy("agent_1");
        let hash_a = compute_policy_hash(&policy);
        policy.allowed_destination_addresses = vec!["0xabc".into()];
        assert_ne!(hash_a, compute_policy_hash(&policy));
    }

    #[test]
    fn test_canonical_payload_excludes_runtime_fields() {
        let policy = create_default_policy("agent_1");
        let payload = canonicalize_policy_for_hash(&policy);
        assert!(!payload.contains("spent_total"));
        assert!(!payload.contains("current_spent"));
        assert!(!payload.contains("created_at"));
        assert!(!payload.contains("updated_at"));
    }

    #[test]
    fn test_decision_receipt_has_merkle_anchor() {
        let policy = create_default_policy("agent_1");
        let receipt = build_decision_receipt(
            &policy,
            "allow",
            "OK",
            &serde_json::json!({"destination": "0xabc", "chain": "base", "token": "USDC"}),
        );
        assert!(!receipt.policy_hash.is_empty());
        assert!(!receipt.context_hash.is_empty());
        assert!(!receipt.decision_hash.is_empty());
        assert!(receipt.audit_anchor.starts_with("merkle::"));
        assert!(receipt.audit_anchor.ends_with(&receipt.merkle_root));
    }

    #[test]
    fn test_decision_receipt_sensitive_to_context() {
        let policy = create_default_policy("agent_1");
        let a = build_decision_receipt(&policy, "allow", "OK", &serde_json::json!({"chain": "base"}));
        let b = build_decision_receipt(&policy, "allow", "OK", &serde_json::json!({"chain": "ethereum"}));
        assert_ne!(a.merkle_root, b.merkle_root);
        assert_eq!(a.policy_hash, b.policy_hash);
    }
}
