// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Canonical ledger: the append-only, Merkle-anchored system of record.
//!
//! Appends happen under an exclusive lock; entries are never mutated after
//! insert and the Merkle root only grows. Each entry's leaf is SHA-256 over
//! the canonical `|`-joined payload, with the amount as its decimal string.
//! Per-mandate journeys run the processing → settled / failed /
//! manual_review state machine; only an explicit operator action leaves
//! manual_review.

use crate::amounts::{amount_str, normalize_token_amount};
use crate::executor::ChainReceipt;
use crate::helpers::{now_unix, prefixed_id};
use crate::mandates::{MandateChain, PaymentMandate};
use crate::merkle::{leaf_hash, verify_proof, MerkleProof, MerkleTree};
use crate::persistence::SnapshotPersistence;
use async_std::sync::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;
use std::path::Path;

#[derive(Clone, Debug, Snafu)]
pub enum LedgerError {
    #[snafu(display("token not permitted: {}", token))]
    TokenNotPermitted { token: String },

    #[snafu(display("ledger durability failure: {}", msg))]
    DurabilityFailure { msg: String },

    #[snafu(display("unknown ledger entry: {}", tx_id))]
    UnknownEntry { tx_id: String },

    #[snafu(display("invalid journey transition for {}: {} -> {}", mandate_id, from, to))]
    InvalidTransition {
        mandate_id: String,
        from: String,
        to: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tx_id: String,
    pub mandate_id: String,
    pub from_wallet: String,
    pub to_wallet: String,
    pub amount: Decimal,
    pub currency: String,
    pub chain: String,
    pub chain_tx_hash: String,
    pub audit_anchor: String,
    pub merkle_leaf_hash: String,
    pub created_at: u64,
}

impl LedgerEntry {
    /// Canonical payload hashed into this entry's Merkle leaf.
    pub fn leaf_payload(&self) -> String {
        [
            self.tx_id.as_str(),
            self.mandate_id.as_str(),
            self.from_wallet.as_str(),
            self.to_wallet.as_str(),
            &amount_str(&self.amount),
            self.currency.as_str(),
            self.chain.as_str(),
            self.chain_tx_hash.as_str(),
        ]
        .join("|")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub receipt_id: String,
    pub tx_id: String,
    pub merkle_root_at_emit: String,
    pub merkle_proof: MerkleProof,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyChecks {
    pub proof_present: bool,
    pub leaf_matches_payload: bool,
    pub root_matches_proof: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub anchor: String,
    pub receipt_id: String,
    pub merkle_root: String,
    pub current_root: String,
    pub is_current_root: bool,
    pub checks: VerifyChecks,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyState {
    Processing,
    Settled,
    Failed,
    ManualReview,
}

impl JourneyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Settled => "settled",
            Self::Failed => "failed",
            Self::ManualReview => "manual_review",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Failed)
    }

    fn may_become(&self, next: JourneyState) -> bool {
        match (self, next) {
            (Self::Processing, _) => true,
            // Operator recovery is the single exit from manual review.
            (Self::ManualReview, Self::Settled) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyEvent {
    pub state: JourneyState,
    pub reason: Option<String>,
    pub at: u64,
}

/// Canonical settlement journey for one payment mandate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journey {
    pub journey_id: String,
    pub mandate_id: String,
    pub rail: String,
    /// On-chain transaction hash or provider reference.
    pub reference: Option<String>,
    pub state: JourneyState,
    pub events: Vec<JourneyEvent>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    entries: Vec<LedgerEntry>,
    index: HashMap<String, usize>,
    receipts: HashMap<String, Receipt>,
    tree: MerkleTree,
    journeys: HashMap<String, Journey>,
    archived_chains: Vec<MandateChain>,
}

struct LedgerInner {
    state: LedgerState,
    persistence: Option<SnapshotPersistence<LedgerState>>,
    #[cfg(any(test, feature = "testing"))]
    fail_next_appends: u32,
}

/// The ledger itself. One instance per service; all access is through the
/// async lock so concurrent appenders never interleave tree updates.
pub struct CanonicalLedger {
    inner: Mutex<LedgerInner>,
}

impl CanonicalLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                state: LedgerState::default(),
                persistence: None,
                #[cfg(any(test, feature = "testing"))]
                fail_next_appends: 0,
            }),
        }
    }

    /// Durable ledger journaled under `store_path`. Reloads the previous
    /// state on startup.
    pub fn open(store_path: &Path) -> Result<Self, LedgerError> {
        let persistence = SnapshotPersistence::open(store_path, "ledger").map_err(|err| {
            LedgerError::DurabilityFailure {
                msg: err.to_string(),
            }
        })?;
        let state = persistence.load_latest_state().unwrap_or_default();
        Ok(Self {
            inner: Mutex::new(LedgerInner {
                state,
                persistence: Some(persistence),
                #[cfg(any(test, feature = "testing"))]
                fail_next_appends: 0,
            }),
        })
    }

    /// Append one settled payment. Exactly one entry may ever exist per
    /// mandate; the caller enforces that through orchestrator idempotency.
    pub async fn append(
        &self,
        mandate: &PaymentMandate,
        receipt: &ChainReceipt,
    ) -> Result<LedgerEntry, LedgerError> {
        let mut inner = self.inner.lock().await;

        #[cfg(any(test, feature = "testing"))]
        {
            if inner.fail_next_appends > 0 {
                inner.fail_next_appends -= 1;
                return Err(LedgerError::DurabilityFailure {
                    msg: "injected ledger failure".into(),
                });
            }
        }

        let amount = normalize_token_amount(&mandate.token, mandate.amount_minor).map_err(
            |_| LedgerError::TokenNotPermitted {
                token: mandate.token.clone(),
            },
        )?;

        // Mutate a copy, persist it, then commit. A durability failure must
        // not leave a phantom in-memory entry that the journal never saw.
        let mut state = inner.state.clone();
        let entry = build_entry(&mut state, mandate, receipt, amount);
        if let Some(persistence) = inner.persistence.as_mut() {
            persistence
                .store_latest_state(&state)
                .map_err(|err| LedgerError::DurabilityFailure {
                    msg: err.to_string(),
                })?;
        }
        inner.state = state;
        Ok(entry)
    }

    /// The receipt emitted for an entry at append time.
    pub async fn create_receipt(&self, tx_id: &str) -> Result<Receipt, LedgerError> {
        let inner = self.inner.lock().await;
        inner
            .state
            .receipts
            .get(tx_id)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownEntry {
                tx_id: tx_id.to_string(),
            })
    }

    pub async fn get_entry(&self, tx_id: &str) -> Option<LedgerEntry> {
        let inner = self.inner.lock().await;
        inner
            .state
            .index
            .get(tx_id)
            .map(|i| inner.state.entries[*i].clone())
    }

    pub async fn list_entries(
        &self,
        wallet_id: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Vec<LedgerEntry> {
        let inner = self.inner.lock().await;
        inner
            .state
            .entries
            .iter()
            .filter(|e| {
                wallet_id.map_or(true, |w| e.from_wallet == w || e.to_wallet == w)
            })
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn current_root(&self) -> String {
        let inner = self.inner.lock().await;
        hex::encode(inner.state.tree.root())
    }

    pub async fn entry_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.state.entries.len()
    }

    /// Recheck an entry against its receipt and the tree.
    pub async fn verify(&self, tx_id: &str) -> Result<VerifyReport, LedgerError> {
        let inner = self.inner.lock().await;
        let entry = inner
            .state
            .index
            .get(tx_id)
            .map(|i| &inner.state.entries[*i])
            .ok_or_else(|| LedgerError::UnknownEntry {
                tx_id: tx_id.to_string(),
            })?;
        let receipt = inner
            .state
            .receipts
            .get(tx_id)
            .ok_or_else(|| LedgerError::UnknownEntry {
                tx_id: tx_id.to_string(),
            })?;

        let recomputed_leaf = leaf_hash(entry.leaf_payload().as_bytes());
        let leaf_matches_payload = hex::encode(recomputed_leaf) == entry.merkle_leaf_hash;

        let recorded_root: Option<[u8; 32]> = hex::decode(&receipt.merkle_root_at_emit)
            .ok()
            .and_then(|bytes| bytes.try_into().ok());
        let root_matches_proof = recorded_root
            .map(|root| verify_proof(&recomputed_leaf, &receipt.merkle_proof, &root))
            .unwrap_or(false);

        let current_root = hex::encode(inner.state.tree.root());
        let checks = VerifyChecks {
            // A receipt always carries its proof; a single-leaf proof has no
            // steps and the leaf is the root.
            proof_present: true,
            leaf_matches_payload,
            root_matches_proof,
        };
        Ok(VerifyReport {
            valid: checks.proof_present && checks.leaf_matches_payload && checks.root_matches_proof,
            anchor: entry.audit_anchor.clone(),
            receipt_id: receipt.receipt_id.clone(),
            merkle_root: receipt.merkle_root_at_emit.clone(),
            is_current_root: receipt.merkle_root_at_emit == current_root,
            current_root,
            checks,
        })
    }

    /// Open (or fetch) the journey for a mandate in `processing`.
    pub async fn open_journey(&self, mandate_id: &str, rail: &str, reference: Option<&str>) {
        let mut inner = self.inner.lock().await;
        let journey = inner
            .state
            .journeys
            .entry(mandate_id.to_string())
            .or_insert_with(|| Journey {
                journey_id: prefixed_id("jny"),
                mandate_id: mandate_id.to_string(),
                rail: rail.to_string(),
                reference: None,
                state: JourneyState::Processing,
                events: vec![JourneyEvent {
                    state: JourneyState::Processing,
                    reason: None,
                    at: now_unix(),
                }],
            });
        if let Some(reference) = reference {
            journey.reference = Some(reference.to_string());
        }
        self.persist_best_effort(&mut inner).await;
    }

    pub async fn journey(&self, mandate_id: &str) -> Option<Journey> {
        let inner = self.inner.lock().await;
        inner.state.journeys.get(mandate_id).cloned()
    }

    pub async fn transition_journey(
        &self,
        mandate_id: &str,
        next: JourneyState,
        reason: Option<&str>,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().await;
        let journey = inner
            .state
            .journeys
            .get_mut(mandate_id)
            .ok_or_else(|| LedgerError::UnknownEntry {
                tx_id: mandate_id.to_string(),
            })?;
        if !journey.state.may_become(next) {
            return Err(LedgerError::InvalidTransition {
                mandate_id: mandate_id.to_string(),
                from: journey.state.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        journey.state = next;
        journey.events.push(JourneyEvent {
            state: next,
            reason: reason.map(str::to_string),
            at: now_unix(),
        });
        self.persist_best_effort(&mut inner).await;
        Ok(())
    }

    /// Operator recovery: manual_review → settled, recorded as its own
    /// event.
    pub async fn operator_settle(&self, mandate_id: &str, operator: &str) -> Result<(), LedgerError> {
        self.transition_journey(
            mandate_id,
            JourneyState::Settled,
            Some(&format!("operator_settled_by:{}", operator)),
        )
        .await
    }

    /// Archive a verified mandate chain for the audit trail.
    pub async fn archive_chain(&self, chain: &MandateChain) {
        let mut inner = self.inner.lock().await;
        inner.state.archived_chains.push(chain.clone());
        self.persist_best_effort(&mut inner).await;
    }

    pub async fn archived_chain(&self, payment_mandate_id: &str) -> Option<MandateChain> {
        let inner = self.inner.lock().await;
        inner
            .state
            .archived_chains
            .iter()
            .find(|c| c.payment.envelope.mandate_id == payment_mandate_id)
            .cloned()
    }

    // Journey and archive updates are secondary records; a persistence
    // hiccup there is logged, not surfaced, unlike entry appends.
    async fn persist_best_effort(&self, inner: &mut LedgerInner) {
        let state = inner.state.clone();
        if let Some(persistence) = inner.persistence.as_mut() {
            if let Err(err) = persistence.store_latest_state(&state) {
                tracing::error!("ledger journal update failed: {}", err);
            }
        }
    }
}

impl Default for CanonicalLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "testing"))]
impl CanonicalLedger {
    /// Make the next `n` appends fail with a durability error.
    pub async fn fail_next_appends(&self, n: u32) {
        self.inner.lock().await.fail_next_appends = n;
    }
}

fn build_entry(
    state: &mut LedgerState,
    mandate: &PaymentMandate,
    receipt: &ChainReceipt,
    amount: Decimal,
) -> LedgerEntry {
    let tx_id = prefixed_id("txn");
    let mut entry = LedgerEntry {
        tx_id: tx_id.clone(),
        mandate_id: mandate.envelope.mandate_id.clone(),
        from_wallet: mandate.from_wallet(),
        to_wallet: mandate.destination.clone(),
        amount,
        currency: mandate.token.clone(),
        chain: receipt.chain.clone(),
        chain_tx_hash: receipt.tx_hash.clone(),
        audit_anchor: receipt.audit_anchor.clone(),
        merkle_leaf_hash: String::new(),
        created_at: now_unix(),
    };
    let leaf = leaf_hash(entry.leaf_payload().as_bytes());
    entry.merkle_leaf_hash = hex::encode(leaf);

    let leaf_index = state.tree.push(leaf);
    let root = hex::encode(state.tree.root());
    let proof = state
        .tree
        .proof(leaf_index)
        .expect("proof for just-pushed leaf");

    state.receipts.insert(
        tx_id.clone(),
        Receipt {
            receipt_id: prefixed_id("rcpt"),
            tx_id: tx_id.clone(),
            merkle_root_at_emit: root,
            merkle_proof: proof,
        },
    );
    state.index.insert(tx_id, state.entries.len());
    state.entries.push(entry.clone());

    let journey = state
        .journeys
        .entry(mandate.envelope.mandate_id.clone())
        .or_insert_with(|| Journey {
            journey_id: prefixed_id("jny"),
            mandate_id: mandate.envelope.mandate_id.clone(),
            rail: receipt.chain.clone(),
            reference: None,
            state: JourneyState::Processing,
            events: vec![JourneyEvent {
                state: JourneyState::Processing,
                reason: None,
                at: now_unix(),
            }],
        });
    journey.reference = Some(receipt.tx_hash.clone());
    if journey.state.may_become(JourneyState::Settled) {
        journey.state = JourneyState::Settled;
        journey.events.push(JourneyEvent {
            state: JourneyState::Settled,
            reason: None,
            at: now_unix(),
        });
    }

    entry
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mandates::{MandateEnvelope, VcProof};
    use async_std::task;
    use std::sync::Arc;
    use tempdir::TempDir;

    fn mandate(id: &str, amount_minor: u64) -> PaymentMandate {
        PaymentMandate {
            envelope: MandateEnvelope {
                mandate_id: id.into(),
                issuer: "wallet:test_wallet".into(),
                subject: "agent:test".into(),
                expires_at: 9_999_999_999,
                nonce: format!("nonce-{}", id),
                domain: "test.network".into(),
                purpose: "checkout".into(),
                proof: VcProof {
                    proof_type: "DataIntegrityProof".into(),
                    verification_method: "ed25519:00".into(),
                    created: "2026-01-01T00:00:00Z".into(),
                    proof_value: "".into(),
                },
            },
            chain: "base".into(),
            token: "USDC".into(),
            amount_minor,
            destination: "0xdestination".into(),
            merchant_domain: Some("test.network".into()),
            audit_hash: format!("hash-{}", id),
            wallet_id: Some("test_wallet".into()),
        }
    }

    fn chain_receipt(tx_hash: &str) -> ChainReceipt {
        ChainReceipt {
            tx_hash: tx_hash.into(),
            chain: "base".into(),
            block_number: 12345,
            audit_anchor: "merkle::anchor".into(),
        }
    }

    #[async_std::test]
    async fn test_append_normalizes_amount() {
        let ledger = CanonicalLedger::new();
        let entry = ledger
            .append(&mandate("m-1", 1_000_000), &chain_receipt("0xhash"))
            .await
            .unwrap();
        assert_eq!(entry.amount, Decimal::new(1_000_000, 6));
        assert_eq!(amount_str(&entry.amount), "1.000000");
    }

    #[async_std::test]
    async fn test_unknown_token_rejected() {
        let ledger = CanonicalLedger::new();
        let mut m = mandate("m-1", 100);
        m.token = "DOGE".into();
        let err = ledger.append(&m, &chain_receipt("0xhash")).await.unwrap_err();
        assert!(matches!(err, LedgerError::TokenNotPermitted { .. }));
    }

    #[async_std::test]
    async fn test_append_settles_journey() {
        let ledger = CanonicalLedger::new();
        ledger
            .append(&mandate("m-1", 1_000_000), &chain_receipt("0xhash"))
            .await
            .unwrap();
        let journey = ledger.journey("m-1").await.unwrap();
        assert_eq!(journey.state, JourneyState::Settled);
        assert_eq!(journey.reference.as_deref(), Some("0xhash"));
    }

    #[async_std::test]
    async fn test_verify_checks_hold_for_every_entry() {
        let ledger = CanonicalLedger::new();
        let mut tx_ids = Vec::new();
        for i in 0..5 {
            let entry = ledger
                .append(
                    &mandate(&format!("m-{}", i), 1_000_000 + i),
                    &chain_receipt(&format!("0xhash-{}", i)),
                )
                .await
                .unwrap();
            tx_ids.push(entry.tx_id);
        }
        for tx_id in &tx_ids {
            let report = ledger.verify(tx_id).await.unwrap();
            assert!(report.valid, "entry {} failed verify", tx_id);
            assert!(report.checks.leaf_matches_payload);
            assert!(report.checks.root_matches_proof);
        }
        // Only the most recent receipt can carry the current root.
        let last = ledger.verify(tx_ids.last().unwrap()).await.unwrap();
        assert!(last.is_current_root);
        let first = ledger.verify(&tx_ids[0]).await.unwrap();
        assert!(!first.is_current_root);
    }

    #[async_std::test]
    async fn test_root_strictly_grows() {
        let ledger = CanonicalLedger::new();
        let empty_root = ledger.current_root().await;
        ledger
            .append(&mandate("m-1", 1_000_000), &chain_receipt("0xa"))
            .await
            .unwrap();
        let root_1 = ledger.current_root().await;
        ledger
            .append(&mandate("m-2", 2_000_000), &chain_receipt("0xb"))
            .await
            .unwrap();
        let root_2 = ledger.current_root().await;
        assert_ne!(empty_root, root_1);
        assert_ne!(root_1, root_2);
    }

    #[async_std::test]
    async fn test_concurrent_appends_are_safe() {
        let ledger = Arc::new(CanonicalLedger::new());
        let mut handles = Vec::new();
        for i in 0..10 {
            let ledger = ledger.clone();
            handles.push(task::spawn(async move {
                ledger
                    .append(
                        &mandate(&format!("m-{}", i), 1_000_000),
                        &chain_receipt(&format!("0xhash-{}", i)),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut tx_ids = Vec::new();
        for handle in handles {
            tx_ids.push(handle.await.tx_id);
        }
        tx_ids.sort();
        tx_ids.dedup();
        assert_eq!(tx_ids.len(), 10);
        assert_eq!(ledger.entry_count().await, 10);
    }

    #[async_std::test]
    async fn test_list_entries_filters_by_wallet() {
        let ledger = CanonicalLedger::new();
        ledger
            .append(&mandate("m-1", 1_000_000), &chain_receipt("0xa"))
            .await
            .unwrap();
        let mut other = mandate("m-2", 1_000_000);
        other.wallet_id = Some("other_wallet".into());
        ledger.append(&other, &chain_receipt("0xb")).await.unwrap();

        assert_eq!(ledger.list_entries(Some("test_wallet"), 10, 0).await.len(), 1);
        assert_eq!(ledger.list_entries(None, 10, 0).await.len(), 2);
        assert_eq!(ledger.list_entries(None, 10, 1).await.len(), 1);
    }

    #[async_std::test]
    async fn test_journey_terminal_states_immutable() {
        let ledger = CanonicalLedger::new();
        ledger.open_journey("m-1", "base", None).await;
        ledger
            .transition_journey("m-1", JourneyState::Failed, Some("revert"))
            .await
            .unwrap();
        let err = ledger
            .transition_journey("m-1", JourneyState::Settled, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[async_std::test]
    async fn test_manual_review_operator_recovery() {
        let ledger = CanonicalLedger::new();
        ledger.open_journey("m-1", "base", Some("0xhash")).await;
        ledger
            .transition_journey("m-1", JourneyState::ManualReview, Some("retries_exhausted"))
            .await
            .unwrap();
        ledger.operator_settle("m-1", "ops@tollgate").await.unwrap();
        let journey = ledger.journey("m-1").await.unwrap();
        assert_eq!(journey.state, JourneyState::Settled);
        assert!(journey
            .events
            .last()
            .unwrap()
            .reason
            .as_deref()
            .unwrap()
            .starts_with("operator_settled_by:"));
    }

    #[async_std::test]
    async fn test_injected_append_failure_leaves_no_entry() {
        let ledger = CanonicalLedger::new();
        ledger.fail_next_appends(1).await;
        let err = ledger
            .append(&mandate("m-1", 1_000_000), &chain_receipt("0xa"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DurabilityFailure { .. }));
        assert_eq!(ledger.entry_count().await, 0);

        // The next append goes through.
        ledger
            .append(&mandate("m-1", 1_000_000), &chain_receipt("0xa"))
            .await
            .unwrap();
        assert_eq!(ledger.entry_count().await, 1);
    }

    #[async_std::test]
    async fn test_durable_ledger_reloads_state() {
        let dir = TempDir::new("tollgate-ledger").unwrap();
        let tx_id = {
            let ledger = CanonicalLedger::open(dir.path()).unwrap();
            ledger
                .append(&mandate("m-1", 5_000_000), &chain_receipt("0xabc"))
                .await
                .unwrap()
                .tx_id
        };
        let ledger = CanonicalLedger::open(dir.path()).unwrap();
        let entry = ledger.get_entry(&tx_id).await.unwrap();
        assert_eq!(amount_str(&entry.amount), "5.000000");
        assert!(ledger.verify(&tx_id).await.unwrap().valid);
    }

    #[async_std::test]
    async fn test_archive_chain_roundtrip() {
        use crate::mandates::{CartMandate, IntentMandate, LineItem};
        let ledger = CanonicalLedger::new();
        let payment = mandate("pay-1", 1_000_000);
        let envelope = |id: &str, purpose: &str| MandateEnvelope {
            mandate_id: id.into(),
            purpose: purpose.into(),
            ..payment.envelope.clone()
        };
        let chain = MandateChain {
            intent: IntentMandate {
                envelope: envelope("intent-1", "intent"),
                scope: vec!["digital".into()],
                requested_amount: 1_000_000,
                issuer_policy: None,
            },
            cart: CartMandate {
                envelope: envelope("cart-1", "cart"),
                merchant_domain: "test.network".into(),
                line_items: vec![LineItem {
                    sku: "sku-1".into(),
                    description: "Test".into(),
                    amount_minor: 1_000_000,
                }],
                currency: "USD".into(),
                subtotal_minor: 1_000_000,
                taxes_minor: 0,
            },
            payment,
        };
        ledger.archive_chain(&chain).await;
        assert_eq!(ledger.archived_chain("pay-1").await.unwrap(), chain);
    }
}
