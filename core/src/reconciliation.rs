// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Reconciliation queue: broadcasts whose bookkeeping failed.
//!
//! When a settlement lands on-chain but the ledger append fails, the payment
//! must not be retried (the money moved) and must not be forgotten (the
//! ledger owes an entry). Entries preserve the original mandate's subject,
//! issuer, domain, and purpose so the drained ledger row never degrades to
//! `agent:unknown`.

use crate::config::Environment;
use crate::executor::ChainReceipt;
use crate::helpers::{now_unix, prefixed_id};
use crate::ledger::{CanonicalLedger, JourneyState};
use crate::mandates::{MandateEnvelope, PaymentMandate, VcProof};
use crate::persistence::SnapshotPersistence;
use async_std::sync::Mutex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::path::Path;

pub const DEFAULT_DRAIN_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Snafu)]
pub enum ReconciliationError {
    #[snafu(display("reconciliation queue persistence failed: {}", msg))]
    Persistence { msg: String },

    #[snafu(display("unknown reconciliation entry: {}", id))]
    UnknownEntry { id: String },
}

/// Mandate context carried alongside a pending entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconMetadata {
    pub subject: String,
    pub issuer: String,
    pub domain: String,
    pub purpose: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReconciliation {
    pub id: String,
    pub mandate_id: String,
    pub chain_tx_hash: String,
    pub chain: String,
    pub audit_anchor: String,
    pub from_wallet: String,
    pub to_wallet: String,
    pub amount_minor: u64,
    pub currency: String,
    pub error: String,
    pub metadata: Option<ReconMetadata>,
    pub attempts: u32,
    pub next_attempt_at: u64,
    pub enqueued_at: u64,
}

impl PendingReconciliation {
    pub fn from_mandate(mandate: &PaymentMandate, receipt: &ChainReceipt, error: &str) -> Self {
        let now = now_unix();
        Self {
            id: prefixed_id("recon"),
            mandate_id: mandate.envelope.mandate_id.clone(),
            chain_tx_hash: receipt.tx_hash.clone(),
            chain: receipt.chain.clone(),
            audit_anchor: receipt.audit_anchor.clone(),
            from_wallet: mandate.from_wallet(),
            to_wallet: mandate.destination.clone(),
            amount_minor: mandate.amount_minor,
            currency: mandate.token.clone(),
            error: error.to_string(),
            metadata: Some(ReconMetadata {
                subject: mandate.envelope.subject.clone(),
                issuer: mandate.envelope.issuer.clone(),
                domain: mandate.envelope.domain.clone(),
                purpose: mandate.envelope.purpose.clone(),
            }),
            attempts: 0,
            next_attempt_at: now,
            enqueued_at: now,
        }
    }

    /// Rebuild a mandate good enough to append the missing ledger row. The
    /// `agent:unknown` fallback only applies to legacy entries without
    /// metadata.
    pub fn reconstruct_mandate(&self) -> PaymentMandate {
        let (subject, issuer, domain, purpose) = match &self.metadata {
            Some(m) => (
                m.subject.clone(),
                m.issuer.clone(),
                m.domain.clone(),
                m.purpose.clone(),
            ),
            None => (
                "agent:unknown".to_string(),
                "agent:unknown".to_string(),
                String::new(),
                "reconciliation".to_string(),
            ),
        };
        PaymentMandate {
            envelope: MandateEnvelope {
                mandate_id: self.mandate_id.clone(),
                issuer,
                subject,
                expires_at: u64::MAX,
                nonce: String::new(),
                domain,
                purpose,
                proof: VcProof {
                    proof_type: "DataIntegrityProof".into(),
                    verification_method: String::new(),
                    created: String::new(),
                    proof_value: String::new(),
                },
            },
            chain: self.chain.clone(),
            token: self.currency.clone(),
            amount_minor: self.amount_minor,
            destination: self.to_wallet.clone(),
            merchant_domain: None,
            audit_hash: self
                .audit_anchor
                .strip_prefix("merkle::")
                .unwrap_or(&self.audit_anchor)
                .to_string(),
            wallet_id: Some(self.from_wallet.clone()),
        }
    }

    pub fn chain_receipt(&self) -> ChainReceipt {
        ChainReceipt {
            tx_hash: self.chain_tx_hash.clone(),
            chain: self.chain.clone(),
            block_number: 0,
            audit_anchor: self.audit_anchor.clone(),
        }
    }
}

#[async_trait]
pub trait ReconciliationQueue: Send + Sync {
    async fn enqueue(&self, pending: PendingReconciliation) -> Result<String, ReconciliationError>;
    /// Entries whose backoff deadline has passed, oldest first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<PendingReconciliation>, ReconciliationError>;
    async fn mark_resolved(&self, id: &str) -> Result<(), ReconciliationError>;
    /// Record a failed attempt; bumps the attempt counter and applies
    /// exponential backoff to the next one.
    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), ReconciliationError>;
    async fn len(&self) -> usize;
}

fn apply_failure(entry: &mut PendingReconciliation, error: &str, now: u64) {
    entry.attempts += 1;
    entry.error = error.to_string();
    let backoff = DEFAULT_DRAIN_INTERVAL_SECS * 2u64.saturating_pow(entry.attempts.min(10));
    entry.next_attempt_at = now + backoff;
}

/// Volatile queue. Logs CRITICAL at construction in production: queued
/// broadcasts disappear on restart and their payments end up settled
/// on-chain but missing from the ledger.
pub struct MemoryReconciliationQueue {
    entries: Mutex<Vec<PendingReconciliation>>,
}

impl MemoryReconciliationQueue {
    pub fn new(environment: Environment) -> Self {
        if environment.is_production() {
            tracing::error!(
                "CRITICAL: MemoryReconciliationQueue is NOT suitable for production: queued \
                 reconciliation work WILL BE LOST on restart"
            );
        }
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ReconciliationQueue for MemoryReconciliationQueue {
    async fn enqueue(&self, pending: PendingReconciliation) -> Result<String, ReconciliationError> {
        let id = pending.id.clone();
        self.entries.lock().await.push(pending);
        Ok(id)
    }

    async fn list_pending(
        &self,
        limit: usize,
    ) -> Result<Vec<PendingReconciliation>, ReconciliationError> {
        let entries = self.entries.lock().await;
        let now = now_unix();
        Ok(entries
            .iter()
            .filter(|e| e.next_attempt_at <= now)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_resolved(&self, id: &str) -> Result<(), ReconciliationError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        if entries.len() == before {
            return Err(ReconciliationError::UnknownEntry { id: id.to_string() });
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), ReconciliationError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| ReconciliationError::UnknownEntry { id: id.to_string() })?;
        apply_failure(entry, error, now_unix());
        Ok(())
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct QueueState {
    entries: Vec<PendingReconciliation>,
}

struct DurableQueueInner {
    state: QueueState,
    persistence: SnapshotPersistence<QueueState>,
}

/// Queue journaled to disk on every mutation.
pub struct DurableReconciliationQueue {
    inner: Mutex<DurableQueueInner>,
}

impl DurableReconciliationQueue {
    pub fn open(store_path: &Path) -> Result<Self, ReconciliationError> {
        let persistence =
            SnapshotPersistence::open(store_path, "reconciliation").map_err(|err| {
                ReconciliationError::Persistence {
                    msg: err.to_string(),
                }
            })?;
        let state = persistence.load_latest_state().unwrap_or_default();
        Ok(Self {
            inner: Mutex::new(DurableQueueInner { state, persistence }),
        })
    }

    async fn persist(inner: &mut DurableQueueInner) -> Result<(), ReconciliationError> {
        let state = inner.state.clone();
        inner
            .persistence
            .store_latest_state(&state)
            .map_err(|err| ReconciliationError::Persistence {
                msg: err.to_string(),
            })
    }
}

#[async_trait]
impl ReconciliationQueue for DurableReconciliationQueue {
    async fn enqueue(&self, pending: PendingReconciliation) -> Result<String, ReconciliationError> {
        let mut inner = self.inner.lock().await;
        let id = pending.id.clone();
        inner.state.entries.push(pending);
        Self::persist(&mut inner).await?;
        Ok(id)
    }

    async fn list_pending(
        &self,
        limit: usize,
    ) -> Result<Vec<PendingReconciliation>, ReconciliationError> {
        let inner = self.inner.lock().await;
        let now = now_unix();
        Ok(inner
            .state
            .entries
            .iter()
            .filter(|e| e.next_attempt_at <= now)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_resolved(&self, id: &str) -> Result<(), ReconciliationError> {
        let mut inner = self.inner.lock().await;
        let before = inner.state.entries.len();
        inner.state.entries.retain(|e| e.id != id);
        if inner.state.entries.len() == before {
            return Err(ReconciliationError::UnknownEntry { id: id.to_string() });
        }
        Self::persist(&mut inner).await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), ReconciliationError> {
        let mut inner = self.inner.lock().await;
        let now = now_unix();
        let entry = inner
            .state
            .entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| ReconciliationError::UnknownEntry { id: id.to_string() })?;
        apply_failure(entry, error, now);
        Self::persist(&mut inner).await
    }

    async fn len(&self) -> usize {
        self.inner.lock().await.state.entries.len()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub resolved: usize,
    pub failed: usize,
    pub escalated: usize,
}

/// One drain pass: retry each due entry's ledger append; escalate to manual
/// review once the retry ceiling is hit.
pub async fn drain_once(
    queue: &dyn ReconciliationQueue,
    ledger: &CanonicalLedger,
    max_retries: u32,
    batch: usize,
) -> DrainStats {
    let mut stats = DrainStats::default();
    let pending = match queue.list_pending(batch).await {
        Ok(pending) => pending,
        Err(err) => {
            tracing::error!("reconciliation drain could not list pending work: {}", err);
            return stats;
        }
    };

    for entry in pending {
        let mandate = entry.reconstruct_mandate();
        let receipt = entry.chain_receipt();
        match ledger.append(&mandate, &receipt).await {
            Ok(ledger_entry) => {
                tracing::info!(
                    mandate_id = %entry.mandate_id,
                    tx_id = %ledger_entry.tx_id,
                    "reconciliation completed ledger append"
                );
                if let Err(err) = queue.mark_resolved(&entry.id).await {
                    tracing::error!("failed to mark reconciliation {} resolved: {}", entry.id, err);
                }
                stats.resolved += 1;
            }
            Err(err) => {
                let attempts = entry.attempts + 1;
                if attempts >= max_retries {
                    tracing::error!(
                        mandate_id = %entry.mandate_id,
                        attempts,
                        "reconciliation retries exhausted, escalating to manual review"
                    );
                    ledger
                        .open_journey(&entry.mandate_id, &entry.chain, Some(&entry.chain_tx_hash))
                        .await;
                    if let Err(err) = ledger
                        .transition_journey(
                            &entry.mandate_id,
                            JourneyState::ManualReview,
                            Some("reconciliation_retries_exhausted"),
                        )
                        .await
                    {
                        tracing::error!("manual review transition failed: {}", err);
                    }
                    if let Err(err) = queue.mark_resolved(&entry.id).await {
                        tracing::error!(
                            "failed to drop escalated reconciliation {}: {}",
                            entry.id,
                            err
                        );
                    }
                    stats.escalated += 1;
                } else {
                    if let Err(mark_err) = queue.mark_failed(&entry.id, &err.to_string()).await {
                        tracing::error!(
                            "failed to record reconciliation failure for {}: {}",
                            entry.id,
                            mark_err
                        );
                    }
                    stats.failed += 1;
                }
            }
        }
    }
    stats
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mandates::{MandateEnvelope, VcProof};
    use tempdir::TempDir;

    fn mandate() -> PaymentMandate {
        PaymentMandate {
            envelope: MandateEnvelope {
                mandate_id: "mandate_reconcile".into(),
                issuer: "wallet:my-wallet".into(),
                subject: "agent:my-ai-assistant".into(),
                expires_at: now_unix() + 300,
                nonce: "test_nonce".into(),
                domain: "test.network".into(),
                purpose: "test_payment".into(),
                proof: VcProof {
                    proof_type: "DataIntegrityProof".into(),
                    verification_method: "test#key-1".into(),
                    created: "2026-01-01T00:00:00Z".into(),
                    proof_value: "test_proof".into(),
                },
            },
            chain: "base".into(),
            token: "USDC".into(),
            amount_minor: 1_000_000,
            destination: "0xdestination".into(),
            merchant_domain: Some("test.network".into()),
            audit_hash: "test_hash".into(),
            wallet_id: Some("my-wallet".into()),
        }
    }

    fn receipt() -> ChainReceipt {
        ChainReceipt {
            tx_hash: "0xtesthash".into(),
            chain: "base".into(),
            block_number: 12345,
            audit_anchor: "merkle::test_hash".into(),
        }
    }

    #[async_std::test]
    async fn test_enqueue_preserves_original_subject() {
        let queue = MemoryReconciliationQueue::new(Environment::Development);
        let entry = PendingReconciliation::from_mandate(&mandate(), &receipt(), "ledger down");
        queue.enqueue(entry).await.unwrap();

        let pending = queue.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        let metadata = pending[0].metadata.as_ref().unwrap();
        assert_eq!(metadata.subject, "agent:my-ai-assistant");
        assert_eq!(metadata.issuer, "wallet:my-wallet");
        assert_eq!(metadata.domain, "test.network");
        assert_eq!(metadata.purpose, "test_payment");
    }

    #[test]
    fn test_reconstruct_restores_original_mandate_data() {
        let entry = PendingReconciliation::from_mandate(&mandate(), &receipt(), "err");
        let rebuilt = entry.reconstruct_mandate();
        assert_eq!(rebuilt.envelope.subject, "agent:my-ai-assistant");
        assert_eq!(rebuilt.envelope.issuer, "wallet:my-wallet");
        assert_eq!(rebuilt.amount_minor, 1_000_000);
        assert_eq!(rebuilt.wallet_id.as_deref(), Some("my-wallet"));
    }

    #[test]
    fn test_reconstruct_falls_back_without_metadata() {
        let mut entry = PendingReconciliation::from_mandate(&mandate(), &receipt(), "err");
        entry.metadata = None;
        let rebuilt = entry.reconstruct_mandate();
        assert_eq!(rebuilt.envelope.subject, "agent:unknown");
    }

    #[async_std::test]
    async fn test_mark_failed_applies_backoff() {
        let queue = MemoryReconciliationQueue::new(Environment::Development);
        let entry = PendingReconciliation::from_mandate(&mandate(), &receipt(), "err");
        let id = queue.enqueue(entry).await.unwrap();

        queue.mark_failed(&id, "still down").await.unwrap();
        // Backed off into the future: nothing due now.
        assert!(queue.list_pending(10).await.unwrap().is_empty());
        assert_eq!(queue.len().await, 1);
    }

    #[async_std::test]
    async fn test_drain_resolves_pending_entry() {
        let queue = MemoryReconciliationQueue::new(Environment::Development);
        let ledger = CanonicalLedger::new();
        let entry = PendingReconciliation::from_mandate(&mandate(), &receipt(), "transient");
        queue.enqueue(entry).await.unwrap();

        let stats = drain_once(&queue, &ledger, DEFAULT_MAX_RETRIES, 10).await;
        assert_eq!(stats.resolved, 1);
        assert_eq!(queue.len().await, 0);

        // The appended row carries the original subject context.
        let entries = ledger.list_entries(None, 10, 0).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].from_wallet, "my-wallet");
        assert_eq!(entries[0].mandate_id, "mandate_reconcile");
    }

    #[async_std::test]
    async fn test_drain_escalates_to_manual_review_after_ceiling() {
        let queue = MemoryReconciliationQueue::new(Environment::Development);
        let ledger = CanonicalLedger::new();
        let mut entry = PendingReconciliation::from_mandate(&mandate(), &receipt(), "err");
        entry.attempts = DEFAULT_MAX_RETRIES - 1;
        queue.enqueue(entry).await.unwrap();
        ledger.fail_next_appends(1).await;

        let stats = drain_once(&queue, &ledger, DEFAULT_MAX_RETRIES, 10).await;
        assert_eq!(stats.escalated, 1);
        assert_eq!(queue.len().await, 0);
        let journey = ledger.journey("mandate_reconcile").await.unwrap();
        assert_eq!(journey.state, JourneyState::ManualReview);
    }

    #[async_std::test]
    async fn test_durable_queue_survives_reopen() {
        let dir = TempDir::new("tollgate-recon").unwrap();
        {
            let queue = DurableReconciliationQueue::open(dir.path()).unwrap();
            let entry = PendingReconciliation::from_mandate(&mandate(), &receipt(), "err");
            queue.enqueue(entry).await.unwrap();
        }
        let queue = DurableReconciliationQueue::open(dir.path()).unwrap();
        assert_eq!(queue.len().await, 1);
        let pending = queue.list_pending(10).await.unwrap();
        assert_eq!(pending[0].mandate_id, "mandate_reconcile");
    }
}
