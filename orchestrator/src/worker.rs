// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Background jobs: reconciliation drain, hold and approval expiry, and the
//! spending-window reset.

use async_std::sync::Arc;
use futures::FutureExt;
use std::time::Duration;
use tollgate_core::approvals::ApprovalStore;
use tollgate_core::holds::HoldStore;
use tollgate_core::ledger::CanonicalLedger;
use tollgate_core::policy::PolicyStore;
use tollgate_core::reconciliation::{self, ReconciliationQueue, DEFAULT_MAX_RETRIES};
use tollgate_core::replay::ReplayCache;
use tollgate_core::scheduler::Scheduler;

pub const RECONCILIATION_INTERVAL: Duration = Duration::from_secs(60);
pub const HOLD_EXPIRY_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const APPROVAL_EXPIRY_INTERVAL: Duration = Duration::from_secs(60);
pub const REPLAY_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const RECONCILIATION_BATCH: usize = 50;

/// Register the standing jobs on a scheduler. The caller starts it.
#[allow(clippy::too_many_arguments)]
pub fn register_jobs(
    scheduler: &Scheduler,
    queue: Arc<dyn ReconciliationQueue>,
    ledger: Arc<CanonicalLedger>,
    holds: Arc<HoldStore>,
    approvals: Arc<ApprovalStore>,
    policies: PolicyStore,
    replay: Arc<dyn ReplayCache>,
) {
    {
        let queue = queue.clone();
        let ledger = ledger.clone();
        scheduler.add_interval_job("reconciliation_drain", RECONCILIATION_INTERVAL, move || {
            let queue = queue.clone();
            let ledger = ledger.clone();
            async move {
                let stats = reconciliation::drain_once(
                    queue.as_ref(),
                    ledger.as_ref(),
                    DEFAULT_MAX_RETRIES,
                    RECONCILIATION_BATCH,
                )
                .await;
                if stats.resolved + stats.failed + stats.escalated > 0 {
                    tracing::info!(
                        resolved = stats.resolved,
                        failed = stats.failed,
                        escalated = stats.escalated,
                        "reconciliation drain pass"
                    );
                }
                Ok(())
            }
            .boxed()
        });
    }

    {
        let holds = holds.clone();
        scheduler.add_interval_job("hold_expiry", HOLD_EXPIRY_INTERVAL, move || {
            let holds = holds.clone();
            async move {
                let expired = holds.expire_due().await;
                if expired > 0 {
                    tracing::info!(expired, "expired lapsed holds");
                }
                Ok(())
            }
            .boxed()
        });
    }

    {
        let approvals = approvals.clone();
        scheduler.add_interval_job("approval_expiry", APPROVAL_EXPIRY_INTERVAL, move || {
            let approvals = approvals.clone();
            async move {
                let expired = approvals.expire_due().await;
                if expired > 0 {
                    tracing::info!(expired, "expired pending approvals");
                }
                Ok(())
            }
            .boxed()
        });
    }

    {
        let replay = replay.clone();
        scheduler.add_interval_job("replay_cache_cleanup", REPLAY_CLEANUP_INTERVAL, move || {
            let replay = replay.clone();
            async move {
                match replay.cleanup_expired().await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "swept expired replay cache entries");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!("replay cache cleanup failed: {}", err);
                    }
                }
                Ok(())
            }
            .boxed()
        });
    }

    scheduler.add_cron_job("spending_window_reset", 0, 0, move || {
        let policies = policies.clone();
        async move {
            let reset = policies.reset_expired_windows().await;
            tracing::info!(reset, "spending window reset sweep");
            Ok(())
        }
        .boxed()
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use tollgate_core::config::Environment;
    use tollgate_core::executor::ChainReceipt;
    use tollgate_core::mandates::{MandateEnvelope, PaymentMandate, VcProof};
    use tollgate_core::reconciliation::{MemoryReconciliationQueue, PendingReconciliation};

    fn pending() -> PendingReconciliation {
        let mandate = PaymentMandate {
            envelope: MandateEnvelope {
                mandate_id: "mandate-worker".into(),
                issuer: "wallet:w".into(),
                subject: "agent:w".into(),
                expires_at: 9_999_999_999,
                nonce: "n".into(),
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
            amount_minor: 1_000_000,
            destination: "0xdest".into(),
            merchant_domain: None,
            audit_hash: "h".into(),
            wallet_id: None,
        };
        let receipt = ChainReceipt {
            tx_hash: "0xhash".into(),
            chain: "base".into(),
            block_number: 1,
            audit_anchor: "merkle::h".into(),
        };
        PendingReconciliation::from_mandate(&mandate, &receipt, "ledger down")
    }

    #[async_std::test]
    async fn test_scheduled_drain_resolves_queue() {
        let queue = Arc::new(MemoryReconciliationQueue::new(Environment::Development));
        let ledger = Arc::new(CanonicalLedger::new());
        queue.enqueue(pending()).await.unwrap();

        let scheduler = Scheduler::new();
        register_jobs(
            &scheduler,
            queue.clone() as Arc<dyn ReconciliationQueue>,
            ledger.clone(),
            Arc::new(HoldStore::new()),
            Arc::new(ApprovalStore::new()),
            PolicyStore::new(),
            Arc::new(tollgate_core::replay::MemoryReplayCache::new(
                Environment::Development,
            )),
        );
        // Drive one pass directly rather than waiting a minute.
        let stats = reconciliation::drain_once(
            queue.as_ref(),
            ledger.as_ref(),
            DEFAULT_MAX_RETRIES,
            RECONCILIATION_BATCH,
        )
        .await;
        assert_eq!(stats.resolved, 1);
        assert_eq!(ledger.entry_count().await, 1);
    }
}
