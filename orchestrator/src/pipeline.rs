// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! The execution pipeline: VERIFY → POLICY → COMPLIANCE → EXECUTE → LEDGER →
//! COMPLETE.
//!
//! Idempotency: executions are memoized by `payment.mandate_id` in an
//! in-flight future map. Concurrent submissions of the same mandate await
//! one execution; later submissions get the memoized result. Dispatch runs
//! exactly once per key, which is what makes a retry after a partial failure
//! safe — a broadcast that already happened is never repeated.

use crate::ratelimit::SlidingWindowLimiter;
use async_std::sync::{Arc, Mutex};
use futures::future::{BoxFuture, FutureExt, Shared};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::{HashMap, VecDeque};
use tollgate_core::amounts::normalize_token_amount;
use tollgate_core::attestation::build_decision_receipt;
use tollgate_core::compliance::ComplianceGate;
use tollgate_core::events::{Event, EventBus};
use tollgate_core::executor::{ChainExecutor, ChainReceipt, ExecutionError};
use tollgate_core::helpers::now_unix;
use tollgate_core::ledger::{CanonicalLedger, JourneyState};
use tollgate_core::mandates::{Mandate, MandateChain, PaymentMandate};
use tollgate_core::policy::PolicyStore;
use tollgate_core::reconciliation::{PendingReconciliation, ReconciliationQueue};
use tollgate_core::verifier::MandateVerifier;
use tollgate_core::wallets::WalletStore;

pub const AUDIT_LOG_CAPACITY: usize = 10_000;
pub const PENDING_RECONCILIATION_MARKER: &str = "PENDING_RECONCILIATION";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Verify,
    Policy,
    Compliance,
    Execute,
    Ledger,
    Complete,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Policy => "policy",
            Self::Compliance => "compliance",
            Self::Execute => "execute",
            Self::Ledger => "ledger",
            Self::Complete => "complete",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub mandate_id: String,
    pub phase: Phase,
    pub success: bool,
    pub detail: Option<String>,
    pub at: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Rejected,
    Failed,
    ReconciliationPending,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub mandate_id: String,
    pub accepted: bool,
    pub status: ExecutionStatus,
    pub reason: Option<String>,
    pub provider: Option<String>,
    pub rule_id: Option<String>,
    pub chain_tx_hash: Option<String>,
    pub ledger_tx_id: Option<String>,
    pub audit_anchor: Option<String>,
}

impl ExecutionResult {
    fn rejected(mandate_id: &str, reason: &str) -> Self {
        Self {
            mandate_id: mandate_id.to_string(),
            accepted: false,
            status: ExecutionStatus::Rejected,
            reason: Some(reason.to_string()),
            provider: None,
            rule_id: None,
            chain_tx_hash: None,
            ledger_tx_id: None,
            audit_anchor: None,
        }
    }

    fn failed(mandate_id: &str, reason: &str) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            ..Self::rejected(mandate_id, reason)
        }
    }
}

#[derive(Clone, Debug, Snafu)]
pub enum PipelineError {
    /// A dispatched payment's spend could not be recorded. This is a
    /// consistency break, not a user error; it propagates instead of being
    /// folded into the result.
    #[snafu(display("spend recording failed for {}: {}", mandate_id, msg))]
    SpendRecording { mandate_id: String, msg: String },
}

type SharedExecution = Shared<BoxFuture<'static, Result<ExecutionResult, PipelineError>>>;

pub struct Pipeline {
    verifier: MandateVerifier,
    policy: PolicyStore,
    compliance: ComplianceGate,
    executor: ChainExecutor,
    ledger: Arc<CanonicalLedger>,
    recon_queue: Arc<dyn ReconciliationQueue>,
    wallets: Arc<WalletStore>,
    events: Arc<EventBus>,
    payment_limiter: SlidingWindowLimiter,
    audit_log: Mutex<VecDeque<AuditRecord>>,
    inflight: Mutex<HashMap<String, SharedExecution>>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: MandateVerifier,
        policy: PolicyStore,
        compliance: ComplianceGate,
        executor: ChainExecutor,
        ledger: Arc<CanonicalLedger>,
        recon_queue: Arc<dyn ReconciliationQueue>,
        wallets: Arc<WalletStore>,
        events: Arc<EventBus>,
        payment_limiter: SlidingWindowLimiter,
    ) -> Self {
        Self {
            verifier,
            policy,
            compliance,
            executor,
            ledger,
            recon_queue,
            wallets,
            events,
            payment_limiter,
            audit_log: Mutex::new(VecDeque::with_capacity(AUDIT_LOG_CAPACITY)),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> Arc<CanonicalLedger> {
        self.ledger.clone()
    }

    pub fn verifier(&self) -> &MandateVerifier {
        &self.verifier
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn policy_store(&self) -> &PolicyStore {
        &self.policy
    }

    pub fn wallet_store(&self) -> Arc<WalletStore> {
        self.wallets.clone()
    }

    pub fn reconciliation_queue(&self) -> Arc<dyn ReconciliationQueue> {
        self.recon_queue.clone()
    }

    pub async fn check_rate_limit(&self, agent_id: &str) -> bool {
        self.payment_limiter.allow(agent_id).await
    }

    /// Execute a full AP2 bundle. Safe to call repeatedly and concurrently
    /// with the same payment mandate.
    pub async fn execute_chain(
        self: &Arc<Self>,
        bundle: MandateChain,
    ) -> Result<ExecutionResult, PipelineError> {
        let key = bundle.payment.envelope.mandate_id.clone();
        self.memoized(key, ExecutionInput::Chain(bundle)).await
    }

    /// Execute a standalone payment mandate (the MVP path): same phases, no
    /// chain-linkage checks.
    pub async fn execute_payment(
        self: &Arc<Self>,
        payment: PaymentMandate,
    ) -> Result<ExecutionResult, PipelineError> {
        let key = payment.envelope.mandate_id.clone();
        self.memoized(key, ExecutionInput::Single(payment)).await
    }

    /// Validate a single mandate without executing anything.
    pub async fn validate_mandate(&self, mandate: &Mandate) -> tollgate_core::verifier::Verdict {
        self.verifier.verify(mandate).await
    }

    async fn memoized(
        self: &Arc<Self>,
        key: String,
        input: ExecutionInput,
    ) -> Result<ExecutionResult, PipelineError> {
        let execution = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let this = self.clone();
                    let fut: BoxFuture<'static, Result<ExecutionResult, PipelineError>> =
                        async move { this.execute_once(input).await }.boxed();
                    let shared = fut.shared();
                    inflight.insert(key, shared.clone());
                    shared
                }
            }
        };
        execution.await
    }

    async fn execute_once(&self, input: ExecutionInput) -> Result<ExecutionResult, PipelineError> {
        let payment = input.payment().clone();
        let mandate_id = payment.envelope.mandate_id.clone();
        let agent_id = payment.envelope.subject.clone();

        // VERIFY
        let verify_reason = match &input {
            ExecutionInput::Chain(bundle) => {
                let verdict = self.verifier.verify_chain(bundle).await;
                if verdict.accepted {
                    if let Some(chain) = &verdict.chain {
                        self.ledger.archive_chain(chain).await;
                    }
                    None
                } else {
                    verdict.reason
                }
            }
            ExecutionInput::Single(payment) => {
                let verdict = self.verifier.verify(&Mandate::Payment(payment.clone())).await;
                if verdict.accepted {
                    None
                } else {
                    verdict.reason
                }
            }
        };
        if let Some(reason) = verify_reason {
            self.audit(&mandate_id, Phase::Verify, false, Some(&reason)).await;
            self.publish("payment.rejected", &mandate_id, &reason).await;
            return Ok(ExecutionResult::rejected(&mandate_id, &reason));
        }
        self.audit(&mandate_id, Phase::Verify, true, None).await;
        self.ledger.open_journey(&mandate_id, &payment.chain, None).await;

        // POLICY
        let amount = match normalize_token_amount(&payment.token, payment.amount_minor) {
            Ok(amount) => amount,
            Err(err) => {
                return Ok(self.reject_at(Phase::Policy, &mandate_id, err.reason()).await);
            }
        };
        // Settlement fees ride on the sponsor in this build; the policy API
        // still accounts for them when a rail charges the agent.
        let fee = Decimal::ZERO;
        if let Err(violation) = self
            .policy
            .validate_payment(&agent_id, amount, fee, payment.merchant_domain.as_deref())
            .await
        {
            return Ok(self.reject_at(Phase::Policy, &mandate_id, violation.reason()).await);
        }
        if let Err(violation) = self
            .policy
            .validate_execution_context(&agent_id, &payment.destination, &payment.chain, &payment.token)
            .await
        {
            return Ok(self.reject_at(Phase::Policy, &mandate_id, violation.reason()).await);
        }
        if let Some(policy) = self.policy.fetch_policy(&agent_id).await {
            let receipt = build_decision_receipt(
                &policy,
                "allow",
                "OK",
                &serde_json::json!({
                    "mandate_id": mandate_id,
                    "destination": payment.destination,
                    "chain": payment.chain,
                    "token": payment.token,
                }),
            );
            self.events
                .publish(Event::new(
                    "policy.decision",
                    serde_json::json!({
                        "mandate_id": mandate_id,
                        "audit_anchor": receipt.audit_anchor,
                    }),
                ))
                .await;
        }
        self.audit(&mandate_id, Phase::Policy, true, None).await;

        // COMPLIANCE — invoked exactly once per execution; the executor
        // never re-checks.
        if let Err(err) = self.wallets.ensure_not_frozen(&agent_id).await {
            tracing::warn!(mandate_id = %mandate_id, "frozen wallet blocked execution: {}", err);
            return Ok(self.reject_at(Phase::Compliance, &mandate_id, "wallet_frozen").await);
        }
        let decision = self.compliance.preflight(&payment).await;
        if !decision.passed {
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| "compliance_rejected".to_string());
            self.audit(&mandate_id, Phase::Compliance, false, Some(&reason)).await;
            self.fail_journey(&mandate_id, &reason).await;
            self.publish("compliance.rejected", &mandate_id, &reason).await;
            let mut result = ExecutionResult::rejected(&mandate_id, &reason);
            result.provider = decision.provider;
            result.rule_id = decision.rule_id;
            return Ok(result);
        }
        if decision.kyt_review_required {
            self.publish("compliance.review_required", &mandate_id, "kyt_high_risk").await;
        }
        self.audit(&mandate_id, Phase::Compliance, true, None).await;

        // EXECUTE
        let receipt = match self.executor.dispatch_payment(&payment).await {
            Ok(receipt) => receipt,
            Err(err) => return Ok(self.handle_dispatch_error(&payment, err).await),
        };
        self.audit(&mandate_id, Phase::Execute, true, Some(&receipt.tx_hash)).await;

        // Spend is recorded the moment value moved, before bookkeeping that
        // can still fail. Losing it would let the agent overspend.
        if let Err(err) = self.policy.record_spend(&agent_id, amount).await {
            tracing::error!(
                mandate_id = %mandate_id,
                "CRITICAL: spend recording failed after dispatch: {}",
                err
            );
            return Err(PipelineError::SpendRecording {
                mandate_id,
                msg: err.to_string(),
            });
        }

        // LEDGER
        match self.ledger.append(&payment, &receipt).await {
            Ok(entry) => {
                self.audit(&mandate_id, Phase::Ledger, true, Some(&entry.tx_id)).await;
                self.audit(&mandate_id, Phase::Complete, true, None).await;
                self.events
                    .publish(Event::new(
                        "payment.completed",
                        serde_json::json!({
                            "mandate_id": mandate_id,
                            "tx_id": entry.tx_id,
                            "chain_tx_hash": entry.chain_tx_hash,
                        }),
                    ))
                    .await;
                Ok(ExecutionResult {
                    mandate_id,
                    accepted: true,
                    status: ExecutionStatus::Completed,
                    reason: None,
                    provider: None,
                    rule_id: None,
                    chain_tx_hash: Some(entry.chain_tx_hash.clone()),
                    ledger_tx_id: Some(entry.tx_id.clone()),
                    audit_anchor: Some(entry.audit_anchor),
                })
            }
            Err(err) => {
                tracing::error!(
                    mandate_id = %mandate_id,
                    "CRITICAL: ledger append failed after broadcast, queueing reconciliation: {}",
                    err
                );
                self.audit(&mandate_id, Phase::Ledger, false, Some(&err.to_string())).await;
                let pending =
                    PendingReconciliation::from_mandate(&payment, &receipt, &err.to_string());
                if let Err(enqueue_err) = self.recon_queue.enqueue(pending).await {
                    tracing::error!(
                        mandate_id = %mandate_id,
                        "reconciliation enqueue failed, entry requires manual recovery: {}",
                        enqueue_err
                    );
                }
                self.publish("payment.reconciliation_pending", &mandate_id, "ledger_append_failed")
                    .await;
                Ok(ExecutionResult {
                    mandate_id,
                    accepted: true,
                    status: ExecutionStatus::ReconciliationPending,
                    reason: Some("ledger_append_failed".to_string()),
                    provider: None,
                    rule_id: None,
                    chain_tx_hash: Some(receipt.tx_hash),
                    ledger_tx_id: Some(PENDING_RECONCILIATION_MARKER.to_string()),
                    audit_anchor: Some(receipt.audit_anchor),
                })
            }
        }
    }

    async fn handle_dispatch_error(
        &self,
        payment: &PaymentMandate,
        err: ExecutionError,
    ) -> ExecutionResult {
        let mandate_id = &payment.envelope.mandate_id;
        let reason = err.reason();
        self.audit(mandate_id, Phase::Execute, false, Some(reason)).await;

        if err.needs_reconciliation() {
            // The broadcast reached the chain; only confirmation is missing.
            // Reconciliation finishes the bookkeeping once it settles.
            if let ExecutionError::ConfirmationTimeout { tx_hash } = &err {
                let receipt = ChainReceipt {
                    tx_hash: tx_hash.clone(),
                    chain: payment.chain.clone(),
                    block_number: 0,
                    audit_anchor: format!("merkle::{}", payment.audit_hash),
                };
                let pending = PendingReconciliation::from_mandate(payment, &receipt, reason);
                if let Err(enqueue_err) = self.recon_queue.enqueue(pending).await {
                    tracing::error!("reconciliation enqueue failed: {}", enqueue_err);
                }
                self.publish("payment.reconciliation_pending", mandate_id, reason).await;
                let mut result = ExecutionResult::failed(mandate_id, reason);
                result.accepted = true;
                result.status = ExecutionStatus::ReconciliationPending;
                result.chain_tx_hash = Some(tx_hash.clone());
                result.ledger_tx_id = Some(PENDING_RECONCILIATION_MARKER.to_string());
                return result;
            }
        }

        self.fail_journey(mandate_id, reason).await;
        self.publish("payment.failed", mandate_id, reason).await;
        ExecutionResult::failed(mandate_id, reason)
    }

    async fn reject_at(&self, phase: Phase, mandate_id: &str, reason: &str) -> ExecutionResult {
        self.audit(mandate_id, phase, false, Some(reason)).await;
        self.fail_journey(mandate_id, reason).await;
        self.publish(&format!("{}.rejected", phase.as_str()), mandate_id, reason)
            .await;
        ExecutionResult::rejected(mandate_id, reason)
    }

    async fn fail_journey(&self, mandate_id: &str, reason: &str) {
        if let Err(err) = self
            .ledger
            .transition_journey(mandate_id, JourneyState::Failed, Some(reason))
            .await
        {
            tracing::warn!("journey transition failed for {}: {}", mandate_id, err);
        }
    }

    async fn publish(&self, event_type: &str, mandate_id: &str, reason: &str) {
        self.events
            .publish(Event::new(
                event_type,
                serde_json::json!({ "mandate_id": mandate_id, "reason": reason }),
            ))
            .await;
    }

    async fn audit(&self, mandate_id: &str, phase: Phase, success: bool, detail: Option<&str>) {
        let mut log = self.audit_log.lock().await;
        if log.len() == AUDIT_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(AuditRecord {
            mandate_id: mandate_id.to_string(),
            phase,
            success,
            detail: detail.map(str::to_string),
            at: now_unix(),
        });
    }

    /// Most recent audit records, optionally filtered by mandate.
    pub async fn audit_log(&self, limit: usize, mandate_id: Option<&str>) -> Vec<AuditRecord> {
        let log = self.audit_log.lock().await;
        let filtered: Vec<AuditRecord> = log
            .iter()
            .filter(|r| mandate_id.map_or(true, |m| r.mandate_id == m))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }

    pub async fn audit_log_len(&self) -> usize {
        self.audit_log.lock().await.len()
    }
}

enum ExecutionInput {
    Chain(MandateChain),
    Single(PaymentMandate),
}

impl ExecutionInput {
    fn payment(&self) -> &PaymentMandate {
        match self {
            Self::Chain(bundle) => &bundle.payment,
            Self::Single(payment) => payment,
        }
    }
}
