// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Compliance gate: KYC, KYT, and KYA preflight checks.
//!
//! Every provider error fails closed. A KYC outage is indistinguishable from
//! an unverified customer; the payment is rejected with a service-error
//! reason rather than waved through.

use crate::config::Settings;
use crate::helpers::now_unix;
use crate::mandates::PaymentMandate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

#[derive(Clone, Debug, Snafu)]
#[snafu(display("{} provider error: {}", provider, msg))]
pub struct ProviderError {
    pub provider: String,
    pub msg: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Severe,
}

/// KYT screening outcome for one address.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KytScreen {
    pub should_block: bool,
    pub risk_level: RiskLevel,
    pub rule_id: Option<String>,
}

#[async_trait]
pub trait KycProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn check_verification(&self, agent_id: &str) -> Result<bool, ProviderError>;
}

#[async_trait]
pub trait KytProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn screen(&self, address: &str, chain: &str) -> Result<KytScreen, ProviderError>;
}

#[async_trait]
pub trait KyaProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn check_agent(&self, agent_id: &str) -> Result<bool, ProviderError>;
}

/// The gate's verdict on one payment mandate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplianceDecision {
    pub passed: bool,
    pub reason: Option<String>,
    pub provider: Option<String>,
    pub rule_id: Option<String>,
    pub kyc_verified: Option<bool>,
    pub kyt_risk_level: Option<RiskLevel>,
    /// High-risk but non-blocking screen: passes the gate, flagged for
    /// manual review downstream.
    pub kyt_review_required: bool,
}

impl ComplianceDecision {
    fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
            provider: None,
            rule_id: None,
            kyc_verified: None,
            kyt_risk_level: None,
            kyt_review_required: false,
        }
    }

    fn fail(reason: &str, provider: &str, rule_id: &str) -> Self {
        Self {
            passed: false,
            reason: Some(reason.to_string()),
            provider: Some(provider.to_string()),
            rule_id: Some(rule_id.to_string()),
            kyc_verified: None,
            kyt_risk_level: None,
            kyt_review_required: false,
        }
    }
}

/// Immutable record of one gate decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplianceAuditEntry {
    pub mandate_id: String,
    pub subject: String,
    pub passed: bool,
    pub reason: Option<String>,
    pub provider: Option<String>,
    pub rule_id: Option<String>,
    pub decided_at: u64,
}

/// Bounded in-memory audit ring. Warns as it approaches capacity; at that
/// point the deployment needs a durable backend, not a bigger ring.
pub struct ComplianceAuditStore {
    entries: Mutex<VecDeque<ComplianceAuditEntry>>,
    capacity: usize,
}

impl Default for ComplianceAuditStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }
}

impl ComplianceAuditStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn append(&self, entry: ComplianceAuditEntry) {
        let mut entries = self.entries.lock().expect("audit store lock poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        let len = entries.len();
        if len * 10 >= self.capacity * 9 {
            tracing::warn!(
                "compliance audit store approaching capacity ({}/{}); migrate to a durable \
                 backend (PostgreSQL) before entries are dropped",
                len,
                self.capacity
            );
        }
    }

    /// Async append contract for callers already on the event loop.
    pub async fn append_async(&self, entry: ComplianceAuditEntry) {
        self.append(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("audit store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn recent(&self, limit: usize) -> Vec<ComplianceAuditEntry> {
        let entries = self.entries.lock().expect("audit store lock poisoned");
        entries.iter().rev().take(limit).cloned().collect()
    }
}

pub struct ComplianceGate {
    settings: Arc<Settings>,
    kyc: Option<Arc<dyn KycProvider>>,
    kyt: Option<Arc<dyn KytProvider>>,
    kya: Option<Arc<dyn KyaProvider>>,
    audit: Arc<ComplianceAuditStore>,
}

impl ComplianceGate {
    pub fn new(
        settings: Arc<Settings>,
        kyc: Option<Arc<dyn KycProvider>>,
        kyt: Option<Arc<dyn KytProvider>>,
        kya: Option<Arc<dyn KyaProvider>>,
        audit: Arc<ComplianceAuditStore>,
    ) -> Self {
        Self {
            settings,
            kyc,
            kyt,
            kya,
            audit,
        }
    }

    pub fn audit_store(&self) -> Arc<ComplianceAuditStore> {
        self.audit.clone()
    }

    /// Run all configured checks against a payment mandate. Called exactly
    /// once per execution, by the orchestrator's COMPLIANCE phase.
    pub async fn preflight(&self, mandate: &PaymentMandate) -> ComplianceDecision {
        let decision = self.evaluate(mandate).await;
        self.audit
            .append_async(ComplianceAuditEntry {
                mandate_id: mandate.envelope.mandate_id.clone(),
                subject: mandate.envelope.subject.clone(),
                passed: decision.passed,
                reason: decision.reason.clone(),
                provider: decision.provider.clone(),
                rule_id: decision.rule_id.clone(),
                decided_at: now_unix(),
            })
            .await;
        decision
    }

    async fn evaluate(&self, mandate: &PaymentMandate) -> ComplianceDecision {
        let mut decision = ComplianceDecision::pass();
        let agent_id = &mandate.envelope.subject;

        // KYC: mandatory at or above the threshold, fail closed on error.
        if mandate.amount_minor >= self.settings.kyc_threshold_minor {
            match &self.kyc {
                Some(kyc) => match kyc.check_verification(agent_id).await {
                    Ok(true) => decision.kyc_verified = Some(true),
                    Ok(false) => {
                        return ComplianceDecision::fail(
                            "kyc_required_high_value",
                            kyc.name(),
                            "kyc_threshold",
                        );
                    }
                    Err(err) => {
                        tracing::error!(provider = %err.provider, "KYC check failed: {}", err.msg);
                        return ComplianceDecision::fail(
                            "kyc_service_error",
                            &err.provider,
                            "kyc_service_error",
                        );
                    }
                },
                None => {
                    return ComplianceDecision::fail(
                        "kyc_required_high_value",
                        "none",
                        "kyc_unconfigured",
                    );
                }
            }
        }

        // KYT sanctions screen on the destination, and the source when known.
        if let Some(kyt) = &self.kyt {
            let mut addresses = vec![mandate.destination.clone()];
            if let Some(wallet) = &mandate.wallet_id {
                addresses.push(wallet.clone());
            }
            for address in addresses {
                match kyt.screen(&address, &mandate.chain).await {
                    Ok(screen) => {
                        decision.kyt_risk_level = Some(screen.risk_level);
                        if screen.should_block {
                            let mut failed = ComplianceDecision::fail(
                                "sanctions_hit",
                                kyt.name(),
                                screen.rule_id.as_deref().unwrap_or("sanctions"),
                            );
                            failed.kyt_risk_level = Some(screen.risk_level);
                            return failed;
                        }
                        if matches!(screen.risk_level, RiskLevel::High | RiskLevel::Severe) {
                            decision.kyt_review_required = true;
                        }
                    }
                    Err(err) if self.settings.sanctions_fail_closed => {
                        tracing::error!(provider = %err.provider, "KYT screen failed: {}", err.msg);
                        return ComplianceDecision::fail(
                            "sanctions_service_error",
                            &err.provider,
                            "sanctions_service_error",
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            provider = %err.provider,
                            "KYT screen failed, fail-closed disabled: {}",
                            err.msg
                        );
                    }
                }
            }
        }

        // KYA when enforcement is switched on.
        if self.settings.kya_enforcement {
            if let Some(kya) = &self.kya {
                match kya.check_agent(agent_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        return ComplianceDecision::fail("kya_denied", kya.name(), "kya_denylist");
                    }
                    Err(err) => {
                        tracing::error!(provider = %err.provider, "KYA check failed: {}", err.msg);
                        return ComplianceDecision::fail(
                            "kya_service_error",
                            &err.provider,
                            "kya_service_error",
                        );
                    }
                }
            }
        }

        decision
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mandates::{MandateEnvelope, VcProof};

    fn mandate(amount_minor: u64, destination: &str) -> PaymentMandate {
        PaymentMandate {
            envelope: MandateEnvelope {
                mandate_id: "pay-1".into(),
                issuer: "did:tollgate:issuer".into(),
                subject: "agent:test".into(),
                expires_at: now_unix() + 600,
                nonce: "n".into(),
                domain: "merchant.example".into(),
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
            destination: destination.into(),
            merchant_domain: Some("merchant.example".into()),
            audit_hash: "hash".into(),
            wallet_id: None,
        }
    }

    struct StaticKyc {
        verified: Option<bool>,
    }

    #[async_trait]
    impl KycProvider for StaticKyc {
        fn name(&self) -> &str {
            "persona"
        }
        async fn check_verification(&self, _agent_id: &str) -> Result<bool, ProviderError> {
            self.verified.ok_or_else(|| ProviderError {
                provider: "persona".into(),
                msg: "KYC service unavailable".into(),
            })
        }
    }

    struct StaticKyt {
        block: Vec<String>,
        risk: RiskLevel,
        error: bool,
    }

    #[async_trait]
    impl KytProvider for StaticKyt {
        fn name(&self) -> &str {
            "elliptic"
        }
        async fn screen(&self, address: &str, _chain: &str) -> Result<KytScreen, ProviderError> {
            if self.error {
                return Err(ProviderError {
                    provider: "elliptic".into(),
                    msg: "screen timeout".into(),
                });
            }
            Ok(KytScreen {
                should_block: self.block.iter().any(|a| a == address),
                risk_level: self.risk,
                rule_id: Some("ofac_sdn".into()),
            })
        }
    }

    fn gate(
        kyc: Option<Arc<dyn KycProvider>>,
        kyt: Option<Arc<dyn KytProvider>>,
    ) -> ComplianceGate {
        let settings = Arc::new(Settings::dev(vec!["merchant.example".into()]));
        ComplianceGate::new(settings, kyc, kyt, None, Arc::new(ComplianceAuditStore::default()))
    }

    #[async_std::test]
    async fn test_low_value_passes_without_kyc() {
        let gate = gate(None, None);
        let decision = gate.preflight(&mandate(5_000_000 / 100, "0xabc")).await;
        assert!(decision.passed);
    }

    #[async_std::test]
    async fn test_kyc_service_error_fails_closed() {
        let gate = gate(Some(Arc::new(StaticKyc { verified: None })), None);
        let decision = gate.preflight(&mandate(1_000_00, "0xabc")).await;
        assert!(!decision.passed);
        assert_eq!(decision.reason.as_deref(), Some("kyc_service_error"));
        assert_eq!(decision.provider.as_deref(), Some("persona"));
    }

    #[async_std::test]
    async fn test_unverified_kyc_rejected_at_threshold() {
        let gate = gate(Some(Arc::new(StaticKyc { verified: Some(false) })), None);
        let decision = gate.preflight(&mandate(1_000_00, "0xabc")).await;
        assert!(!decision.passed);
        assert_eq!(decision.reason.as_deref(), Some("kyc_required_high_value"));
    }

    #[async_std::test]
    async fn test_sanctions_hit_blocks() {
        let kyt = StaticKyt {
            block: vec!["0xbad".into()],
            risk: RiskLevel::Severe,
            error: false,
        };
        let gate = gate(None, Some(Arc::new(kyt)));
        let decision = gate.preflight(&mandate(100, "0xbad")).await;
        assert!(!decision.passed);
        assert_eq!(decision.reason.as_deref(), Some("sanctions_hit"));
        assert_eq!(decision.provider.as_deref(), Some("elliptic"));
        assert_eq!(decision.rule_id.as_deref(), Some("ofac_sdn"));
    }

    #[async_std::test]
    async fn test_high_risk_passes_with_review_flag() {
        let kyt = StaticKyt {
            block: vec![],
            risk: RiskLevel::High,
            error: false,
        };
        let gate = gate(None, Some(Arc::new(kyt)));
        let decision = gate.preflight(&mandate(100, "0xgrey")).await;
        assert!(decision.passed);
        assert!(decision.kyt_review_required);
    }

    #[async_std::test]
    async fn test_kyt_error_fails_closed() {
        let kyt = StaticKyt {
            block: vec![],
            risk: RiskLevel::Low,
            error: true,
        };
        let gate = gate(None, Some(Arc::new(kyt)));
        let decision = gate.preflight(&mandate(100, "0xabc")).await;
        assert!(!decision.passed);
        assert_eq!(decision.reason.as_deref(), Some("sanctions_service_error"));
    }

    #[async_std::test]
    async fn test_every_decision_is_audited() {
        let gate = gate(None, None);
        gate.preflight(&mandate(100, "0xabc")).await;
        gate.preflight(&mandate(200, "0xdef")).await;
        let store = gate.audit_store();
        assert_eq!(store.len(), 2);
        assert!(store.recent(1)[0].passed);
    }

    #[test]
    fn test_audit_store_bounded_with_capacity_warning() {
        let store = ComplianceAuditStore::with_capacity(100);
        for i in 0..150 {
            store.append(ComplianceAuditEntry {
                mandate_id: format!("mandate_{}", i),
                subject: "agent:test".into(),
                passed: true,
                reason: None,
                provider: None,
                rule_id: None,
                decided_at: now_unix(),
            });
        }
        assert_eq!(store.len(), 100);
        // Oldest entries were dropped.
        let recent = store.recent(100);
        assert_eq!(recent.first().unwrap().mandate_id, "mandate_149");
        assert_eq!(recent.last().unwrap().mandate_id, "mandate_50");
    }
}
