// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Chain executor: signs, broadcasts, and confirms settlement transactions.
//!
//! The executor assumes its input has already cleared verification, policy,
//! and compliance. It does NOT re-check either — gating is the
//! orchestrator's responsibility, and re-invoking the compliance gate here
//! would double-count decisions in the audit store.
//!
//! Nonce discipline: a nonce is allocated per (chain, sender) under a lock
//! and released ONLY when the broadcast itself failed. Once a transaction
//! has hit the mempool, its nonce is burned from our point of view even if
//! confirmation later times out; releasing it would let an unrelated
//! transaction collide with the still-pending one.

use crate::config::Settings;
use crate::mandates::PaymentMandate;
use async_std::sync::{Arc, Mutex};
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::Snafu;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Confirmations required before a transaction is considered settled.
/// Testnets mirror their mainnets; anything unknown gets the most
/// conservative count.
pub const CHAIN_CONFIRMATIONS: &[(&str, u32)] = &[
    ("ethereum", 12),
    ("polygon", 10),
    ("base", 3),
    ("arbitrum", 3),
    ("optimism", 3),
    ("sepolia", 12),
    ("base_sepolia", 3),
    ("polygon_amoy", 10),
    ("arbitrum_sepolia", 3),
    ("optimism_sepolia", 3),
];

pub const DEFAULT_CONFIRMATIONS: u32 = 12;
pub const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_GAS_LIMIT: u64 = 120_000;

/// Case-insensitive lookup into [`CHAIN_CONFIRMATIONS`].
pub fn confirmations_required(chain: &str) -> u32 {
    let chain = chain.trim();
    CHAIN_CONFIRMATIONS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(chain))
        .map(|(_, count)| *count)
        .unwrap_or(DEFAULT_CONFIRMATIONS)
}

#[derive(Clone, Debug, Snafu, Serialize, Deserialize)]
pub enum ExecutionError {
    #[snafu(display("unknown chain: {}", chain))]
    UnknownChain { chain: String },

    #[snafu(display("transaction broadcast failed: {}", msg))]
    BroadcastFailed { msg: String },

    #[snafu(display("rpc provider unavailable: {}", msg))]
    ProviderUnavailable { msg: String },

    #[snafu(display("confirmation timeout waiting on {}", tx_hash))]
    ConfirmationTimeout { tx_hash: String },

    #[snafu(display("transaction {} reverted on-chain", tx_hash))]
    Reverted { tx_hash: String },

    #[snafu(display("signer failure: {}", msg))]
    SignerFailure { msg: String },

    #[snafu(display("sponsor cap exceeded for stage {}: {}", stage, msg))]
    SponsorCapExceeded { stage: String, msg: String },

    #[snafu(display("invalid sponsor cap configuration: {}", msg))]
    SponsorCapConfig { msg: String },
}

impl ExecutionError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnknownChain { .. } => "chain_not_supported",
            Self::BroadcastFailed { .. } => "broadcast_failed",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ConfirmationTimeout { .. } => "confirmation_timeout",
            Self::Reverted { .. } => "revert",
            Self::SignerFailure { .. } => "signer_failure",
            Self::SponsorCapExceeded { .. } => "sponsor_cap_exceeded",
            Self::SponsorCapConfig { .. } => "sponsor_cap_config_invalid",
        }
    }

    /// Whether the caller may retry the dispatch with the same mandate.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::BroadcastFailed { .. } | Self::ProviderUnavailable { .. }
        )
    }

    /// Whether the broadcast reached the chain and needs reconciliation
    /// rather than a retry.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, Self::ConfirmationTimeout { .. })
    }
}

/// Proof of a completed (broadcast and confirmed) settlement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReceipt {
    pub tx_hash: String,
    pub chain: String,
    pub block_number: u64,
    pub audit_anchor: String,
}

/// Unsigned settlement transaction handed to a signer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    pub chain: String,
    pub chain_id: u64,
    pub sender: String,
    pub nonce: u64,
    pub destination: String,
    pub token: String,
    pub amount_minor: u64,
    pub gas_limit: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

#[async_trait]
pub trait TxSigner: Send + Sync {
    fn address(&self) -> String;
    async fn sign_transaction(&self, tx: &TxRequest) -> Result<SignedTx, ExecutionError>;
}

/// Signer holding a raw private key in process memory. Development only;
/// production deployments get a warning at construction.
pub struct LocalSigner {
    wallet: LocalWallet,
    address: String,
}

impl LocalSigner {
    pub fn new(private_key_hex: &str, settings: &Settings) -> Result<Self, ExecutionError> {
        if private_key_hex.is_empty() {
            return Err(ExecutionError::SignerFailure {
                msg: "a sender private key is required for LocalSigner".into(),
            });
        }
        let key = private_key_hex.strip_prefix("0x").unwrap_or(private_key_hex);
        let wallet = LocalWallet::from_str(key).map_err(|err| ExecutionError::SignerFailure {
            msg: err.to_string(),
        })?;
        if settings.is_production() {
            tracing::warn!(
                "LocalSigner stores private keys in memory and is not suitable for production; \
                 use an MPC signer (Turnkey/Fireblocks) instead"
            );
        }
        let address = format!("{:?}", wallet.address());
        Ok(Self { wallet, address })
    }
}

#[async_trait]
impl TxSigner for LocalSigner {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign_transaction(&self, tx: &TxRequest) -> Result<SignedTx, ExecutionError> {
        let payload = bincode::serialize(tx).map_err(|err| ExecutionError::SignerFailure {
            msg: err.to_string(),
        })?;
        let signature = self
            .wallet
            .sign_message(&payload)
            .await
            .map_err(|err| ExecutionError::SignerFailure {
                msg: err.to_string(),
            })?;
        Ok(SignedTx {
            payload,
            signature: signature.to_vec(),
        })
    }
}

/// MPC signer capability surface (Turnkey / Fireblocks shape). Requests are
/// keyed by a credential id; the actual HSM round-trip lives behind the
/// provider integration, outside this crate.
pub struct MpcSigner {
    pub provider: String,
    pub api_base: String,
    pub credential_id: String,
    pub address: String,
}

impl MpcSigner {
    pub fn new(provider: &str, api_base: &str, credential_id: &str, address: &str) -> Self {
        Self {
            provider: provider.to_string(),
            api_base: api_base.to_string(),
            credential_id: credential_id.to_string(),
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl TxSigner for MpcSigner {
    fn address(&self) -> String {
        self.address.clone()
    }

    async fn sign_transaction(&self, tx: &TxRequest) -> Result<SignedTx, ExecutionError> {
        let payload = bincode::serialize(tx).map_err(|err| ExecutionError::SignerFailure {
            msg: err.to_string(),
        })?;
        // Attestation over the payload keyed by the credential; the provider
        // bridge swaps this for the real MPC signature.
        let mut hasher = Sha256::new();
        hasher.update(self.credential_id.as_bytes());
        hasher.update(&payload);
        Ok(SignedTx {
            payload,
            signature: hasher.finalize().to_vec(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SponsorCaps {
    pub per_op_wei: u128,
    pub daily_wei: u128,
}

fn default_caps(stage: &str) -> SponsorCaps {
    match stage {
        "pilot" => SponsorCaps {
            per_op_wei: 5_000_000_000_000_000,        // 0.005 ETH
            daily_wei: 50_000_000_000_000_000,        // 0.05 ETH
        },
        _ => SponsorCaps {
            per_op_wei: 20_000_000_000_000_000,       // 0.02 ETH
            daily_wei: 500_000_000_000_000_000,       // 0.5 ETH
        },
    }
}

/// Paymaster spend guard for sponsored (ERC-4337) operations: a hard cap per
/// operation and a rolling daily cap.
pub struct SponsorCapGuard {
    stage: String,
    caps: SponsorCaps,
    used: Mutex<DailyUsage>,
}

#[derive(Clone, Copy, Debug, Default)]
struct DailyUsage {
    day: u64,
    spent_wei: u128,
}

impl SponsorCapGuard {
    pub fn new(stage: &str, stage_caps_json: Option<&str>) -> Result<Self, ExecutionError> {
        let caps = match stage_caps_json {
            Some(json) => {
                let table: HashMap<String, SponsorCaps> =
                    serde_json::from_str(json).map_err(|err| ExecutionError::SponsorCapConfig {
                        msg: err.to_string(),
                    })?;
                *table
                    .get(stage)
                    .ok_or_else(|| ExecutionError::SponsorCapConfig {
                        msg: format!("no caps configured for stage {}", stage),
                    })?
            }
            None => default_caps(stage),
        };
        Ok(Self {
            stage: stage.to_string(),
            caps,
            used: Mutex::new(DailyUsage::default()),
        })
    }

    pub fn current_caps(&self) -> SponsorCaps {
        self.caps
    }

    /// Reserve sponsored gas for one operation, failing when either cap
    /// would be breached.
    pub async fn reserve(&self, chain: &str, estimated_cost_wei: u128) -> Result<(), ExecutionError> {
        self.reserve_at(chain, estimated_cost_wei, crate::helpers::now_unix()).await
    }

    pub async fn reserve_at(
        &self,
        chain: &str,
        estimated_cost_wei: u128,
        now: u64,
    ) -> Result<(), ExecutionError> {
        if estimated_cost_wei > self.caps.per_op_wei {
            return Err(ExecutionError::SponsorCapExceeded {
                stage: self.stage.clone(),
                msg: format!(
                    "operation on {} estimated at {} wei exceeds per-op cap {}",
                    chain, estimated_cost_wei, self.caps.per_op_wei
                ),
            });
        }
        let mut used = self.used.lock().await;
        let today = now / (24 * 3600);
        if used.day != today {
            used.day = today;
            used.spent_wei = 0;
        }
        if used.spent_wei + estimated_cost_wei > self.caps.daily_wei {
            return Err(ExecutionError::SponsorCapExceeded {
                stage: self.stage.clone(),
                msg: format!(
                    "daily sponsored spend {} + {} wei exceeds cap {}",
                    used.spent_wei, estimated_cost_wei, self.caps.daily_wei
                ),
            });
        }
        used.spent_wei += estimated_cost_wei;
        Ok(())
    }

    pub async fn snapshot_usage(&self) -> serde_json::Value {
        let used = self.used.lock().await;
        serde_json::json!({
            "stage": self.stage,
            "caps": {
                "per_op_wei": self.caps.per_op_wei.to_string(),
                "daily_wei": self.caps.daily_wei.to_string(),
            },
            "spent_today_wei": used.spent_wei.to_string(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Confirmed { block_number: u64 },
    Reverted,
    TimedOut,
}

/// RPC seam. The live implementation wraps an ethers provider per chain;
/// `simulated` mode and tests use [`SimulatedEvm`].
#[async_trait]
pub trait EvmRpc: Send + Sync {
    async fn transaction_count(&self, chain: &str, sender: &str) -> Result<u64, ExecutionError>;
    async fn send_raw_transaction(&self, chain: &str, tx: &SignedTx)
        -> Result<String, ExecutionError>;
    async fn wait_for_confirmations(
        &self,
        chain: &str,
        tx_hash: &str,
        required: u32,
        timeout: Duration,
    ) -> Result<ConfirmationOutcome, ExecutionError>;
}

/// Per-(chain, sender) nonce allocation. Strictly increasing; a released
/// nonce (broadcast never happened) is handed out again on the next
/// allocation.
#[derive(Default)]
pub struct NonceAllocator {
    next: Mutex<HashMap<(String, String), u64>>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn allocate(
        &self,
        chain: &str,
        sender: &str,
        rpc: &dyn EvmRpc,
    ) -> Result<u64, ExecutionError> {
        let mut next = self.next.lock().await;
        let key = (chain.to_string(), sender.to_string());
        if let Some(slot) = next.get_mut(&key) {
            let nonce = *slot;
            *slot += 1;
            return Ok(nonce);
        }
        let count = rpc.transaction_count(chain, sender).await?;
        next.insert(key, count + 1);
        Ok(count)
    }

    /// Return a nonce whose broadcast never happened. Only the most recent
    /// allocation can be unwound; anything older is pinned by later
    /// transactions.
    pub async fn release(&self, chain: &str, sender: &str, nonce: u64) {
        let mut next = self.next.lock().await;
        let key = (chain.to_string(), sender.to_string());
        if let Some(slot) = next.get_mut(&key) {
            if *slot == nonce + 1 {
                *slot = nonce;
            } else {
                tracing::warn!(
                    chain,
                    sender,
                    nonce,
                    "nonce release skipped: later allocations exist"
                );
            }
        }
    }
}

pub struct ChainExecutor {
    settings: Arc<Settings>,
    rpc: Arc<dyn EvmRpc>,
    signer: Arc<dyn TxSigner>,
    nonces: NonceAllocator,
    sponsor: Option<SponsorCapGuard>,
    confirmation_timeout: Duration,
}

impl ChainExecutor {
    pub fn new(
        settings: Arc<Settings>,
        rpc: Arc<dyn EvmRpc>,
        signer: Arc<dyn TxSigner>,
        sponsor: Option<SponsorCapGuard>,
    ) -> Self {
        Self {
            settings,
            rpc,
            signer,
            nonces: NonceAllocator::new(),
            sponsor,
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = timeout;
        self
    }

    /// Sign, broadcast, and confirm the settlement described by a validated
    /// payment mandate. Policy and compliance are NOT re-checked here.
    pub async fn dispatch_payment(
        &self,
        mandate: &PaymentMandate,
    ) -> Result<ChainReceipt, ExecutionError> {
        let chain_spec =
            self.settings
                .chain(&mandate.chain)
                .ok_or_else(|| ExecutionError::UnknownChain {
                    chain: mandate.chain.clone(),
                })?;
        let chain = chain_spec.name.clone();
        let sender = self.signer.address();

        if let Some(sponsor) = &self.sponsor {
            // 2 gwei flat estimate against the gas limit; live mode swaps in
            // the provider's fee oracle.
            let estimated_cost_wei = DEFAULT_GAS_LIMIT as u128 * 2_000_000_000;
            sponsor.reserve(&chain, estimated_cost_wei).await?;
        }

        let nonce = self.nonces.allocate(&chain, &sender, self.rpc.as_ref()).await?;
        let request = TxRequest {
            chain: chain.clone(),
            chain_id: chain_spec.chain_id,
            sender: sender.clone(),
            nonce,
            destination: mandate.destination.clone(),
            token: mandate.token.clone(),
            amount_minor: mandate.amount_minor,
            gas_limit: DEFAULT_GAS_LIMIT,
        };

        let mut broadcast_success = false;
        let result = self
            .broadcast_and_confirm(mandate, &request, &mut broadcast_success)
            .await;
        if result.is_err() && !broadcast_success {
            // Broadcast never reached the chain; the nonce is safe to hand
            // out again.
            self.nonces.release(&chain, &sender, nonce).await;
        }
        result
    }

    async fn broadcast_and_confirm(
        &self,
        mandate: &PaymentMandate,
        request: &TxRequest,
        broadcast_success: &mut bool,
    ) -> Result<ChainReceipt, ExecutionError> {
        let signed = self.signer.sign_transaction(request).await?;

        let tx_hash = self
            .rpc
            .send_raw_transaction(&request.chain, &signed)
            .await?;
        *broadcast_success = true;
        tracing::info!(
            chain = %request.chain,
            nonce = request.nonce,
            tx_hash = %tx_hash,
            "settlement transaction broadcast"
        );

        let required = confirmations_required(&request.chain);
        match self
            .rpc
            .wait_for_confirmations(&request.chain, &tx_hash, required, self.confirmation_timeout)
            .await?
        {
            ConfirmationOutcome::Confirmed { block_number } => Ok(ChainReceipt {
                tx_hash,
                chain: request.chain.clone(),
                block_number,
                audit_anchor: format!("merkle::{}", mandate.audit_hash),
            }),
            ConfirmationOutcome::Reverted => Err(ExecutionError::Reverted { tx_hash }),
            ConfirmationOutcome::TimedOut => Err(ExecutionError::ConfirmationTimeout { tx_hash }),
        }
    }
}

/// Deterministic in-process chain for `simulated` execution mode and tests.
/// Broadcasts append to a per-chain log; confirmations are immediate unless a
/// fault is injected.
pub struct SimulatedEvm {
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    broadcasts: Vec<(String, String)>,
    heights: HashMap<String, u64>,
    faults: SimFaults,
}

#[derive(Default)]
struct SimFaults {
    fail_broadcasts: u32,
    unavailable: bool,
    timeout_confirmations: bool,
    revert_confirmations: bool,
}

impl Default for SimulatedEvm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEvm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
        }
    }

    pub async fn broadcast_count(&self) -> usize {
        self.state.lock().await.broadcasts.len()
    }
}

#[cfg(any(test, feature = "testing"))]
impl SimulatedEvm {
    /// Fail the next `n` broadcasts before they reach the chain.
    pub async fn fail_next_broadcasts(&self, n: u32) {
        self.state.lock().await.faults.fail_broadcasts = n;
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.faults.unavailable = unavailable;
    }

    /// Subsequent confirmations time out; broadcasts still land.
    pub async fn timeout_confirmations(&self, on: bool) {
        self.state.lock().await.faults.timeout_confirmations = on;
    }

    pub async fn revert_confirmations(&self, on: bool) {
        self.state.lock().await.faults.revert_confirmations = on;
    }
}

#[async_trait]
impl EvmRpc for SimulatedEvm {
    async fn transaction_count(&self, _chain: &str, _sender: &str) -> Result<u64, ExecutionError> {
        Ok(0)
    }

    async fn send_raw_transaction(
        &self,
        chain: &str,
        tx: &SignedTx,
    ) -> Result<String, ExecutionError> {
        let mut state = self.state.lock().await;
        if state.faults.unavailable {
            return Err(ExecutionError::ProviderUnavailable {
                msg: "simulated rpc offline".into(),
            });
        }
        if state.faults.fail_broadcasts > 0 {
            state.faults.fail_broadcasts -= 1;
            return Err(ExecutionError::BroadcastFailed {
                msg: "simulated broadcast rejection".into(),
            });
        }
        let mut hasher = Sha256::new();
        hasher.update(chain.as_bytes());
        hasher.update(&tx.payload);
        hasher.update(&tx.signature);
        let tx_hash = format!("0x{}", hex::encode(hasher.finalize()));
        state.broadcasts.push((chain.to_string(), tx_hash.clone()));
        *state.heights.entry(chain.to_string()).or_insert(0) += 1;
        Ok(tx_hash)
    }

    async fn wait_for_confirmations(
        &self,
        chain: &str,
        _tx_hash: &str,
        _required: u32,
        _timeout: Duration,
    ) -> Result<ConfirmationOutcome, ExecutionError> {
        let state = self.state.lock().await;
        if state.faults.timeout_confirmations {
            return Ok(ConfirmationOutcome::TimedOut);
        }
        if state.faults.revert_confirmations {
            return Ok(ConfirmationOutcome::Reverted);
        }
        Ok(ConfirmationOutcome::Confirmed {
            block_number: state.heights.get(chain).copied().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mandates::{MandateEnvelope, VcProof};

    const TEST_PRIVATE_KEY: &str =
        "0x1234567890123456789012345678901234567890123456789012345678901234";

    fn mandate(id: &str, chain: &str) -> PaymentMandate {
        PaymentMandate {
            envelope: MandateEnvelope {
                mandate_id: id.into(),
                issuer: "did:tollgate:issuer".into(),
                subject: "agent:test".into(),
                expires_at: 9_999_999_999,
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
            chain: chain.into(),
            token: "USDC".into(),
            amount_minor: 5_000_000,
            destination: "0xabc0000000000000000000000000000000000000".into(),
            merchant_domain: Some("merchant.example".into()),
            audit_hash: "audit-hash".into(),
            wallet_id: None,
        }
    }

    fn executor(rpc: Arc<SimulatedEvm>) -> ChainExecutor {
        let settings = Arc::new(Settings::dev(vec!["merchant.example".into()]));
        let signer = Arc::new(LocalSigner::new(TEST_PRIVATE_KEY, &settings).unwrap());
        ChainExecutor::new(settings, rpc, signer, None)
    }

    #[test]
    fn test_confirmation_counts_configured() {
        for chain in ["ethereum", "base", "polygon", "arbitrum", "optimism"] {
            assert!(CHAIN_CONFIRMATIONS.iter().any(|(name, _)| *name == chain));
        }
        assert_eq!(confirmations_required("ethereum"), 12);
        assert_eq!(confirmations_required("polygon"), 10);
        assert_eq!(confirmations_required("base"), 3);
        assert_eq!(confirmations_required("arbitrum"), 3);
        assert_eq!(confirmations_required("optimism"), 3);
    }

    #[test]
    fn test_unknown_chain_gets_safe_default() {
        assert_eq!(confirmations_required("unknown_chain"), 12);
    }

    #[test]
    fn test_chain_lookup_case_insensitive() {
        assert_eq!(confirmations_required("ETHEREUM"), 12);
        assert_eq!(confirmations_required("Base"), 3);
    }

    #[test]
    fn test_testnets_match_mainnets() {
        assert_eq!(
            confirmations_required("base_sepolia"),
            confirmations_required("base")
        );
        assert_eq!(
            confirmations_required("polygon_amoy"),
            confirmations_required("polygon")
        );
    }

    #[test]
    fn test_no_chain_has_zero_confirmations() {
        for (chain, count) in CHAIN_CONFIRMATIONS {
            assert!(*count > 0, "chain {} must require at least 1 confirmation", chain);
        }
    }

    #[test]
    fn test_ethereum_has_highest_confirmations() {
        let eth = confirmations_required("ethereum");
        for (_, count) in CHAIN_CONFIRMATIONS {
            assert!(*count <= eth);
        }
    }

    #[test]
    fn test_local_signer_requires_private_key() {
        let settings = Settings::dev(vec![]);
        assert!(LocalSigner::new("", &settings).is_err());
    }

    #[test]
    fn test_local_signer_derives_address() {
        let settings = Settings::dev(vec![]);
        let signer = LocalSigner::new(TEST_PRIVATE_KEY, &settings).unwrap();
        let address = signer.address();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
    }

    #[async_std::test]
    async fn test_dispatch_happy_path() {
        let rpc = Arc::new(SimulatedEvm::new());
        let exec = executor(rpc.clone());
        let receipt = exec.dispatch_payment(&mandate("pay-1", "base_sepolia")).await.unwrap();
        assert!(receipt.tx_hash.starts_with("0x"));
        assert_eq!(receipt.chain, "base_sepolia");
        assert_eq!(receipt.audit_anchor, "merkle::audit-hash");
        assert_eq!(rpc.broadcast_count().await, 1);
    }

    #[async_std::test]
    async fn test_unknown_chain_rejected_before_broadcast() {
        let rpc = Arc::new(SimulatedEvm::new());
        let exec = executor(rpc.clone());
        let err = exec.dispatch_payment(&mandate("pay-1", "solana")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnknownChain { .. }));
        assert_eq!(rpc.broadcast_count().await, 0);
    }

    #[async_std::test]
    async fn test_nonces_strictly_increasing_on_success() {
        let rpc = Arc::new(SimulatedEvm::new());
        let exec = executor(rpc.clone());
        for i in 0..3 {
            exec.dispatch_payment(&mandate(&format!("pay-{}", i), "base")).await.unwrap();
        }
        let settings = Arc::new(Settings::dev(vec![]));
        let sender = LocalSigner::new(TEST_PRIVATE_KEY, &settings).unwrap().address();
        // The next allocation continues the sequence with no gaps.
        let next = exec.nonces.allocate("base", &sender, rpc.as_ref()).await.unwrap();
        assert_eq!(next, 3);
    }

    #[async_std::test]
    async fn test_broadcast_failure_releases_nonce() {
        let rpc = Arc::new(SimulatedEvm::new());
        let exec = executor(rpc.clone());
        rpc.fail_next_broadcasts(1).await;

        let err = exec.dispatch_payment(&mandate("pay-1", "base")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::BroadcastFailed { .. }));
        assert!(err.retryable());

        // The retry reuses nonce 0: the follow-up dispatch succeeds and the
        // allocator is at 1 afterwards.
        exec.dispatch_payment(&mandate("pay-1", "base")).await.unwrap();
        let settings = Arc::new(Settings::dev(vec![]));
        let sender = LocalSigner::new(TEST_PRIVATE_KEY, &settings).unwrap().address();
        let next = exec.nonces.allocate("base", &sender, rpc.as_ref()).await.unwrap();
        assert_eq!(next, 1);
    }

    #[async_std::test]
    async fn test_confirmation_timeout_retains_nonce() {
        let rpc = Arc::new(SimulatedEvm::new());
        let exec = executor(rpc.clone());
        rpc.timeout_confirmations(true).await;

        let err = exec.dispatch_payment(&mandate("pay-1", "base")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ConfirmationTimeout { .. }));
        assert!(err.needs_reconciliation());
        assert_eq!(rpc.broadcast_count().await, 1);

        // The nonce was burned: the next dispatch uses nonce 1.
        rpc.timeout_confirmations(false).await;
        exec.dispatch_payment(&mandate("pay-2", "base")).await.unwrap();
        let settings = Arc::new(Settings::dev(vec![]));
        let sender = LocalSigner::new(TEST_PRIVATE_KEY, &settings).unwrap().address();
        let next = exec.nonces.allocate("base", &sender, rpc.as_ref()).await.unwrap();
        assert_eq!(next, 2);
    }

    #[async_std::test]
    async fn test_revert_is_terminal_and_retains_nonce() {
        let rpc = Arc::new(SimulatedEvm::new());
        let exec = executor(rpc.clone());
        rpc.revert_confirmations(true).await;

        let err = exec.dispatch_payment(&mandate("pay-1", "base")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Reverted { .. }));
        assert!(!err.retryable());
        assert_eq!(rpc.broadcast_count().await, 1);
    }

    #[async_std::test]
    async fn test_provider_unavailable_is_retryable() {
        let rpc = Arc::new(SimulatedEvm::new());
        let exec = executor(rpc.clone());
        rpc.set_unavailable(true).await;
        let err = exec.dispatch_payment(&mandate("pay-1", "base")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ProviderUnavailable { .. }));
        assert!(err.retryable());
        assert_eq!(rpc.broadcast_count().await, 0);
    }

    #[async_std::test]
    async fn test_sponsor_cap_per_op() {
        let guard = SponsorCapGuard::new("pilot", None).unwrap();
        let over = guard.current_caps().per_op_wei + 1;
        let err = guard.reserve("base_sepolia", over).await.unwrap_err();
        assert!(matches!(err, ExecutionError::SponsorCapExceeded { .. }));
    }

    #[async_std::test]
    async fn test_sponsor_cap_daily_accumulates() {
        let guard = SponsorCapGuard::new(
            "pilot",
            Some(r#"{"pilot":{"per_op_wei":100,"daily_wei":250}}"#),
        )
        .unwrap();
        guard.reserve("base", 100).await.unwrap();
        guard.reserve("base", 100).await.unwrap();
        let err = guard.reserve("base", 100).await.unwrap_err();
        assert!(matches!(err, ExecutionError::SponsorCapExceeded { .. }));
    }

    #[async_std::test]
    async fn test_sponsor_cap_stage_override_json() {
        let guard = SponsorCapGuard::new(
            "pilot",
            Some(r#"{"pilot":{"per_op_wei":2000000000000000000,"daily_wei":3000000000000000000}}"#),
        )
        .unwrap();
        guard.reserve("base_sepolia", 1_000_000_000_000_000_000).await.unwrap();
        let snapshot = guard.snapshot_usage().await;
        assert_eq!(snapshot["stage"], "pilot");
        assert_eq!(snapshot["caps"]["per_op_wei"], "2000000000000000000");
    }

    #[async_std::test]
    async fn test_sponsor_cap_rejects_unknown_fields() {
        let err = SponsorCapGuard::new(
            "pilot",
            Some(r#"{"pilot":{"per_op_wei":1,"daily_wei":2,"weekly_wei":3}}"#),
        )
        .unwrap_err();
        assert!(matches!(err, ExecutionError::SponsorCapConfig { .. }));
    }
}
