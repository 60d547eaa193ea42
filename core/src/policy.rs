// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Spending policy engine.
//!
//! One policy per agent. Limits are checked inclusively: an amount exactly at
//! a limit passes, one minor unit above fails. `spent_total` and each
//! window's `current_spent` only ever grow between window resets; a reset
//! zeroes `current_spent` and advances `window_start` by exactly one window
//! length per elapsed window.

use crate::helpers::{normalize, now_unix};
use async_std::sync::{Arc, Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;

pub const DAY_SECS: u64 = 24 * 3600;
pub const WEEK_SECS: u64 = 7 * DAY_SECS;
/// Months are fixed 30-day windows for limit purposes.
pub const MONTH_SECS: u64 = 30 * DAY_SECS;

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum PolicyViolation {
    #[snafu(display("per-transaction limit exceeded"))]
    PerTxLimitExceeded,

    #[snafu(display("total limit exceeded"))]
    TotalLimitExceeded,

    #[snafu(display("daily limit exceeded"))]
    DailyLimitExceeded,

    #[snafu(display("weekly limit exceeded"))]
    WeeklyLimitExceeded,

    #[snafu(display("monthly limit exceeded"))]
    MonthlyLimitExceeded,

    #[snafu(display("destination is not on the allow-list"))]
    DestinationNotAllowlisted,

    #[snafu(display("destination is blocked"))]
    DestinationBlocked,

    #[snafu(display("chain is not on the allow-list"))]
    ChainNotAllowlisted,

    #[snafu(display("token is not on the allow-list"))]
    TokenNotAllowlisted,

    #[snafu(display("merchant is blocked"))]
    MerchantBlocked,
}

impl PolicyViolation {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::PerTxLimitExceeded => "per_tx_limit_exceeded",
            Self::TotalLimitExceeded => "total_limit_exceeded",
            Self::DailyLimitExceeded => "daily_limit_exceeded",
            Self::WeeklyLimitExceeded => "weekly_limit_exceeded",
            Self::MonthlyLimitExceeded => "monthly_limit_exceeded",
            Self::DestinationNotAllowlisted => "destination_not_allowlisted",
            Self::DestinationBlocked => "destination_blocked",
            Self::ChainNotAllowlisted => "chain_not_allowlisted",
            Self::TokenNotAllowlisted => "token_not_allowlisted",
            Self::MerchantBlocked => "merchant_blocked",
        }
    }
}

#[derive(Debug, Snafu)]
pub enum PolicyStoreError {
    #[snafu(display("policy store backend failed: {}", msg))]
    Backend { msg: String },
}

/// Rolling spend window with a fixed length.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindowLimit {
    pub window_start: u64,
    pub window_secs: u64,
    pub limit_amount: Decimal,
    pub current_spent: Decimal,
}

impl TimeWindowLimit {
    pub fn new(window_secs: u64, limit_amount: Decimal) -> Self {
        Self {
            window_start: now_unix(),
            window_secs,
            limit_amount,
            current_spent: Decimal::ZERO,
        }
    }

    /// Zero the window if it has lapsed, advancing `window_start` by whole
    /// window lengths. Returns whether a reset happened.
    pub fn reset_if_expired_at(&mut self, now: u64) -> bool {
        if now < self.window_start + self.window_secs {
            return false;
        }
        let elapsed_windows = (now - self.window_start) / self.window_secs;
        self.window_start += elapsed_windows * self.window_secs;
        self.current_spent = Decimal::ZERO;
        true
    }

    fn would_exceed(&self, amount: Decimal) -> bool {
        self.current_spent + amount > self.limit_amount
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingPolicy {
    pub agent_id: String,
    pub limit_per_tx: Decimal,
    pub limit_total: Decimal,
    pub spent_total: Decimal,
    pub daily_limit: Option<TimeWindowLimit>,
    pub weekly_limit: Option<TimeWindowLimit>,
    pub monthly_limit: Option<TimeWindowLimit>,
    pub allowed_chains: Vec<String>,
    pub allowed_tokens: Vec<String>,
    pub allowed_destination_addresses: Vec<String>,
    pub blocked_destination_addresses: Vec<String>,
    pub blocked_merchants: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SpendingPolicy {
    pub fn new(agent_id: &str, limit_per_tx: Decimal, limit_total: Decimal) -> Self {
        let now = now_unix();
        Self {
            agent_id: agent_id.to_string(),
            limit_per_tx,
            limit_total,
            spent_total: Decimal::ZERO,
            daily_limit: None,
            weekly_limit: None,
            monthly_limit: None,
            allowed_chains: vec![],
            allowed_tokens: vec![],
            allowed_destination_addresses: vec![],
            blocked_destination_addresses: vec![],
            blocked_merchants: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    fn windows_mut(&mut self) -> [(&'static str, Option<&mut TimeWindowLimit>); 3] {
        [
            ("daily", self.daily_limit.as_mut()),
            ("weekly", self.weekly_limit.as_mut()),
            ("monthly", self.monthly_limit.as_mut()),
        ]
    }

    /// Check amount + fee against the per-transaction, lifetime, window, and
    /// merchant rules. Expired windows are reset first.
    pub fn validate_payment(
        &mut self,
        amount: Decimal,
        fee: Decimal,
        merchant_id: Option<&str>,
    ) -> Result<(), PolicyViolation> {
        self.validate_payment_at(amount, fee, merchant_id, now_unix())
    }

    pub fn validate_payment_at(
        &mut self,
        amount: Decimal,
        fee: Decimal,
        merchant_id: Option<&str>,
        now: u64,
    ) -> Result<(), PolicyViolation> {
        let charged = amount + fee;
        if charged > self.limit_per_tx {
            return Err(PolicyViolation::PerTxLimitExceeded);
        }
        if self.spent_total + charged > self.limit_total {
            return Err(PolicyViolation::TotalLimitExceeded);
        }
        if let Some(merchant) = merchant_id {
            if self
                .blocked_merchants
                .iter()
                .any(|m| m.eq_ignore_ascii_case(merchant))
            {
                return Err(PolicyViolation::MerchantBlocked);
            }
        }
        for (name, window) in self.windows_mut() {
            if let Some(window) = window {
                window.reset_if_expired_at(now);
                if window.would_exceed(amount) {
                    return Err(match name {
                        "daily" => PolicyViolation::DailyLimitExceeded,
                        "weekly" => PolicyViolation::WeeklyLimitExceeded,
                        _ => PolicyViolation::MonthlyLimitExceeded,
                    });
                }
            }
        }
        Ok(())
    }

    /// Guardrails on where the money may go. Deny wins over allow.
    pub fn validate_execution_context(
        &self,
        destination: &str,
        chain: &str,
        token: &str,
    ) -> Result<(), PolicyViolation> {
        let destination = normalize(destination);
        if self
            .blocked_destination_addresses
            .iter()
            .any(|a| normalize(a) == destination)
        {
            return Err(PolicyViolation::DestinationBlocked);
        }
        if !self.allowed_destination_addresses.is_empty()
            && !self
                .allowed_destination_addresses
                .iter()
                .any(|a| normalize(a) == destination)
        {
            return Err(PolicyViolation::DestinationNotAllowlisted);
        }
        if !self.allowed_chains.is_empty()
            && !self.allowed_chains.iter().any(|c| normalize(c) == normalize(chain))
        {
            return Err(PolicyViolation::ChainNotAllowlisted);
        }
        if !self.allowed_tokens.is_empty()
            && !self.allowed_tokens.iter().any(|t| normalize(t) == normalize(token))
        {
            return Err(PolicyViolation::TokenNotAllowlisted);
        }
        Ok(())
    }

    /// Apply a spend. Expired windows reset first; totals only grow.
    pub fn record_spend_at(&mut self, amount: Decimal, now: u64) {
        self.spent_total += amount;
        for (_, window) in self.windows_mut() {
            if let Some(window) = window {
                window.reset_if_expired_at(now);
                window.current_spent += amount;
            }
        }
        self.updated_at = now;
    }
}

/// Default policy issued on first use: $500 per transaction, $5,000 lifetime,
/// $1,000/day.
pub fn create_default_policy(agent_id: &str) -> SpendingPolicy {
    let mut policy = SpendingPolicy::new(agent_id, Decimal::new(500, 0), Decimal::new(5_000, 0));
    policy.daily_limit = Some(TimeWindowLimit::new(DAY_SECS, Decimal::new(1_000, 0)));
    policy
}

/// Store of per-agent policies. Each policy sits behind its own lock so
/// `record_spend` for one agent never serializes against another.
#[derive(Clone, Default)]
pub struct PolicyStore {
    policies: Arc<RwLock<HashMap<String, Arc<Mutex<SpendingPolicy>>>>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, agent_id: &str) -> Arc<Mutex<SpendingPolicy>> {
        {
            let policies = self.policies.read().await;
            if let Some(slot) = policies.get(agent_id) {
                return slot.clone();
            }
        }
        let mut policies = self.policies.write().await;
        policies
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(create_default_policy(agent_id))))
            .clone()
    }

    pub async fn set_policy(&self, agent_id: &str, policy: SpendingPolicy) {
        let mut policies = self.policies.write().await;
        policies.insert(agent_id.to_string(), Arc::new(Mutex::new(policy)));
    }

    pub async fn fetch_policy(&self, agent_id: &str) -> Option<SpendingPolicy> {
        let slot = {
            let policies = self.policies.read().await;
            policies.get(agent_id).cloned()
        }?;
        let policy = slot.lock().await;
        Some(policy.clone())
    }

    /// Validate a payment against the agent's policy (created with defaults
    /// if absent), without recording anything.
    pub async fn validate_payment(
        &self,
        agent_id: &str,
        amount: Decimal,
        fee: Decimal,
        merchant_id: Option<&str>,
    ) -> Result<(), PolicyViolation> {
        let slot = self.slot(agent_id).await;
        let mut policy = slot.lock().await;
        policy.validate_payment(amount, fee, merchant_id)
    }

    pub async fn validate_execution_context(
        &self,
        agent_id: &str,
        destination: &str,
        chain: &str,
        token: &str,
    ) -> Result<(), PolicyViolation> {
        let slot = self.slot(agent_id).await;
        let policy = slot.lock().await;
        policy.validate_execution_context(destination, chain, token)
    }

    /// Record a spend under the agent's exclusive lock. Callers must treat a
    /// failure here as CRITICAL: an unrecorded spend breaks the policy
    /// invariant.
    pub async fn record_spend(
        &self,
        agent_id: &str,
        amount: Decimal,
    ) -> Result<(), PolicyStoreError> {
        let slot = self.slot(agent_id).await;
        let mut policy = slot.lock().await;
        policy.record_spend_at(amount, now_unix());
        Ok(())
    }

    /// Sweep every policy, resetting lapsed windows. Returns the number of
    /// windows reset; the scheduler runs this daily at midnight UTC.
    pub async fn reset_expired_windows(&self) -> usize {
        let slots: Vec<Arc<Mutex<SpendingPolicy>>> = {
            let policies = self.policies.read().await;
            policies.values().cloned().collect()
        };
        let now = now_unix();
        let mut reset = 0;
        for slot in slots {
            let mut policy = slot.lock().await;
            for (_, window) in policy.windows_mut() {
                if let Some(window) = window {
                    if window.reset_if_expired_at(now) {
                        reset += 1;
                    }
                }
            }
        }
        reset
    }
}
