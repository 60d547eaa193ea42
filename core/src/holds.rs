// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Authorization holds: reserve funds now, capture or void later.
//!
//! A hold that is neither captured nor voided before its deadline is expired
//! by the scheduler sweep and releases its reservation.

use crate::helpers::{now_unix, prefixed_id};
use async_std::sync::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;

pub const DEFAULT_HOLD_TTL_SECS: u64 = 7 * 24 * 3600;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    Held,
    Captured,
    Voided,
    Expired,
}

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum HoldError {
    #[snafu(display("unknown hold: {}", hold_id))]
    UnknownHold { hold_id: String },

    #[snafu(display("hold {} is {:?}, not held", hold_id, status))]
    NotHeld { hold_id: String, status: HoldStatus },

    #[snafu(display("capture amount exceeds held amount"))]
    OverCapture,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub hold_id: String,
    pub wallet_id: String,
    pub merchant_domain: String,
    pub amount: Decimal,
    pub currency: String,
    pub status: HoldStatus,
    pub expires_at: u64,
    pub created_at: u64,
    pub captured_amount: Option<Decimal>,
}

#[derive(Default)]
pub struct HoldStore {
    holds: Mutex<HashMap<String, Hold>>,
}

impl HoldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        wallet_id: &str,
        merchant_domain: &str,
        amount: Decimal,
        currency: &str,
        ttl_secs: Option<u64>,
    ) -> Hold {
        let now = now_unix();
        let hold = Hold {
            hold_id: prefixed_id("hold"),
            wallet_id: wallet_id.to_string(),
            merchant_domain: merchant_domain.to_string(),
            amount,
            currency: currency.to_string(),
            status: HoldStatus::Held,
            expires_at: now + ttl_secs.unwrap_or(DEFAULT_HOLD_TTL_SECS),
            created_at: now,
            captured_amount: None,
        };
        self.holds
            .lock()
            .await
            .insert(hold.hold_id.clone(), hold.clone());
        hold
    }

    pub async fn get(&self, hold_id: &str) -> Option<Hold> {
        self.holds.lock().await.get(hold_id).cloned()
    }

    /// Capture up to the held amount; partial captures keep the difference
    /// released.
    pub async fn capture(&self, hold_id: &str, amount: Option<Decimal>) -> Result<Hold, HoldError> {
        let mut holds = self.holds.lock().await;
        let hold = holds
            .get_mut(hold_id)
            .ok_or_else(|| HoldError::UnknownHold {
                hold_id: hold_id.to_string(),
            })?;
        if hold.status != HoldStatus::Held {
            return Err(HoldError::NotHeld {
                hold_id: hold_id.to_string(),
                status: hold.status,
            });
        }
        let captured = amount.unwrap_or(hold.amount);
        if captured > hold.amount {
            return Err(HoldError::OverCapture);
        }
        hold.status = HoldStatus::Captured;
        hold.captured_amount = Some(captured);
        Ok(hold.clone())
    }

    pub async fn void(&self, hold_id: &str) -> Result<Hold, HoldError> {
        let mut holds = self.holds.lock().await;
        let hold = holds
            .get_mut(hold_id)
            .ok_or_else(|| HoldError::UnknownHold {
                hold_id: hold_id.to_string(),
            })?;
        if hold.status != HoldStatus::Held {
            return Err(HoldError::NotHeld {
                hold_id: hold_id.to_string(),
                status: hold.status,
            });
        }
        hold.status = HoldStatus::Voided;
        Ok(hold.clone())
    }

    /// Scheduler sweep: expire lapsed holds. Returns how many flipped.
    pub async fn expire_due(&self) -> usize {
        self.expire_due_at(now_unix()).await
    }

    pub async fn expire_due_at(&self, now: u64) -> usize {
        let mut holds = self.holds.lock().await;
        let mut expired = 0;
        for hold in holds.values_mut() {
            if hold.status == HoldStatus::Held && hold.expires_at <= now {
                hold.status = HoldStatus::Expired;
                expired += 1;
                tracing::info!(hold_id = %hold.hold_id, "hold expired");
            }
        }
        expired
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn test_capture_full_amount() {
        let store = HoldStore::new();
        let hold = store
            .create("wallet-1", "merchant.example", Decimal::new(25, 0), "USDC", None)
            .await;
        let captured = store.capture(&hold.hold_id, None).await.unwrap();
        assert_eq!(captured.status, HoldStatus::Captured);
        assert_eq!(captured.captured_amount, Some(Decimal::new(25, 0)));
    }

    #[async_std::test]
    async fn test_partial_capture_and_over_capture() {
        let store = HoldStore::new();
        let hold = store
            .create("wallet-1", "merchant.example", Decimal::new(25, 0), "USDC", None)
            .await;
        let err = store
            .capture(&hold.hold_id, Some(Decimal::new(26, 0)))
            .await
            .unwrap_err();
        assert_eq!(err, HoldError::OverCapture);
        let captured = store
            .capture(&hold.hold_id, Some(Decimal::new(10, 0)))
            .await
            .unwrap();
        assert_eq!(captured.captured_amount, Some(Decimal::new(10, 0)));
    }

    #[async_std::test]
    async fn test_void_then_capture_fails() {
        let store = HoldStore::new();
        let hold = store
            .create("wallet-1", "merchant.example", Decimal::new(5, 0), "USDC", None)
            .await;
        store.void(&hold.hold_id).await.unwrap();
        let err = store.capture(&hold.hold_id, None).await.unwrap_err();
        assert!(matches!(err, HoldError::NotHeld { .. }));
    }

    #[async_std::test]
    async fn test_expiry_sweep() {
        let store = HoldStore::new();
        let hold = store
            .create("wallet-1", "merchant.example", Decimal::new(5, 0), "USDC", Some(10))
            .await;
        assert_eq!(store.expire_due_at(now_unix() + 11).await, 1);
        assert_eq!(store.get(&hold.hold_id).await.unwrap().status, HoldStatus::Expired);
        // Sweep is idempotent.
        assert_eq!(store.expire_due_at(now_unix() + 12).await, 0);
    }
}
