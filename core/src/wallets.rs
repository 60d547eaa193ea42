// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Agent wallets: chain addresses and the freeze switch.
//!
//! Wallets are 1:1 with agents and never deleted. Compliance and operations
//! freeze a wallet with a recorded reason; a frozen wallet refuses
//! execution.

use crate::helpers::{normalize, now_unix, prefixed_id};
use async_std::sync::Mutex;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Eoa,
    SmartAccount,
}

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum WalletError {
    #[snafu(display("unknown wallet: {}", wallet_id))]
    UnknownWallet { wallet_id: String },

    #[snafu(display("wallet {} is frozen: {}", wallet_id, reason))]
    WalletFrozen { wallet_id: String, reason: String },

    #[snafu(display("agent {} already has a wallet", agent_id))]
    WalletExists { agent_id: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: String,
    pub agent_id: String,
    pub account_type: AccountType,
    /// chain name (normalized) → address.
    pub addresses: HashMap<String, String>,
    pub is_frozen: bool,
    pub freeze_reason: Option<String>,
    pub created_at: u64,
}

impl Wallet {
    pub fn address_on(&self, chain: &str) -> Option<&str> {
        self.addresses.get(&normalize(chain)).map(String::as_str)
    }
}

#[derive(Default)]
pub struct WalletStore {
    wallets: Mutex<HashMap<String, Wallet>>,
    by_agent: Mutex<HashMap<String, String>>,
}

impl WalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        agent_id: &str,
        account_type: AccountType,
    ) -> Result<Wallet, WalletError> {
        let mut by_agent = self.by_agent.lock().await;
        if by_agent.contains_key(agent_id) {
            return Err(WalletError::WalletExists {
                agent_id: agent_id.to_string(),
            });
        }
        let wallet = Wallet {
            wallet_id: prefixed_id("wlt"),
            agent_id: agent_id.to_string(),
            account_type,
            addresses: HashMap::new(),
            is_frozen: false,
            freeze_reason: None,
            created_at: now_unix(),
        };
        by_agent.insert(agent_id.to_string(), wallet.wallet_id.clone());
        self.wallets
            .lock()
            .await
            .insert(wallet.wallet_id.clone(), wallet.clone());
        Ok(wallet)
    }

    pub async fn get(&self, wallet_id: &str) -> Option<Wallet> {
        self.wallets.lock().await.get(wallet_id).cloned()
    }

    pub async fn for_agent(&self, agent_id: &str) -> Option<Wallet> {
        let wallet_id = self.by_agent.lock().await.get(agent_id).cloned()?;
        self.get(&wallet_id).await
    }

    pub async fn set_address(
        &self,
        wallet_id: &str,
        chain: &str,
        address: &str,
    ) -> Result<(), WalletError> {
        let mut wallets = self.wallets.lock().await;
        let wallet = wallets
            .get_mut(wallet_id)
            .ok_or_else(|| WalletError::UnknownWallet {
                wallet_id: wallet_id.to_string(),
            })?;
        wallet
            .addresses
            .insert(normalize(chain), address.to_string());
        Ok(())
    }

    pub async fn freeze(&self, wallet_id: &str, reason: &str) -> Result<(), WalletError> {
        let mut wallets = self.wallets.lock().await;
        let wallet = wallets
            .get_mut(wallet_id)
            .ok_or_else(|| WalletError::UnknownWallet {
                wallet_id: wallet_id.to_string(),
            })?;
        wallet.is_frozen = true;
        wallet.freeze_reason = Some(reason.to_string());
        tracing::warn!(wallet_id, reason, "wallet frozen");
        Ok(())
    }

    pub async fn unfreeze(&self, wallet_id: &str) -> Result<(), WalletError> {
        let mut wallets = self.wallets.lock().await;
        let wallet = wallets
            .get_mut(wallet_id)
            .ok_or_else(|| WalletError::UnknownWallet {
                wallet_id: wallet_id.to_string(),
            })?;
        wallet.is_frozen = false;
        wallet.freeze_reason = None;
        Ok(())
    }

    /// Gate used by the orchestrator before dispatch.
    pub async fn ensure_not_frozen(&self, agent_id: &str) -> Result<(), WalletError> {
        if let Some(wallet) = self.for_agent(agent_id).await {
            if wallet.is_frozen {
                return Err(WalletError::WalletFrozen {
                    wallet_id: wallet.wallet_id,
                    reason: wallet
                        .freeze_reason
                        .unwrap_or_else(|| "unspecified".to_string()),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn test_one_wallet_per_agent() {
        let store = WalletStore::new();
        store.create("agent:demo", AccountType::Eoa).await.unwrap();
        let err = store.create("agent:demo", AccountType::Eoa).await.unwrap_err();
        assert!(matches!(err, WalletError::WalletExists { .. }));
    }

    #[async_std::test]
    async fn test_address_lookup_normalized() {
        let store = WalletStore::new();
        let wallet = store.create("agent:demo", AccountType::Eoa).await.unwrap();
        store.set_address(&wallet.wallet_id, "Base", "0xabc").await.unwrap();
        let wallet = store.get(&wallet.wallet_id).await.unwrap();
        assert_eq!(wallet.address_on("BASE"), Some("0xabc"));
        assert_eq!(wallet.address_on("polygon"), None);
    }

    #[async_std::test]
    async fn test_freeze_blocks_execution_gate() {
        let store = WalletStore::new();
        let wallet = store.create("agent:demo", AccountType::SmartAccount).await.unwrap();
        assert!(store.ensure_not_frozen("agent:demo").await.is_ok());

        store.freeze(&wallet.wallet_id, "sanctions_review").await.unwrap();
        let err = store.ensure_not_frozen("agent:demo").await.unwrap_err();
        assert!(matches!(err, WalletError::WalletFrozen { .. }));

        store.unfreeze(&wallet.wallet_id).await.unwrap();
        assert!(store.ensure_not_frozen("agent:demo").await.is_ok());
    }

    #[async_std::test]
    async fn test_unknown_agent_passes_freeze_gate() {
        // Agents without a wallet record settle from their mandate issuer;
        // the freeze gate only applies once a wallet exists.
        let store = WalletStore::new();
        assert!(store.ensure_not_frozen("agent:ghost").await.is_ok());
    }
}
