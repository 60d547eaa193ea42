// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;
use structopt::StructOpt;
use tollgate_core::config::{ChainSpec, Environment, ExecutionMode, Settings};

#[derive(Debug, StructOpt)]
#[structopt(
    name = "Tollgate Orchestrator",
    about = "Verifies agent mandate chains, gates them on policy and compliance, dispatches settlement, and records the canonical ledger"
)]
pub struct OrchestratorOptions {
    /// Web service port.
    #[structopt(long, env = "TOLLGATE_PORT", default_value = "50079")]
    pub port: u16,

    /// Execution mode: simulated, staging_live, or live.
    #[structopt(long, env = "TOLLGATE_EXECUTION_MODE", default_value = "simulated")]
    pub execution_mode: ExecutionMode,

    /// Comma-separated mandate domain allow-list.
    #[structopt(
        long,
        env = "TOLLGATE_ALLOWED_DOMAINS",
        use_delimiter = true,
        default_value = "merchant.example"
    )]
    pub allowed_domains: Vec<String>,

    /// Path to persistence files.
    ///
    /// Persistence files will be nested under the specified directory.
    /// Empty keeps all state in memory (development only).
    #[structopt(long, short, env = "TOLLGATE_STORE_PATH", default_value = "")]
    pub store_path: String,

    /// Sender private key for the local dev signer.
    #[structopt(
        long,
        env = "TOLLGATE_EOA_PRIVATE_KEY",
        default_value = "0x1234567890123456789012345678901234567890123456789012345678901234",
        hide_env_values = true
    )]
    pub eoa_private_key: String,

    /// KYC threshold in minor units.
    #[structopt(long, env = "TOLLGATE_KYC_THRESHOLD_MINOR", default_value = "100000")]
    pub kyc_threshold_minor: u64,

    /// Enforce know-your-agent checks.
    #[structopt(long, env = "TOLLGATE_KYA_ENFORCEMENT")]
    pub kya_enforcement: bool,

    /// Treat sanctions-provider outages as rejections.
    #[structopt(long, env = "TOLLGATE_SANCTIONS_FAIL_CLOSED")]
    pub sanctions_fail_closed: bool,

    /// Stage-keyed sponsor cap overrides, JSON.
    #[structopt(long, env = "TOLLGATE_SPONSOR_CAPS_JSON")]
    pub sponsor_caps_json: Option<String>,

    /// Sponsor cap stage.
    #[structopt(long, env = "TOLLGATE_SPONSOR_STAGE", default_value = "pilot")]
    pub sponsor_stage: String,

    /// Comma-separated pilot merchant allow-list; empty means open.
    #[structopt(long, env = "TOLLGATE_PILOT_MERCHANTS", use_delimiter = true)]
    pub pilot_merchants: Vec<String>,

    /// Webhook secrets as provider=secret pairs, comma-separated.
    #[structopt(long, env = "TOLLGATE_WEBHOOK_SECRETS", use_delimiter = true, hide_env_values = true)]
    pub webhook_secrets: Vec<String>,
}

impl OrchestratorOptions {
    pub fn store_path(&self) -> Option<PathBuf> {
        if self.store_path.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.store_path))
        }
    }

    pub fn webhook_secret_map(&self) -> std::collections::HashMap<String, String> {
        self.webhook_secrets
            .iter()
            .filter_map(|pair| {
                pair.split_once('=')
                    .map(|(provider, secret)| (provider.to_string(), secret.to_string()))
            })
            .collect()
    }

    pub fn settings(&self) -> Settings {
        let environment = Environment::from_env();
        Settings {
            execution_mode: self.execution_mode,
            environment,
            allowed_domains: self.allowed_domains.clone(),
            chains: default_chains(),
            kyc_threshold_minor: self.kyc_threshold_minor,
            kya_enforcement: self.kya_enforcement,
            sanctions_fail_closed: self.sanctions_fail_closed,
            sponsor_caps_json: self.sponsor_caps_json.clone(),
            sponsor_stage: self.sponsor_stage.clone(),
            store_path: self.store_path(),
            pilot_merchants: self.pilot_merchants.clone(),
            max_policy_input_bytes: 64 * 1024,
        }
    }
}

fn default_chains() -> Vec<ChainSpec> {
    vec![
        ChainSpec {
            name: "base".into(),
            chain_id: 8453,
            rpc_url: "https://mainnet.base.org".into(),
            stablecoins: vec!["USDC".into(), "EURC".into()],
            settlement_vault: None,
        },
        ChainSpec {
            name: "base_sepolia".into(),
            chain_id: 84532,
            rpc_url: "https://sepolia.base.org".into(),
            stablecoins: vec!["USDC".into()],
            settlement_vault: None,
        },
        ChainSpec {
            name: "ethereum".into(),
            chain_id: 1,
            rpc_url: "https://eth.llamarpc.com".into(),
            stablecoins: vec!["USDC".into(), "USDT".into(), "PYUSD".into()],
            settlement_vault: None,
        },
        ChainSpec {
            name: "polygon".into(),
            chain_id: 137,
            rpc_url: "https://polygon-rpc.com".into(),
            stablecoins: vec!["USDC".into(), "USDT".into()],
            settlement_vault: None,
        },
    ]
}
