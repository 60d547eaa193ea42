// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Runtime settings shared by every component.
//!
//! Services parse their own command line (structopt) and environment, then
//! build one [`Settings`] value that is passed explicitly to each component.
//! There is no process-global configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// How settlement transactions leave the building.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Deterministic in-process chain; nothing leaves the host.
    Simulated,
    /// Real RPC endpoints, testnet chains only.
    StagingLive,
    /// Real RPC endpoints, mainnet chains permitted.
    Live,
}

impl FromStr for ExecutionMode {
    type Err = &'static str;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "simulated" => Ok(Self::Simulated),
            "staging_live" => Ok(Self::StagingLive),
            "live" => Ok(Self::Live),
            _ => Err("expected one of: simulated, staging_live, live"),
        }
    }
}

/// Deployment environment, read from `TOLLGATE_ENV`. Anything other than
/// `production` and `staging` is treated as development.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match std::env::var("TOLLGATE_ENV").as_deref() {
            Ok("production") => Self::Production,
            Ok("staging") => Self::Staging,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

impl FromStr for Environment {
    type Err = &'static str;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "development" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            _ => Err("expected one of: development, staging, production"),
        }
    }
}

/// One settlement chain the executor may dispatch to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainSpec {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub stablecoins: Vec<String>,
    pub settlement_vault: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub execution_mode: ExecutionMode,
    pub environment: Environment,
    /// Domains a mandate may bind to. Empty means nothing is accepted.
    pub allowed_domains: Vec<String>,
    pub chains: Vec<ChainSpec>,
    /// KYC verification is mandatory at or above this amount (minor units).
    pub kyc_threshold_minor: u64,
    pub kya_enforcement: bool,
    pub sanctions_fail_closed: bool,
    /// Stage-keyed sponsor cap overrides, JSON per [`crate::executor`].
    pub sponsor_caps_json: Option<String>,
    pub sponsor_stage: String,
    /// Root directory for durable stores (ledger journal, replay cache,
    /// reconciliation queue). `None` keeps everything in memory.
    pub store_path: Option<PathBuf>,
    /// Merchant domains admitted during a pilot rollout. Empty means open.
    pub pilot_merchants: Vec<String>,
    /// Upper bound on policy parser input, bytes.
    pub max_policy_input_bytes: usize,
}

impl Settings {
    pub fn is_production(&self) -> bool {
        self.environment.is_production()
    }

    pub fn chain(&self, name: &str) -> Option<&ChainSpec> {
        self.chains
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn domain_allowed(&self, domain: &str) -> bool {
        self.allowed_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }

    /// Settings suitable for unit tests and local development: simulated
    /// execution against the two pilot chains.
    pub fn dev(allowed_domains: Vec<String>) -> Self {
        Self {
            execution_mode: ExecutionMode::Simulated,
            environment: Environment::Development,
            allowed_domains,
            chains: vec![
                ChainSpec {
                    name: "base".into(),
                    chain_id: 8453,
                    rpc_url: "http://localhost:8545".into(),
                    stablecoins: vec!["USDC".into()],
                    settlement_vault: None,
                },
                ChainSpec {
                    name: "base_sepolia".into(),
                    chain_id: 84532,
                    rpc_url: "http://localhost:8545".into(),
                    stablecoins: vec!["USDC".into()],
                    settlement_vault: None,
                },
            ],
            kyc_threshold_minor: 1_000_00,
            kya_enforcement: false,
            sanctions_fail_closed: true,
            sponsor_caps_json: None,
            sponsor_stage: "pilot".into(),
            store_path: None,
            pilot_merchants: vec![],
            max_policy_input_bytes: 64 * 1024,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!(
            "simulated".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::Simulated
        );
        assert_eq!(
            "staging_live".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::StagingLive
        );
        assert!("yolo".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn test_chain_lookup_case_insensitive() {
        let settings = Settings::dev(vec!["merchant.example".into()]);
        assert!(settings.chain("Base").is_some());
        assert!(settings.chain(" BASE_SEPOLIA ").is_some());
        assert!(settings.chain("solana").is_none());
    }

    #[test]
    fn test_domain_allowed() {
        let settings = Settings::dev(vec!["merchant.example".into()]);
        assert!(settings.domain_allowed("merchant.example"));
        assert!(settings.domain_allowed("Merchant.Example"));
        assert!(!settings.domain_allowed("evil.example"));
    }
}
