// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! x402 challenge/response handling for metered, per-request payments.
//!
//! A resource server issues a challenge naming the price and a one-shot
//! nonce; the paying agent answers with a response that references the
//! challenge and carries the payment mandate. Version numbers outside the
//! pinned set are rejected outright.

use crate::helpers::{now_unix, prefixed_id};
use async_std::sync::Mutex;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;

pub const X402_SUPPORTED_VERSIONS: &[u32] = &[1];

pub const DEFAULT_CHALLENGE_TTL_SECS: u64 = 300;

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum X402Error {
    #[snafu(display("unsupported x402 version: {}", version))]
    UnsupportedVersion { version: u32 },

    #[snafu(display("unknown x402 challenge: {}", reference))]
    UnknownChallenge { reference: String },

    #[snafu(display("x402 challenge expired: {}", reference))]
    ChallengeExpired { reference: String },

    #[snafu(display("x402 nonce mismatch"))]
    NonceMismatch,
}

impl X402Error {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnsupportedVersion { .. } => "x402_version_unsupported",
            Self::UnknownChallenge { .. } => "x402_challenge_unknown",
            Self::ChallengeExpired { .. } => "x402_challenge_expired",
            Self::NonceMismatch => "x402_nonce_mismatch",
        }
    }
}

pub fn validate_x402_version(version: u32) -> Result<(), X402Error> {
    if X402_SUPPORTED_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(X402Error::UnsupportedVersion { version })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct X402Challenge {
    pub reference: String,
    pub nonce: String,
    pub amount_minor: u64,
    pub token: String,
    pub chain: String,
    pub pay_to: String,
    pub expires_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct X402Response {
    pub version: u32,
    pub reference: String,
    pub nonce: String,
    pub payment_mandate_id: String,
}

/// Issues challenges and validates the responses that come back. Each
/// challenge is single-use: validation consumes it.
#[derive(Default)]
pub struct X402Gate {
    challenges: Mutex<HashMap<String, X402Challenge>>,
}

impl X402Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn issue_challenge(
        &self,
        amount_minor: u64,
        token: &str,
        chain: &str,
        pay_to: &str,
    ) -> X402Challenge {
        let challenge = X402Challenge {
            reference: prefixed_id("x402"),
            nonce: prefixed_id("nonce"),
            amount_minor,
            token: token.to_string(),
            chain: chain.to_string(),
            pay_to: pay_to.to_string(),
            expires_at: now_unix() + DEFAULT_CHALLENGE_TTL_SECS,
        };
        let mut challenges = self.challenges.lock().await;
        challenges.insert(challenge.reference.clone(), challenge.clone());
        challenge
    }

    /// Validate and consume the challenge a response points at. The payment
    /// mandate referenced by the response settles the metered request.
    pub async fn validate_response(
        &self,
        response: &X402Response,
    ) -> Result<X402Challenge, X402Error> {
        validate_x402_version(response.version)?;
        let mut challenges = self.challenges.lock().await;
        let challenge = challenges.get(&response.reference).cloned().ok_or_else(|| {
            X402Error::UnknownChallenge {
                reference: response.reference.clone(),
            }
        })?;
        if challenge.expires_at <= now_unix() {
            challenges.remove(&response.reference);
            return Err(X402Error::ChallengeExpired {
                reference: response.reference.clone(),
            });
        }
        if challenge.nonce != response.nonce {
            return Err(X402Error::NonceMismatch);
        }
        challenges.remove(&response.reference);
        Ok(challenge)
    }

    /// Drop expired challenges; returns how many were removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut challenges = self.challenges.lock().await;
        let now = now_unix();
        let before = challenges.len();
        challenges.retain(|_, c| c.expires_at > now);
        before - challenges.len()
    }
}
