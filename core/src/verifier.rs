// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Mandate verifier.
//!
//! Checks run in a fixed order and fail fast with a stable reason code:
//! payload shape, expiry, domain allow-list, subject resolution, replay,
//! then signature. The key registry is the single source of signing
//! authority: a mandate's `verification_method` is a reference
//! (`did:agent#ed25519:<agent_id>`), never key material, so revoking a key
//! revokes every mandate signed under it. The verifier is a pure function of
//! the mandate, the registry, and the replay cache; it never retries and a
//! rejection is terminal for the request.
//!
//! The verifier also owns the two companion protocol checks: x402
//! challenge/response settlement linkage and TAP message envelopes.

use crate::config::Settings;
use crate::helpers::{eq_normalized, now_unix};
use crate::identity::KeyRegistry;
use crate::mandates::{Mandate, MandateChain, PaymentMandate};
use crate::replay::ReplayCache;
use crate::tap::{self, TapEnvelope, TapKeySet};
use crate::x402::{X402Gate, X402Response};
use async_std::sync::{Arc, RwLock};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Outcome for a single mandate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    pub reason: Option<String>,
}

impl Verdict {
    fn accept() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome for a full intent → cart → payment bundle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainVerdict {
    pub accepted: bool,
    pub reason: Option<String>,
    pub chain: Option<MandateChain>,
}

pub struct MandateVerifier {
    settings: Arc<Settings>,
    registry: Arc<RwLock<KeyRegistry>>,
    replay: Arc<dyn ReplayCache>,
}

impl MandateVerifier {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<RwLock<KeyRegistry>>,
        replay: Arc<dyn ReplayCache>,
    ) -> Self {
        Self {
            settings,
            registry,
            replay,
        }
    }

    /// Verify one mandate in isolation.
    pub async fn verify(&self, mandate: &Mandate) -> Verdict {
        match self.check_mandate(mandate).await {
            Ok(()) => Verdict::accept(),
            Err(reason) => {
                tracing::info!(
                    mandate_id = %mandate.envelope().mandate_id,
                    mandate_type = mandate.type_name(),
                    reason = %reason,
                    "mandate rejected"
                );
                Verdict::reject(reason)
            }
        }
    }

    /// Verify an AP2 bundle: each mandate individually, then the chain
    /// linkage between them.
    pub async fn verify_chain(&self, bundle: &MandateChain) -> ChainVerdict {
        let mandates = [
            Mandate::Intent(bundle.intent.clone()),
            Mandate::Cart(bundle.cart.clone()),
            Mandate::Payment(bundle.payment.clone()),
        ];
        for mandate in &mandates {
            let verdict = self.verify(mandate).await;
            if !verdict.accepted {
                return ChainVerdict {
                    accepted: false,
                    reason: verdict.reason,
                    chain: None,
                };
            }
        }

        if let Err(reason) = check_linkage(bundle) {
            tracing::info!(
                payment_mandate_id = %bundle.payment.envelope.mandate_id,
                reason = %reason,
                "mandate chain rejected"
            );
            return ChainVerdict {
                accepted: false,
                reason: Some(reason.to_string()),
                chain: None,
            };
        }

        ChainVerdict {
            accepted: true,
            reason: None,
            chain: Some(bundle.clone()),
        }
    }

    /// x402 settlement: pinned version, challenge nonce, and linkage of the
    /// paying mandate to the challenge it answers. Consumes the challenge.
    pub async fn verify_x402(
        &self,
        gate: &X402Gate,
        response: &X402Response,
        payment: &PaymentMandate,
    ) -> Verdict {
        let challenge = match gate.validate_response(response).await {
            Ok(challenge) => challenge,
            Err(err) => {
                tracing::info!(
                    reference = %response.reference,
                    reason = err.reason(),
                    "x402 response rejected"
                );
                return Verdict::reject(err.reason());
            }
        };
        if response.payment_mandate_id != payment.envelope.mandate_id {
            return Verdict::reject("x402_payment_mismatch");
        }
        if challenge.amount_minor != payment.amount_minor
            || !eq_normalized(&challenge.token, &payment.token)
            || !eq_normalized(&challenge.chain, &payment.chain)
            || !eq_normalized(&challenge.pay_to, &payment.destination)
        {
            return Verdict::reject("x402_challenge_mismatch");
        }
        Verdict::accept()
    }

    /// TAP message envelope: pinned version, kid lookup, Ed25519 signature
    /// over the envelope's signature base.
    pub fn verify_tap(&self, keys: &TapKeySet, envelope: &TapEnvelope) -> Verdict {
        match tap::verify_envelope(envelope, keys) {
            Ok(()) => Verdict::accept(),
            Err(err) => {
                tracing::info!(
                    kid = %envelope.kid,
                    from_agent = %envelope.from_agent,
                    reason = err.reason(),
                    "TAP envelope rejected"
                );
                Verdict::reject(err.reason())
            }
        }
    }

    async fn check_mandate(&self, mandate: &Mandate) -> Result<(), String> {
        let envelope = mandate.envelope();

        // 1. Payload shape.
        if envelope.mandate_id.is_empty() {
            return Err("invalid_payload:mandate_id".into());
        }
        if envelope.subject.is_empty() {
            return Err("invalid_payload:subject".into());
        }
        if envelope.nonce.is_empty() {
            return Err("invalid_payload:nonce".into());
        }
        if envelope.proof.proof_value.is_empty() {
            return Err("invalid_payload:proof_value".into());
        }
        if let Mandate::Payment(payment) = mandate {
            if payment.destination.is_empty() {
                return Err("invalid_payload:destination".into());
            }
        }

        // 2. Freshness. `expires_at == now` is already expired.
        if envelope.expires_at <= now_unix() {
            return Err(format!("{}_mandate_expired", mandate.type_name()));
        }

        // 3. Domain binding.
        if !self.settings.domain_allowed(&envelope.domain) {
            return Err("domain_not_allowed".into());
        }

        // 4. Subject resolution. The registry is the only identity source;
        // key material carried inside the mandate is never trusted.
        let registry_keys = {
            let registry = self.registry.read().await;
            if !registry.known_agent(&envelope.subject) {
                return Err("unknown_subject".into());
            }
            registry.get_valid_keys(&envelope.subject)
        };

        // 5. Replay.
        let fresh = self
            .replay
            .check_and_store(&envelope.mandate_id, envelope.expires_at)
            .await
            .map_err(|err| {
                tracing::error!("replay cache failure: {}", err);
                "replay_cache_unavailable".to_string()
            })?;
        if !fresh {
            return Err("replay_detected".into());
        }

        // 6. Signature: first valid registry key wins. Revoked and
        // grace-expired keys are already filtered out.
        let signature_bytes = BASE64
            .decode(&envelope.proof.proof_value)
            .map_err(|_| "signature_invalid".to_string())?;
        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| "signature_invalid".to_string())?;
        let payload = mandate.signing_payload();

        let candidates: Vec<VerifyingKey> = registry_keys
            .iter()
            .filter_map(|k| k.verifying_key())
            .collect();
        if candidates
            .iter()
            .any(|key| key.verify(&payload, &signature).is_ok())
        {
            Ok(())
        } else {
            Err("signature_invalid".into())
        }
    }
}

fn check_linkage(bundle: &MandateChain) -> Result<(), &'static str> {
    let subject = &bundle.intent.envelope.subject;
    if &bundle.cart.envelope.subject != subject || &bundle.payment.envelope.subject != subject {
        return Err("subject_mismatch");
    }

    let payment_merchant = match bundle.payment.merchant_domain.as_deref() {
        Some(domain) if !domain.is_empty() => domain,
        _ => return Err("payment_missing_merchant_domain"),
    };
    if !payment_merchant.eq_ignore_ascii_case(&bundle.cart.merchant_domain) {
        return Err("merchant_domain_mismatch");
    }

    if bundle.cart.subtotal_minor + bundle.cart.taxes_minor != bundle.payment.amount_minor {
        return Err("amount_mismatch");
    }
    Ok(())
}
