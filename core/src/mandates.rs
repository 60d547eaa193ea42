// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Mandate model: the signed authorization objects agents submit.
//!
//! A mandate chain is intent → cart → payment, all bound to one subject and
//! one domain. Mandates are immutable once issued; the verifier consumes each
//! `mandate_id` at most once.

use serde::{Deserialize, Serialize};

/// Proof block attached to every mandate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcProof {
    #[serde(rename = "type", default = "default_proof_type")]
    pub proof_type: String,
    /// Either a registry reference (`did:agent#ed25519:<agent_id>`) or an
    /// inline key (`ed25519:<hex public key>`).
    pub verification_method: String,
    pub created: String,
    /// Base64 signature over the mandate's canonical signing payload.
    pub proof_value: String,
}

fn default_proof_type() -> String {
    "DataIntegrityProof".to_string()
}

/// Fields shared by every mandate type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateEnvelope {
    pub mandate_id: String,
    pub issuer: String,
    /// The agent this mandate authorizes.
    pub subject: String,
    /// Unix seconds after which the mandate is dead.
    pub expires_at: u64,
    pub nonce: String,
    pub domain: String,
    pub purpose: String,
    pub proof: VcProof,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: String,
    pub description: String,
    pub amount_minor: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentMandate {
    #[serde(flatten)]
    pub envelope: MandateEnvelope,
    pub scope: Vec<String>,
    pub requested_amount: u64,
    #[serde(default)]
    pub issuer_policy: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartMandate {
    #[serde(flatten)]
    pub envelope: MandateEnvelope,
    pub merchant_domain: String,
    pub line_items: Vec<LineItem>,
    pub currency: String,
    pub subtotal_minor: u64,
    #[serde(default)]
    pub taxes_minor: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMandate {
    #[serde(flatten)]
    pub envelope: MandateEnvelope,
    pub chain: String,
    pub token: String,
    pub amount_minor: u64,
    pub destination: String,
    /// Must equal the cart's merchant domain; part of the V2 signing payload.
    #[serde(default)]
    pub merchant_domain: Option<String>,
    pub audit_hash: String,
    #[serde(default)]
    pub wallet_id: Option<String>,
}

/// A mandate of any type, tagged by `mandate_type` on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mandate_type", rename_all = "snake_case")]
pub enum Mandate {
    Intent(IntentMandate),
    Cart(CartMandate),
    Payment(PaymentMandate),
}

impl Mandate {
    pub fn envelope(&self) -> &MandateEnvelope {
        match self {
            Mandate::Intent(m) => &m.envelope,
            Mandate::Cart(m) => &m.envelope,
            Mandate::Payment(m) => &m.envelope,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Mandate::Intent(_) => "intent",
            Mandate::Cart(_) => "cart",
            Mandate::Payment(_) => "payment",
        }
    }

    /// Canonical byte payload the issuer signed.
    pub fn signing_payload(&self) -> Vec<u8> {
        match self {
            Mandate::Intent(m) => m.signing_payload(),
            Mandate::Cart(m) => m.signing_payload(),
            Mandate::Payment(m) => m.signing_payload(),
        }
    }
}

/// A verified-together intent → cart → payment triple.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandateChain {
    pub intent: IntentMandate,
    pub cart: CartMandate,
    pub payment: PaymentMandate,
}

// The signing payload is the byte concatenation
// `domain|nonce|purpose|<type-specific canonical fields>` with literal `|`
// separators, every field UTF-8. Field order is part of the wire contract.

fn join_payload(envelope: &MandateEnvelope, fields: &[&str]) -> Vec<u8> {
    let mut parts: Vec<&str> = vec![&envelope.domain, &envelope.nonce, &envelope.purpose];
    parts.extend_from_slice(fields);
    parts.join("|").into_bytes()
}

impl IntentMandate {
    pub fn signing_payload(&self) -> Vec<u8> {
        let scope = self.scope.join(",");
        let requested = self.requested_amount.to_string();
        join_payload(
            &self.envelope,
            &[&self.envelope.mandate_id, &self.envelope.subject, &scope, &requested],
        )
    }
}

impl CartMandate {
    pub fn signing_payload(&self) -> Vec<u8> {
        let subtotal = self.subtotal_minor.to_string();
        let taxes = self.taxes_minor.to_string();
        join_payload(
            &self.envelope,
            &[
                &self.envelope.mandate_id,
                &self.envelope.subject,
                &self.merchant_domain,
                &self.currency,
                &subtotal,
                &taxes,
            ],
        )
    }
}

impl PaymentMandate {
    /// V2 canonical fields. The merchant domain is bound into the signature;
    /// a payload missing it (the old V1 layout) never verifies.
    pub fn signing_payload(&self) -> Vec<u8> {
        let amount = self.amount_minor.to_string();
        let merchant_domain = self.merchant_domain.as_deref().unwrap_or("");
        join_payload(
            &self.envelope,
            &[
                &self.envelope.mandate_id,
                &self.envelope.subject,
                &amount,
                &self.token,
                &self.chain,
                &self.destination,
                merchant_domain,
                &self.audit_hash,
            ],
        )
    }

    /// Sender wallet identifier for ledger rows; issuer stands in when no
    /// wallet is attached.
    pub fn from_wallet(&self) -> String {
        self.wallet_id
            .clone()
            .unwrap_or_else(|| self.envelope.issuer.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn proof() -> VcProof {
        VcProof {
            proof_type: "DataIntegrityProof".into(),
            verification_method: "ed25519:00".into(),
            created: "2026-01-01T00:00:00Z".into(),
            proof_value: "c2ln".into(),
        }
    }

    fn envelope(id: &str, purpose: &str) -> MandateEnvelope {
        MandateEnvelope {
            mandate_id: id.into(),
            issuer: "did:tollgate:issuer".into(),
            subject: "agent:test".into(),
            expires_at: 9_999_999_999,
            nonce: "nonce-1".into(),
            domain: "merchant.example".into(),
            purpose: purpose.into(),
            proof: proof(),
        }
    }

    #[test]
    fn test_payment_signing_payload_layout() {
        let payment = PaymentMandate {
            envelope: envelope("pay-1", "checkout"),
            chain: "base".into(),
            token: "USDC".into(),
            amount_minor: 5_000_000,
            destination: "0xabc".into(),
            merchant_domain: Some("merchant.example".into()),
            audit_hash: "hash".into(),
            wallet_id: None,
        };
        let payload = String::from_utf8(payment.signing_payload()).unwrap();
        assert_eq!(
            payload,
            "merchant.example|nonce-1|checkout|pay-1|agent:test|5000000|USDC|base|0xabc|merchant.example|hash"
        );
    }

    #[test]
    fn test_payment_payload_differs_without_merchant_domain() {
        let mut payment = PaymentMandate {
            envelope: envelope("pay-1", "checkout"),
            chain: "base".into(),
            token: "USDC".into(),
            amount_minor: 5_000_000,
            destination: "0xabc".into(),
            merchant_domain: Some("merchant.example".into()),
            audit_hash: "hash".into(),
            wallet_id: None,
        };
        let v2 = payment.signing_payload();
        payment.merchant_domain = None;
        assert_ne!(v2, payment.signing_payload());
    }

    #[test]
    fn test_mandate_tagged_serialization() {
        let intent = Mandate::Intent(IntentMandate {
            envelope: envelope("intent-1", "intent"),
            scope: vec!["digital".into()],
            requested_amount: 100_00,
            issuer_policy: None,
        });
        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["mandate_type"], "intent");
        assert_eq!(json["mandate_id"], "intent-1");
        let back: Mandate = serde_json::from_value(json).unwrap();
        assert_eq!(back, intent);
    }

    #[test]
    fn test_from_wallet_falls_back_to_issuer() {
        let mut payment = PaymentMandate {
            envelope: envelope("pay-2", "checkout"),
            chain: "base".into(),
            token: "USDC".into(),
            amount_minor: 1,
            destination: "0xabc".into(),
            merchant_domain: None,
            audit_hash: "h".into(),
            wallet_id: None,
        };
        assert_eq!(payment.from_wallet(), "did:tollgate:issuer");
        payment.wallet_id = Some("wallet-1".into());
        assert_eq!(payment.from_wallet(), "wallet-1");
    }
}
