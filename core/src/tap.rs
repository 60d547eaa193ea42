// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! TAP: signed agent-to-agent message envelopes.
//!
//! Keys travel as JWKS-style entries (`kty: "OKP"`, `crv: "Ed25519"`, the
//! public key base64url-encoded in `x`). An envelope names the key by `kid`;
//! verification selects the key and checks the Ed25519 signature over the
//! envelope's signature base.

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64URL};
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub const TAP_PROTOCOL_VERSION: &str = "1.0";
pub const TAP_SUPPORTED_VERSIONS: &[&str] = &["1.0"];

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum TapError {
    #[snafu(display("unsupported TAP version: {}", version))]
    UnsupportedVersion { version: String },

    #[snafu(display("no key with kid {}", kid))]
    UnknownKid { kid: String },

    #[snafu(display("unsupported key type {}/{}", kty, crv))]
    UnsupportedKeyType { kty: String, crv: String },

    #[snafu(display("malformed key material"))]
    MalformedKey,

    #[snafu(display("TAP signature invalid"))]
    SignatureInvalid,
}

impl TapError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UnsupportedVersion { .. } => "tap_version_unsupported",
            Self::UnknownKid { .. } => "tap_unknown_kid",
            Self::UnsupportedKeyType { .. } => "tap_unsupported_key_type",
            Self::MalformedKey => "tap_malformed_key",
            Self::SignatureInvalid => "tap_signature_invalid",
        }
    }
}

pub fn validate_tap_version(version: &str) -> Result<(), TapError> {
    if TAP_SUPPORTED_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(TapError::UnsupportedVersion {
            version: version.to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapKey {
    pub kid: String,
    pub kty: String,
    pub crv: String,
    /// Public key, base64url without padding.
    pub x: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapKeySet {
    pub keys: Vec<TapKey>,
}

pub fn select_key_by_kid<'a>(set: &'a TapKeySet, kid: &str) -> Option<&'a TapKey> {
    set.keys.iter().find(|k| k.kid == kid)
}

/// Verify an Ed25519 signature (standard base64) over a signature base with
/// one JWKS key.
pub fn verify_signature_with_key(
    signature_base: &[u8],
    signature_b64: &str,
    key: &TapKey,
) -> Result<bool, TapError> {
    if key.kty != "OKP" || key.crv != "Ed25519" {
        return Err(TapError::UnsupportedKeyType {
            kty: key.kty.clone(),
            crv: key.crv.clone(),
        });
    }
    let key_bytes: [u8; 32] = BASE64URL
        .decode(&key.x)
        .map_err(|_| TapError::MalformedKey)?
        .try_into()
        .map_err(|_| TapError::MalformedKey)?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| TapError::MalformedKey)?;

    let signature_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| TapError::SignatureInvalid)?;
    let signature =
        Signature::from_slice(&signature_bytes).map_err(|_| TapError::SignatureInvalid)?;
    Ok(verifying_key.verify(signature_base, &signature).is_ok())
}

/// A signed agent-to-agent message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapEnvelope {
    pub version: String,
    pub kid: String,
    pub from_agent: String,
    pub to_agent: String,
    pub body: serde_json::Value,
    /// Base64 Ed25519 signature over [`TapEnvelope::signature_base`].
    pub signature: String,
}

impl TapEnvelope {
    pub fn signature_base(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}",
            self.version, self.from_agent, self.to_agent, self.body
        )
        .into_bytes()
    }
}

/// Full envelope validation: version pin, key lookup, signature check.
pub fn verify_envelope(envelope: &TapEnvelope, keys: &TapKeySet) -> Result<(), TapError> {
    validate_tap_version(&envelope.version)?;
    let key = select_key_by_kid(keys, &envelope.kid).ok_or_else(|| TapError::UnknownKid {
        kid: envelope.kid.clone(),
    })?;
    if verify_signature_with_key(&envelope.signature_base(), &envelope.signature, key)? {
        Ok(())
    } else {
        Err(TapError::SignatureInvalid)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn key_pair(kid: &str, seed: u8) -> (SigningKey, TapKey) {
        let signer = SigningKey::from_bytes(&[seed; 32]);
        let key = TapKey {
            kid: kid.into(),
            kty: "OKP".into(),
            crv: "Ed25519".into(),
            x: BASE64URL.encode(signer.verifying_key().to_bytes()),
        };
        (signer, key)
    }

    #[test]
    fn test_select_key_by_kid() {
        let (_, k1) = key_pair("k1", 1);
        let (_, k2) = key_pair("k2", 2);
        let set = TapKeySet { keys: vec![k1, k2] };
        assert_eq!(select_key_by_kid(&set, "k2").unwrap().kid, "k2");
        assert!(select_key_by_kid(&set, "missing").is_none());
    }

    #[test]
    fn test_verify_signature_with_key() {
        let (signer, key) = key_pair("kid-ed", 3);
        let message = b"tap-signature-base";
        let signature = BASE64.encode(signer.sign(message).to_bytes());

        assert!(verify_signature_with_key(message, &signature, &key).unwrap());
        assert!(!verify_signature_with_key(b"tampered", &signature, &key).unwrap());
    }

    #[test]
    fn test_unsupported_key_type_rejected() {
        let (signer, mut key) = key_pair("kid-rsa", 4);
        key.kty = "RSA".into();
        let signature = BASE64.encode(signer.sign(b"m").to_bytes());
        let err = verify_signature_with_key(b"m", &signature, &key).unwrap_err();
        assert_eq!(err.reason(), "tap_unsupported_key_type");
    }

    #[test]
    fn test_envelope_roundtrip() {
        let (signer, key) = key_pair("k1", 5);
        let mut envelope = TapEnvelope {
            version: TAP_PROTOCOL_VERSION.into(),
            kid: "k1".into(),
            from_agent: "agent:alice".into(),
            to_agent: "agent:bob".into(),
            body: serde_json::json!({"kind": "payment_request", "amount_minor": 100}),
            signature: String::new(),
        };
        envelope.signature = BASE64.encode(signer.sign(&envelope.signature_base()).to_bytes());

        let set = TapKeySet { keys: vec![key] };
        assert!(verify_envelope(&envelope, &set).is_ok());

        // Any body tamper kills the signature.
        envelope.body = serde_json::json!({"kind": "payment_request", "amount_minor": 999});
        assert_eq!(
            verify_envelope(&envelope, &set).unwrap_err().reason(),
            "tap_signature_invalid"
        );
    }

    #[test]
    fn test_envelope_version_pin() {
        let (signer, key) = key_pair("k1", 6);
        let mut envelope = TapEnvelope {
            version: "2.0".into(),
            kid: "k1".into(),
            from_agent: "agent:alice".into(),
            to_agent: "agent:bob".into(),
            body: serde_json::json!({}),
            signature: String::new(),
        };
        envelope.signature = BASE64.encode(signer.sign(&envelope.signature_base()).to_bytes());
        let set = TapKeySet { keys: vec![key] };
        assert_eq!(
            verify_envelope(&envelope, &set).unwrap_err().reason(),
            "tap_version_unsupported"
        );
    }

    #[test]
    fn test_unknown_kid() {
        let (signer, _) = key_pair("k1", 7);
        let mut envelope = TapEnvelope {
            version: TAP_PROTOCOL_VERSION.into(),
            kid: "other".into(),
            from_agent: "a".into(),
            to_agent: "b".into(),
            body: serde_json::json!({}),
            signature: String::new(),
        };
        envelope.signature = BASE64.encode(signer.sign(&envelope.signature_base()).to_bytes());
        let set = TapKeySet { keys: vec![] };
        assert_eq!(
            verify_envelope(&envelope, &set).unwrap_err().reason(),
            "tap_unknown_kid"
        );
    }
}
