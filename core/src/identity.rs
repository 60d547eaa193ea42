// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Agent identity and verification-key registry.
//!
//! An agent has at most one `active` key unless the rotation policy allows
//! more. Rotation demotes the previous active key to `rotating`, which stays
//! valid for a grace period so in-flight mandates keep verifying; cleanup
//! then revokes it. Keys are never deleted.

use crate::helpers::{now_unix, prefixed_id};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;

pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 24 * 3600;
pub const DEFAULT_ROTATION_INTERVAL_SECS: u64 = 90 * 24 * 3600;
pub const DEFAULT_NOTIFICATION_THRESHOLD_SECS: u64 = 7 * 24 * 3600;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Rotating,
    Revoked,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationKey {
    pub key_id: String,
    pub public_key: [u8; 32],
    pub algorithm: String,
    pub status: KeyStatus,
    pub created_at: u64,
    pub expires_at: Option<u64>,
    /// Set when the key left `active`; grace runs from here.
    pub rotation_started_at: Option<u64>,
}

impl VerificationKey {
    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        VerifyingKey::from_bytes(&self.public_key).ok()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyRotationPolicy {
    pub rotation_interval_secs: u64,
    pub grace_period_secs: u64,
    pub notification_threshold_secs: u64,
    pub allow_multiple_active: bool,
}

impl Default for KeyRotationPolicy {
    fn default() -> Self {
        Self {
            rotation_interval_secs: DEFAULT_ROTATION_INTERVAL_SECS,
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
            notification_threshold_secs: DEFAULT_NOTIFICATION_THRESHOLD_SECS,
            allow_multiple_active: false,
        }
    }
}

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum RegistryError {
    #[snafu(display("unknown agent: {}", agent_id))]
    UnknownAgent { agent_id: String },

    #[snafu(display("unknown key {} for agent {}", key_id, agent_id))]
    UnknownKey { agent_id: String, key_id: String },

    #[snafu(display("agent {} already has an active key", agent_id))]
    ActiveKeyExists { agent_id: String },

    #[snafu(display("agent {} has no active key to rotate", agent_id))]
    NoActiveKey { agent_id: String },

    #[snafu(display("unsupported key algorithm: {}", algorithm))]
    UnsupportedAlgorithm { algorithm: String },
}

/// In-memory registry of agent verification keys. Services wrap this in an
/// `Arc<RwLock<_>>`; the registry itself is single-writer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyRegistry {
    policy: KeyRotationPolicy,
    keys: HashMap<String, Vec<VerificationKey>>,
}

impl KeyRegistry {
    pub fn new(policy: KeyRotationPolicy) -> Self {
        Self {
            policy,
            keys: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &KeyRotationPolicy {
        &self.policy
    }

    pub fn known_agent(&self, agent_id: &str) -> bool {
        self.keys.contains_key(agent_id)
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.keys.keys().cloned().collect()
    }

    /// Full keyring for an agent, all statuses included.
    pub fn keyring(&self, agent_id: &str) -> Option<Vec<VerificationKey>> {
        self.keys.get(agent_id).cloned()
    }

    /// Replace an agent's keyring wholesale, as when rehydrating from a
    /// persistent store.
    pub fn insert_keyring(&mut self, agent_id: &str, keys: Vec<VerificationKey>) {
        self.keys.insert(agent_id.to_string(), keys);
    }

    /// Register a new active key for an agent. Fails if the agent already has
    /// an active key and the policy forbids multiple.
    pub fn register_key(
        &mut self,
        agent_id: &str,
        public_key: [u8; 32],
        algorithm: &str,
        expires_at: Option<u64>,
    ) -> Result<VerificationKey, RegistryError> {
        if !algorithm.eq_ignore_ascii_case("ed25519") {
            return Err(RegistryError::UnsupportedAlgorithm {
                algorithm: algorithm.to_string(),
            });
        }
        let entry = self.keys.entry(agent_id.to_string()).or_default();
        if !self.policy.allow_multiple_active
            && entry.iter().any(|k| k.status == KeyStatus::Active)
        {
            return Err(RegistryError::ActiveKeyExists {
                agent_id: agent_id.to_string(),
            });
        }
        let key = VerificationKey {
            key_id: prefixed_id("key"),
            public_key,
            algorithm: "ed25519".to_string(),
            status: KeyStatus::Active,
            created_at: now_unix(),
            expires_at,
            rotation_started_at: None,
        };
        entry.push(key.clone());
        Ok(key)
    }

    /// Rotate to a new active key. The previous active key becomes `rotating`
    /// and stays valid for the grace period.
    pub fn rotate_key(
        &mut self,
        agent_id: &str,
        new_public_key: [u8; 32],
        reason: &str,
    ) -> Result<VerificationKey, RegistryError> {
        self.rotate_key_at(agent_id, new_public_key, reason, now_unix())
    }

    pub fn rotate_key_at(
        &mut self,
        agent_id: &str,
        new_public_key: [u8; 32],
        reason: &str,
        now: u64,
    ) -> Result<VerificationKey, RegistryError> {
        let entry = self
            .keys
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        let previous = entry
            .iter_mut()
            .find(|k| k.status == KeyStatus::Active)
            .ok_or_else(|| RegistryError::NoActiveKey {
                agent_id: agent_id.to_string(),
            })?;
        previous.status = KeyStatus::Rotating;
        previous.rotation_started_at = Some(now);
        let previous_id = previous.key_id.clone();

        let key = VerificationKey {
            key_id: prefixed_id("key"),
            public_key: new_public_key,
            algorithm: "ed25519".to_string(),
            status: KeyStatus::Active,
            created_at: now,
            expires_at: None,
            rotation_started_at: None,
        };
        entry.push(key.clone());
        tracing::info!(
            agent_id,
            previous_key = %previous_id,
            new_key = %key.key_id,
            reason,
            "rotated verification key"
        );
        Ok(key)
    }

    pub fn revoke_key(&mut self, agent_id: &str, key_id: &str) -> Result<(), RegistryError> {
        let entry = self
            .keys
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        let key = entry
            .iter_mut()
            .find(|k| k.key_id == key_id)
            .ok_or_else(|| RegistryError::UnknownKey {
                agent_id: agent_id.to_string(),
                key_id: key_id.to_string(),
            })?;
        key.status = KeyStatus::Revoked;
        Ok(())
    }

    /// All keys a signature may currently verify against: `active` plus
    /// `rotating` within grace, minus anything expired.
    pub fn get_valid_keys(&self, agent_id: &str) -> Vec<VerificationKey> {
        self.get_valid_keys_at(agent_id, now_unix())
    }

    pub fn get_valid_keys_at(&self, agent_id: &str, now: u64) -> Vec<VerificationKey> {
        let grace = self.policy.grace_period_secs;
        self.keys
            .get(agent_id)
            .map(|keys| {
                keys.iter()
                    .filter(|k| match k.status {
                        KeyStatus::Active => k.expires_at.map_or(true, |e| e > now),
                        KeyStatus::Rotating => {
                            k.rotation_started_at.map_or(false, |t| now < t + grace)
                                && k.expires_at.map_or(true, |e| e > now)
                        }
                        KeyStatus::Revoked => false,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_active_key(&self, agent_id: &str) -> Option<VerificationKey> {
        self.keys.get(agent_id).and_then(|keys| {
            keys.iter()
                .find(|k| k.status == KeyStatus::Active)
                .cloned()
        })
    }

    /// Revoke rotating keys past grace and active keys past their expiry.
    /// Returns the number of keys transitioned.
    pub fn cleanup_expired(&mut self) -> usize {
        self.cleanup_expired_at(now_unix())
    }

    pub fn cleanup_expired_at(&mut self, now: u64) -> usize {
        let grace = self.policy.grace_period_secs;
        let mut affected = 0;
        for keys in self.keys.values_mut() {
            for key in keys.iter_mut() {
                let stale = match key.status {
                    KeyStatus::Rotating => {
                        key.rotation_started_at.map_or(true, |t| now >= t + grace)
                    }
                    KeyStatus::Active => key.expires_at.map_or(false, |e| e <= now),
                    KeyStatus::Revoked => false,
                };
                if stale {
                    key.status = KeyStatus::Revoked;
                    affected += 1;
                }
            }
        }
        affected
    }

    /// Agents whose active key expires within the notification threshold.
    pub fn keys_needing_rotation(&self) -> Vec<(String, VerificationKey)> {
        self.keys_needing_rotation_at(now_unix())
    }

    pub fn keys_needing_rotation_at(&self, now: u64) -> Vec<(String, VerificationKey)> {
        let threshold = self.policy.notification_threshold_secs;
        let mut due = Vec::new();
        for (agent_id, keys) in &self.keys {
            for key in keys {
                if key.status == KeyStatus::Active {
                    if let Some(expires_at) = key.expires_at {
                        if expires_at <= now + threshold {
                            due.push((agent_id.clone(), key.clone()));
                        }
                    }
                }
            }
        }
        due
    }
}
