// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Inbound webhook authentication.
//!
//! Providers sign request bodies with `hex(HMAC-SHA256(secret, body))`. The
//! comparison is constant-time, and a replay guard keyed by
//! `(provider, event_id)` drops duplicate deliveries for 24 hours.

use crate::helpers::now_unix;
use async_std::sync::Mutex;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_REPLAY_TTL_SECS: u64 = 24 * 3600;

/// Constant-time check of a provider's hex HMAC signature over the raw body.
pub fn signature_matches(secret: &[u8], body: &[u8], provided_hex: &str) -> bool {
    let provided = match hex::decode(provided_hex.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Compute the signature a provider (or a test) would attach.
pub fn sign_body(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Replay guard for webhook deliveries.
#[derive(Default)]
pub struct WebhookReplayGuard {
    seen: Mutex<HashMap<(String, String), u64>>,
}

impl WebhookReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` iff this `(provider, event_id)` has not been processed
    /// within the TTL. A `true` return records the delivery.
    pub async fn check_and_store(&self, provider: &str, event_id: &str) -> bool {
        self.check_and_store_at(provider, event_id, now_unix()).await
    }

    pub async fn check_and_store_at(&self, provider: &str, event_id: &str, now: u64) -> bool {
        let mut seen = self.seen.lock().await;
        let key = (provider.to_string(), event_id.to_string());
        if let Some(seen_at) = seen.get(&key) {
            if now < seen_at + WEBHOOK_REPLAY_TTL_SECS {
                return false;
            }
        }
        seen.insert(key, now);
        true
    }

    /// Drop records older than the TTL.
    pub async fn cleanup_expired(&self) -> usize {
        let mut seen = self.seen.lock().await;
        let now = now_unix();
        let before = seen.len();
        seen.retain(|_, seen_at| now < *seen_at + WEBHOOK_REPLAY_TTL_SECS);
        before - seen.len()
    }
}
