// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Sliding-window request limiter, keyed by agent id on the payment
//! endpoints and by a fixed key on the admin surface.

use async_std::sync::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tollgate_core::helpers::now_millis;

pub const PAYMENT_LIMIT_PER_MINUTE: usize = 60;
pub const ADMIN_LIMIT_PER_MINUTE: usize = 10;

pub struct SlidingWindowLimiter {
    window: Duration,
    max_hits: usize,
    hits: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_hits: usize) -> Self {
        Self {
            window,
            max_hits,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn per_minute(max_hits: usize) -> Self {
        Self::new(Duration::from_secs(60), max_hits)
    }

    /// Record a hit for `key` and return whether it is within the limit.
    pub async fn allow(&self, key: &str) -> bool {
        self.allow_at(key, now_millis()).await
    }

    pub async fn allow_at(&self, key: &str, now_ms: u64) -> bool {
        let window_ms = self.window.as_millis() as u64;
        let mut hits = self.hits.lock().await;
        let bucket = hits.entry(key.to_string()).or_default();
        while bucket
            .front()
            .map_or(false, |t| now_ms.saturating_sub(*t) >= window_ms)
        {
            bucket.pop_front();
        }
        if bucket.len() >= self.max_hits {
            return false;
        }
        bucket.push_back(now_ms);
        true
    }
}
