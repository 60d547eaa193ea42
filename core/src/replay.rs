// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Replay cache: the durable set of consumed mandate identifiers.
//!
//! `check_and_store` is the single entry point; it returns `true` exactly
//! when the mandate id has not been seen before (or only with an expired
//! TTL). Production deployments must use the durable cache — replaying a
//! mandate across a restart is a signed-payment double spend.

use crate::config::Environment;
use crate::helpers::now_unix;
use crate::persistence::SnapshotPersistence;
use async_std::sync::Mutex;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Snafu)]
pub enum ReplayError {
    #[snafu(display("replay cache persistence failed: {}", msg))]
    Persistence { msg: String },
}

#[async_trait]
pub trait ReplayCache: Send + Sync {
    /// Returns `true` iff the mandate id was previously unseen. A `true`
    /// return consumes the id until `expires_at`.
    async fn check_and_store(&self, mandate_id: &str, expires_at: u64) -> Result<bool, ReplayError>;

    /// Drop entries past their expiry; returns how many were removed.
    async fn cleanup_expired(&self) -> Result<usize, ReplayError>;
}

fn check_map(seen: &mut HashMap<String, u64>, mandate_id: &str, expires_at: u64, now: u64) -> bool {
    if let Some(deadline) = seen.get(mandate_id) {
        if *deadline > now {
            return false;
        }
    }
    seen.insert(mandate_id.to_string(), expires_at);
    true
}

fn sweep_map(seen: &mut HashMap<String, u64>, now: u64) -> usize {
    let before = seen.len();
    seen.retain(|_, deadline| *deadline > now);
    before - seen.len()
}

/// Volatile replay cache. Acceptable only in development; anywhere else it
/// logs a critical warning because consumed ids are lost on restart.
pub struct MemoryReplayCache {
    seen: Mutex<HashMap<String, u64>>,
}

impl MemoryReplayCache {
    pub fn new(environment: Environment) -> Self {
        if environment != Environment::Development {
            tracing::error!(
                "CRITICAL: MemoryReplayCache is NOT suitable for {:?}: consumed mandate ids \
                 WILL BE LOST on restart, re-enabling replay of signed payments",
                environment
            );
        }
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ReplayCache for MemoryReplayCache {
    async fn check_and_store(&self, mandate_id: &str, expires_at: u64) -> Result<bool, ReplayError> {
        let mut seen = self.seen.lock().await;
        Ok(check_map(&mut seen, mandate_id, expires_at, now_unix()))
    }

    async fn cleanup_expired(&self) -> Result<usize, ReplayError> {
        let mut seen = self.seen.lock().await;
        Ok(sweep_map(&mut seen, now_unix()))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ReplayState {
    seen: HashMap<String, u64>,
}

struct DurableInner {
    seen: HashMap<String, u64>,
    persistence: SnapshotPersistence<ReplayState>,
}

/// Replay cache snapshotted to disk on every mutation. Survives restarts;
/// this is the only backend permitted outside development.
pub struct DurableReplayCache {
    inner: Mutex<DurableInner>,
}

impl DurableReplayCache {
    pub fn open(store_path: &Path) -> Result<Self, ReplayError> {
        let persistence = SnapshotPersistence::open(store_path, "replay_cache").map_err(|err| {
            ReplayError::Persistence {
                msg: err.to_string(),
            }
        })?;
        let seen = persistence
            .load_latest_state()
            .map(|state| state.seen)
            .unwrap_or_default();
        Ok(Self {
            inner: Mutex::new(DurableInner { seen, persistence }),
        })
    }
}

#[async_trait]
impl ReplayCache for DurableReplayCache {
    async fn check_and_store(&self, mandate_id: &str, expires_at: u64) -> Result<bool, ReplayError> {
        let mut inner = self.inner.lock().await;
        let fresh = check_map(&mut inner.seen, mandate_id, expires_at, now_unix());
        if fresh {
            let state = ReplayState {
                seen: inner.seen.clone(),
            };
            inner
                .persistence
                .store_latest_state(&state)
                .map_err(|err| ReplayError::Persistence {
                    msg: err.to_string(),
                })?;
        }
        Ok(fresh)
    }

    async fn cleanup_expired(&self) -> Result<usize, ReplayError> {
        let mut inner = self.inner.lock().await;
        let removed = sweep_map(&mut inner.seen, now_unix());
        if removed > 0 {
            let state = ReplayState {
                seen: inner.seen.clone(),
            };
            inner
                .persistence
                .store_latest_state(&state)
                .map_err(|err| ReplayError::Persistence {
                    msg: err.to_string(),
                })?;
        }
        Ok(removed)
    }
}
