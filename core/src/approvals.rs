// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Human-in-the-loop approvals for actions above an agent's autonomy.
//!
//! An approval request waits for an explicit approve/deny; requests that
//! outlive their deadline are expired by the scheduler sweep and count as
//! denials.

use crate::helpers::{now_unix, prefixed_id};
use async_std::sync::Mutex;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;

pub const DEFAULT_APPROVAL_TTL_SECS: u64 = 3600;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum ApprovalError {
    #[snafu(display("unknown approval: {}", approval_id))]
    UnknownApproval { approval_id: String },

    #[snafu(display("approval {} already resolved as {:?}", approval_id, status))]
    AlreadyResolved {
        approval_id: String,
        status: ApprovalStatus,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub approval_id: String,
    pub agent_id: String,
    /// What the agent wants to do, e.g. `payment:pay-123`.
    pub action: String,
    pub status: ApprovalStatus,
    pub resolved_by: Option<String>,
    pub expires_at: u64,
    pub created_at: u64,
}

#[derive(Default)]
pub struct ApprovalStore {
    approvals: Mutex<HashMap<String, Approval>>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn request(&self, agent_id: &str, action: &str, ttl_secs: Option<u64>) -> Approval {
        let now = now_unix();
        let approval = Approval {
            approval_id: prefixed_id("appr"),
            agent_id: agent_id.to_string(),
            action: action.to_string(),
            status: ApprovalStatus::Pending,
            resolved_by: None,
            expires_at: now + ttl_secs.unwrap_or(DEFAULT_APPROVAL_TTL_SECS),
            created_at: now,
        };
        self.approvals
            .lock()
            .await
            .insert(approval.approval_id.clone(), approval.clone());
        approval
    }

    pub async fn get(&self, approval_id: &str) -> Option<Approval> {
        self.approvals.lock().await.get(approval_id).cloned()
    }

    pub async fn approve(&self, approval_id: &str, operator: &str) -> Result<Approval, ApprovalError> {
        self.resolve(approval_id, operator, ApprovalStatus::Approved).await
    }

    pub async fn deny(&self, approval_id: &str, operator: &str) -> Result<Approval, ApprovalError> {
        self.resolve(approval_id, operator, ApprovalStatus::Denied).await
    }

    async fn resolve(
        &self,
        approval_id: &str,
        operator: &str,
        status: ApprovalStatus,
    ) -> Result<Approval, ApprovalError> {
        let mut approvals = self.approvals.lock().await;
        let approval = approvals
            .get_mut(approval_id)
            .ok_or_else(|| ApprovalError::UnknownApproval {
                approval_id: approval_id.to_string(),
            })?;
        if approval.status != ApprovalStatus::Pending {
            return Err(ApprovalError::AlreadyResolved {
                approval_id: approval_id.to_string(),
                status: approval.status,
            });
        }
        approval.status = status;
        approval.resolved_by = Some(operator.to_string());
        Ok(approval.clone())
    }

    /// Scheduler sweep: expire pending approvals past their deadline.
    pub async fn expire_due(&self) -> usize {
        self.expire_due_at(now_unix()).await
    }

    pub async fn expire_due_at(&self, now: u64) -> usize {
        let mut approvals = self.approvals.lock().await;
        let mut expired = 0;
        for approval in approvals.values_mut() {
            if approval.status == ApprovalStatus::Pending && approval.expires_at <= now {
                approval.status = ApprovalStatus::Expired;
                expired += 1;
                tracing::info!(approval_id = %approval.approval_id, "approval expired");
            }
        }
        expired
    }
}
