// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Core components of the Tollgate payment orchestrator.
//!
//! Everything in this crate is rail- and transport-agnostic: mandate types
//! and verification, the spending policy engine, the compliance gate, the
//! chain executor, the canonical ledger, and the supporting stores. The web
//! services in `orchestrator` and `agent_registry` bind these pieces
//! together; nothing here opens a socket.

pub mod amounts;
pub mod approvals;
pub mod attestation;
pub mod compliance;
pub mod config;
pub mod events;
pub mod executor;
pub mod helpers;
pub mod holds;
pub mod identity;
pub mod ledger;
pub mod mandates;
pub mod merkle;
pub mod persistence;
pub mod policy;
pub mod reconciliation;
pub mod replay;
pub mod scheduler;
pub mod tap;
pub mod verifier;
pub mod wallets;
pub mod webhooks;
pub mod x402;
