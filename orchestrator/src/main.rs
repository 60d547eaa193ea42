// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

use async_std::sync::{Arc, RwLock};
use orchestrator::configuration::OrchestratorOptions;
use orchestrator::pipeline::Pipeline;
use orchestrator::ratelimit::{SlidingWindowLimiter, PAYMENT_LIMIT_PER_MINUTE};
use orchestrator::worker;
use orchestrator::{init_web_server, WebState};
use structopt::StructOpt;
use tollgate_core::compliance::{ComplianceAuditStore, ComplianceGate};
use tollgate_core::events::EventBus;
use tollgate_core::executor::{ChainExecutor, LocalSigner, SimulatedEvm, SponsorCapGuard};
use tollgate_core::identity::{KeyRegistry, KeyRotationPolicy};
use tollgate_core::ledger::CanonicalLedger;
use tollgate_core::policy::PolicyStore;
use tollgate_core::reconciliation::{
    DurableReconciliationQueue, MemoryReconciliationQueue, ReconciliationQueue,
};
use tollgate_core::replay::{DurableReplayCache, MemoryReplayCache, ReplayCache};
use tollgate_core::scheduler::Scheduler;
use tollgate_core::verifier::MandateVerifier;
use tollgate_core::wallets::WalletStore;

#[async_std::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt().pretty().init();
    let options = OrchestratorOptions::from_args();
    let settings = Arc::new(options.settings());

    if settings.is_production() && settings.store_path.is_none() {
        // Fail fast: a production orchestrator without durable stores loses
        // replay protection and reconciliation work on every restart.
        panic!("TOLLGATE_STORE_PATH is required in production");
    }

    let replay: Arc<dyn ReplayCache> = match &settings.store_path {
        Some(path) => Arc::new(
            DurableReplayCache::open(path).expect("failed to open durable replay cache"),
        ),
        None => Arc::new(MemoryReplayCache::new(settings.environment)),
    };
    let recon_queue: Arc<dyn ReconciliationQueue> = match &settings.store_path {
        Some(path) => Arc::new(
            DurableReconciliationQueue::open(path)
                .expect("failed to open durable reconciliation queue"),
        ),
        None => Arc::new(MemoryReconciliationQueue::new(settings.environment)),
    };
    let ledger = Arc::new(match &settings.store_path {
        Some(path) => CanonicalLedger::open(path).expect("failed to open ledger journal"),
        None => CanonicalLedger::new(),
    });

    let registry = Arc::new(RwLock::new(KeyRegistry::new(KeyRotationPolicy::default())));
    let verifier = MandateVerifier::new(settings.clone(), registry, replay.clone());

    // Providers are wired in by deployment; the gate fails closed on anything
    // it is configured with.
    let compliance = ComplianceGate::new(
        settings.clone(),
        None,
        None,
        None,
        Arc::new(ComplianceAuditStore::default()),
    );

    let rpc = Arc::new(SimulatedEvm::new());
    let signer = Arc::new(
        LocalSigner::new(&options.eoa_private_key, &settings).expect("failed to build signer"),
    );
    let sponsor = SponsorCapGuard::new(
        &settings.sponsor_stage,
        settings.sponsor_caps_json.as_deref(),
    )
    .expect("invalid sponsor cap configuration");
    let executor = ChainExecutor::new(settings.clone(), rpc, signer, Some(sponsor));

    let pipeline = Arc::new(Pipeline::new(
        verifier,
        PolicyStore::new(),
        compliance,
        executor,
        ledger.clone(),
        recon_queue.clone(),
        Arc::new(WalletStore::new()),
        Arc::new(EventBus::new()),
        SlidingWindowLimiter::per_minute(PAYMENT_LIMIT_PER_MINUTE),
    ));

    let state = WebState::new(pipeline.clone(), options.webhook_secret_map());

    let scheduler = Scheduler::new();
    worker::register_jobs(
        &scheduler,
        recon_queue,
        ledger,
        state.holds.clone(),
        state.approvals.clone(),
        pipeline.policy_store().clone(),
        replay,
    );
    scheduler.start();

    tracing::info!(port = options.port, "orchestrator listening");
    init_web_server(state, options.port).await
}
