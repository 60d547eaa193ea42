// Copyright (c) 2026 Tollgate Systems (tollgate.dev)
// This file is part of the Tollgate agent payment orchestrator.
//
// This program is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License as published by the Free Software Foundation, either version 3 of the License, or (at your option) any later version.
// This program is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
// You should have received a copy of the GNU General Public License along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Tollgate orchestrator web service.
//!
//! The HTTP layer stays thin: deserialize, rate-limit, hand off to the
//! pipeline or a store, serialize. Decisioned rejections (policy, compliance,
//! verification) are 200s with `accepted: false` and a reason code; transport
//! and authentication problems are HTTP errors.

pub mod configuration;
pub mod pipeline;
pub mod ratelimit;
pub mod worker;

use crate::pipeline::{ExecutionResult, Pipeline};
use crate::ratelimit::{SlidingWindowLimiter, ADMIN_LIMIT_PER_MINUTE};
use async_std::sync::{Arc, RwLock};
use async_std::task;
use net::server::{add_error_body, request_body, response};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::collections::HashMap;
use tide::{
    http::headers::HeaderValue,
    security::{CorsMiddleware, Origin},
    StatusCode,
};
use tollgate_core::approvals::ApprovalStore;
use tollgate_core::events::Event;
use tollgate_core::holds::HoldStore;
use tollgate_core::mandates::{Mandate, MandateChain, PaymentMandate};
use tollgate_core::tap::{TapEnvelope, TapKey, TapKeySet};
use tollgate_core::webhooks::{signature_matches, WebhookReplayGuard};
use tollgate_core::x402::{X402Gate, X402Response};

pub const DEFAULT_ORCHESTRATOR_PORT: &str = "50079";

#[derive(Clone, Debug, Snafu, Serialize, Deserialize)]
pub enum Error {
    #[snafu(display("failed to deserialize request body: {}", msg))]
    Deserialize { msg: String },

    #[snafu(display("rate limit exceeded for {}", key))]
    RateLimited { key: String },

    #[snafu(display("not found: {}", what))]
    NotFound { what: String },

    #[snafu(display("webhook authentication failed for provider {}", provider))]
    WebhookAuth { provider: String },

    #[snafu(display("duplicate webhook delivery {} from {}", event_id, provider))]
    WebhookReplay { provider: String, event_id: String },

    #[snafu(display("internal server error: {}", msg))]
    Internal { msg: String },
}

impl net::Error for Error {
    fn catch_all(msg: String) -> Self {
        Self::Internal { msg }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Deserialize { .. } => StatusCode::BadRequest,
            Self::RateLimited { .. } => StatusCode::TooManyRequests,
            Self::NotFound { .. } => StatusCode::NotFound,
            Self::WebhookAuth { .. } => StatusCode::Unauthorized,
            Self::WebhookReplay { .. } => StatusCode::Conflict,
            Self::Internal { .. } => StatusCode::InternalServerError,
        }
    }
}

fn server_error<E: Into<Error>>(err: E) -> tide::Error {
    net::server_error(err)
}

#[derive(Clone)]
pub struct WebState {
    pub pipeline: Arc<Pipeline>,
    pub holds: Arc<HoldStore>,
    pub approvals: Arc<ApprovalStore>,
    pub webhook_guard: Arc<WebhookReplayGuard>,
    /// provider name → shared HMAC secret.
    pub webhook_secrets: Arc<HashMap<String, String>>,
    pub admin_limiter: Arc<SlidingWindowLimiter>,
    /// Outstanding x402 challenges for metered requests.
    pub x402: Arc<X402Gate>,
    /// JWKS-style keys trusted for agent-to-agent envelopes.
    pub tap_keys: Arc<RwLock<TapKeySet>>,
}

impl WebState {
    pub fn new(pipeline: Arc<Pipeline>, webhook_secrets: HashMap<String, String>) -> Self {
        Self {
            pipeline,
            holds: Arc::new(HoldStore::new()),
            approvals: Arc::new(ApprovalStore::new()),
            webhook_guard: Arc::new(WebhookReplayGuard::new()),
            webhook_secrets: Arc::new(webhook_secrets),
            admin_limiter: Arc::new(SlidingWindowLimiter::per_minute(ADMIN_LIMIT_PER_MINUTE)),
            x402: Arc::new(X402Gate::new()),
            tap_keys: Arc::new(RwLock::new(TapKeySet::default())),
        }
    }
}

async fn healthcheck(_req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    Ok(tide::Response::builder(200)
        .content_type(tide::http::mime::JSON)
        .body(tide::prelude::json!({"status": "available"}))
        .build())
}

async fn rate_limit_payment(state: &WebState, agent_id: &str) -> Result<(), tide::Error> {
    if state.pipeline.check_rate_limit(agent_id).await {
        Ok(())
    } else {
        Err(server_error(Error::RateLimited {
            key: agent_id.to_string(),
        }))
    }
}

async fn rate_limit_admin(state: &WebState) -> Result<(), tide::Error> {
    if state.admin_limiter.allow("admin").await {
        Ok(())
    } else {
        Err(server_error(Error::RateLimited {
            key: "admin".to_string(),
        }))
    }
}

async fn map_pipeline_result(
    req: &tide::Request<WebState>,
    result: Result<ExecutionResult, pipeline::PipelineError>,
) -> Result<tide::Response, tide::Error> {
    match result {
        Ok(result) => response(req, result),
        Err(err) => Err(server_error(Error::Internal {
            msg: err.to_string(),
        })),
    }
}

async fn ap2_execute(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let bundle: MandateChain = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    rate_limit_payment(req.state(), &bundle.payment.envelope.subject).await?;
    let result = req.state().pipeline.execute_chain(bundle).await;
    map_pipeline_result(&req, result).await
}

async fn mvp_validate(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let mandate: Mandate = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    let verdict = req.state().pipeline.validate_mandate(&mandate).await;
    response(&req, verdict)
}

async fn mvp_execute(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let payment: PaymentMandate = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    rate_limit_payment(req.state(), &payment.envelope.subject).await?;
    let result = req.state().pipeline.execute_payment(payment).await;
    map_pipeline_result(&req, result).await
}

#[derive(Debug, Deserialize)]
struct LedgerQuery {
    wallet_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    50
}

async fn ledger_entries(req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let query: LedgerQuery = req.query().map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    let entries = req
        .state()
        .pipeline
        .ledger()
        .list_entries(query.wallet_id.as_deref(), query.limit, query.offset)
        .await;
    response(&req, entries)
}

async fn ledger_entry(req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let tx_id = req.param("tx_id")?;
    match req.state().pipeline.ledger().get_entry(tx_id).await {
        Some(entry) => response(&req, entry),
        None => Err(server_error(Error::NotFound {
            what: format!("ledger entry {}", tx_id),
        })),
    }
}

async fn ledger_verify(req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let tx_id = req.param("tx_id")?;
    match req.state().pipeline.ledger().verify(tx_id).await {
        Ok(report) => response(&req, report),
        Err(_) => Err(server_error(Error::NotFound {
            what: format!("ledger entry {}", tx_id),
        })),
    }
}

#[derive(Debug, Deserialize)]
struct CreateHoldBody {
    wallet_id: String,
    merchant_domain: String,
    amount: Decimal,
    currency: String,
    ttl_secs: Option<u64>,
}

async fn create_hold(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    rate_limit_admin(req.state()).await?;
    let body: CreateHoldBody = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    let hold = req
        .state()
        .holds
        .create(
            &body.wallet_id,
            &body.merchant_domain,
            body.amount,
            &body.currency,
            body.ttl_secs,
        )
        .await;
    response(&req, hold)
}

#[derive(Debug, Default, Deserialize)]
struct CaptureHoldBody {
    amount: Option<Decimal>,
}

async fn capture_hold(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    rate_limit_admin(req.state()).await?;
    let body: CaptureHoldBody = request_body(&mut req).await.unwrap_or_default();
    let hold_id = req.param("id")?.to_string();
    match req.state().holds.capture(&hold_id, body.amount).await {
        Ok(hold) => response(&req, hold),
        Err(err) => Err(server_error(Error::NotFound {
            what: err.to_string(),
        })),
    }
}

async fn void_hold(req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    rate_limit_admin(req.state()).await?;
    let hold_id = req.param("id")?.to_string();
    match req.state().holds.void(&hold_id).await {
        Ok(hold) => response(&req, hold),
        Err(err) => Err(server_error(Error::NotFound {
            what: err.to_string(),
        })),
    }
}

#[derive(Debug, Deserialize)]
struct CreateApprovalBody {
    agent_id: String,
    action: String,
    ttl_secs: Option<u64>,
}

async fn create_approval(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    rate_limit_admin(req.state()).await?;
    let body: CreateApprovalBody = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    let approval = req
        .state()
        .approvals
        .request(&body.agent_id, &body.action, body.ttl_secs)
        .await;
    response(&req, approval)
}

#[derive(Debug, Deserialize)]
struct ResolveApprovalBody {
    operator: String,
}

async fn approve_approval(
    mut req: tide::Request<WebState>,
) -> Result<tide::Response, tide::Error> {
    rate_limit_admin(req.state()).await?;
    let body: ResolveApprovalBody = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    let approval_id = req.param("id")?.to_string();
    match req
        .state()
        .approvals
        .approve(&approval_id, &body.operator)
        .await
    {
        Ok(approval) => response(&req, approval),
        Err(err) => Err(server_error(Error::NotFound {
            what: err.to_string(),
        })),
    }
}

async fn deny_approval(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    rate_limit_admin(req.state()).await?;
    let body: ResolveApprovalBody = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    let approval_id = req.param("id")?.to_string();
    match req.state().approvals.deny(&approval_id, &body.operator).await {
        Ok(approval) => response(&req, approval),
        Err(err) => Err(server_error(Error::NotFound {
            what: err.to_string(),
        })),
    }
}

#[derive(Debug, Deserialize)]
struct IssueChallengeBody {
    amount_minor: u64,
    token: String,
    chain: String,
    pay_to: String,
}

/// Issue an x402 challenge for a metered resource.
async fn x402_challenge(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    rate_limit_admin(req.state()).await?;
    let body: IssueChallengeBody = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    let challenge = req
        .state()
        .x402
        .issue_challenge(body.amount_minor, &body.token, &body.chain, &body.pay_to)
        .await;
    response(&req, challenge)
}

#[derive(Debug, Deserialize)]
struct X402SettleBody {
    response: X402Response,
    payment: PaymentMandate,
}

/// Settle an x402 challenge: validate the response's linkage to its
/// challenge, then run the payment mandate through the pipeline.
async fn x402_settle(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let body: X402SettleBody = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    rate_limit_payment(req.state(), &body.payment.envelope.subject).await?;
    let state = req.state();
    let verdict = state
        .pipeline
        .verifier()
        .verify_x402(&state.x402, &body.response, &body.payment)
        .await;
    if !verdict.accepted {
        return response(&req, verdict);
    }
    let result = state.pipeline.execute_payment(body.payment).await;
    map_pipeline_result(&req, result).await
}

/// Register a JWKS key trusted for agent-to-agent envelopes. A key replaces
/// any previous key with the same kid.
async fn a2a_register_key(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    rate_limit_admin(req.state()).await?;
    let key: TapKey = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    let mut keys = req.state().tap_keys.write().await;
    keys.keys.retain(|k| k.kid != key.kid);
    keys.keys.push(key);
    Ok(tide::Response::new(StatusCode::Ok))
}

/// Validate a signed agent-to-agent message envelope.
async fn a2a_message(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let envelope: TapEnvelope = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    let state = req.state();
    let verdict = {
        let keys = state.tap_keys.read().await;
        state.pipeline.verifier().verify_tap(&keys, &envelope)
    };
    if verdict.accepted {
        state
            .pipeline
            .events()
            .publish(Event::new(
                "a2a.message",
                serde_json::json!({
                    "from_agent": envelope.from_agent,
                    "to_agent": envelope.to_agent,
                }),
            ))
            .await;
    }
    response(&req, verdict)
}

/// Agent-to-agent payment: a TAP envelope whose body carries the payment
/// mandate. The envelope authenticates the sender; the mandate goes through
/// the full pipeline like any other.
async fn a2a_pay(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let envelope: TapEnvelope = request_body(&mut req).await.map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    let state = req.state();
    let verdict = {
        let keys = state.tap_keys.read().await;
        state.pipeline.verifier().verify_tap(&keys, &envelope)
    };
    if !verdict.accepted {
        return response(&req, verdict);
    }
    let payment: PaymentMandate = serde_json::from_value(
        envelope
            .body
            .get("payment")
            .cloned()
            .unwrap_or(serde_json::Value::Null),
    )
    .map_err(|err| {
        server_error(Error::Deserialize {
            msg: format!("envelope body has no payment mandate: {}", err),
        })
    })?;
    rate_limit_payment(state, &payment.envelope.subject).await?;
    let result = state.pipeline.execute_payment(payment).await;
    map_pipeline_result(&req, result).await
}

#[derive(Debug, Deserialize)]
struct WebhookEnvelope {
    event_id: String,
}

/// Webhook ingestion: HMAC over the raw body, then replay dedup on
/// (provider, event_id).
async fn ingest_webhook(mut req: tide::Request<WebState>) -> Result<tide::Response, tide::Error> {
    let provider = req.param("provider")?.to_string();
    let body = req.body_bytes().await?;
    let state = req.state();

    let secret = state.webhook_secrets.get(&provider).ok_or_else(|| {
        server_error(Error::WebhookAuth {
            provider: provider.clone(),
        })
    })?;
    let signature = req
        .header("X-Webhook-Signature")
        .map(|values| values.as_str().to_string())
        .unwrap_or_default();
    if !signature_matches(secret.as_bytes(), &body, &signature) {
        return Err(server_error(Error::WebhookAuth { provider }));
    }

    let envelope: WebhookEnvelope = serde_json::from_slice(&body).map_err(|err| {
        server_error(Error::Deserialize {
            msg: err.to_string(),
        })
    })?;
    if !state
        .webhook_guard
        .check_and_store(&provider, &envelope.event_id)
        .await
    {
        return Err(server_error(Error::WebhookReplay {
            provider,
            event_id: envelope.event_id,
        }));
    }
    tracing::info!(provider = %provider, event_id = %envelope.event_id, "webhook accepted");
    Ok(tide::Response::new(StatusCode::Ok))
}

/// Start the orchestrator web server.
pub fn init_web_server(
    state: WebState,
    port: u16,
) -> task::JoinHandle<Result<(), std::io::Error>> {
    let mut web_server = tide::with_state(state);
    web_server.with(
        CorsMiddleware::new()
            .allow_methods("GET, POST".parse::<HeaderValue>().unwrap())
            .allow_headers("*".parse::<HeaderValue>().unwrap())
            .allow_origin(Origin::from("*"))
            .allow_credentials(true),
    );
    web_server.with(add_error_body::<_, Error>);
    web_server.at("/healthcheck").get(healthcheck);

    let mut api = web_server.at("/api/v2");
    api.at("/ap2/payments/execute").post(ap2_execute);
    api.at("/mvp/mandates/validate").post(mvp_validate);
    api.at("/mvp/payments/execute").post(mvp_execute);
    api.at("/x402/challenges").post(x402_challenge);
    api.at("/x402/settle").post(x402_settle);
    api.at("/a2a/keys").post(a2a_register_key);
    api.at("/a2a/messages").post(a2a_message);
    api.at("/a2a/pay").post(a2a_pay);
    api.at("/ledger/entries").get(ledger_entries);
    api.at("/ledger/entries/:tx_id").get(ledger_entry);
    api.at("/ledger/entries/:tx_id/verify").get(ledger_verify);
    api.at("/holds").post(create_hold);
    api.at("/holds/:id/capture").post(capture_hold);
    api.at("/holds/:id/void").post(void_hold);
    api.at("/approvals").post(create_approval);
    api.at("/approvals/:id/approve").post(approve_approval);
    api.at("/approvals/:id/deny").post(deny_approval);
    api.at("/webhooks/:provider").post(ingest_webhook);

    let addr = format!("0.0.0.0:{}", port);
    async_std::task::spawn(web_server.listen(addr))
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use async_std::task::sleep;
    use std::time::Duration;

    const STARTUP_RETRIES: usize = 8;

    pub async fn wait_for_server(port: u16) {
        let mut backoff = Duration::from_millis(100);
        for _ in 0..STARTUP_RETRIES {
            if surf::connect(format!("http://localhost:{}", port))
                .send()
                .await
                .is_ok()
            {
                return;
            }
            sleep(backoff).await;
            backoff *= 2;
        }
        panic!("Orchestrator did not start in {:?}", backoff);
    }
}
