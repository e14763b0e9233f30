//! Payment endpoints: authorization checks, initiation, status, refunds,
//! the gateway callback, and the public plan list.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::app::AppContext;
use crate::billing::{
    BillableAction, Decision, InitiatePayment, PaymentPlan, PaymentRequirements, PlanType,
    Transaction, WebhookOutcome,
};
use crate::error::{ErrorContext, ErrorWithContext, Result, TollgateError};
use crate::http::RouteModule;

/// Header the gateway uses to present its key on callbacks.
const WEBHOOK_SECRET_HEADER: &str = "x-api-key";

/// Routes under `/actions`, `/payments` and `/plans`.
pub struct PaymentsModule;

impl RouteModule for PaymentsModule {
    fn routes(&self) -> Router<AppContext> {
        Router::new()
            .route("/actions/:action/authorize", post(authorize_action))
            .route("/payments/initiate", post(initiate_payment))
            .route("/payments/webhook", post(payment_webhook))
            .route("/payments/requirements/:user_id", get(payment_requirements))
            .route("/payments/history/:user_id", get(payment_history))
            .route("/payments/:idempotency_key/status", get(payment_status))
            .route("/payments/:idempotency_key/refund", post(refund_payment))
            .route("/plans", get(list_plans))
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub user_id: String,
    /// Answer `402 Payment Required` instead of a decision when denied.
    #[serde(default)]
    pub enforce: bool,
}

async fn authorize_action(
    State(ctx): State<AppContext>,
    Path(action): Path<String>,
    Json(req): Json<AuthorizeRequest>,
) -> Result<Response> {
    if req.user_id.trim().is_empty() {
        return Err(TollgateError::bad_request("user_id is required"));
    }

    let decision = ctx
        .billing
        .authorization
        .authorize(&req.user_id, &BillableAction::parse(&action))
        .await?;

    if req.enforce && !decision.allowed {
        return Ok(payment_required(&decision).into_response());
    }
    Ok(Json(decision).into_response())
}

/// A `402` carrying what must be paid so the client can prompt for it.
fn payment_required(decision: &Decision) -> ErrorWithContext {
    let mut context = ErrorContext::new()
        .with_detail(decision.reason.clone())
        .with_context("amount", decision.amount.to_string())
        .with_context("currency", decision.currency.clone());
    if let Some(plan_id) = &decision.plan_id {
        context = context.with_context("plan_id", plan_id.clone());
    }
    if let Some(payment_type) = decision.payment_type {
        context = context.with_context("payment_type", payment_type.as_str());
    }
    TollgateError::payment_required(decision.reason.clone()).with_context(context)
}

#[derive(Debug, Serialize)]
pub struct InitiateResponse {
    pub transaction_id: i64,
    pub idempotency_key: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub created: bool,
    pub gateway_order_id: Option<String>,
    pub message: Option<String>,
}

async fn initiate_payment(
    State(ctx): State<AppContext>,
    Json(req): Json<InitiatePayment>,
) -> Result<Json<InitiateResponse>> {
    let initiation = ctx.billing.payments.initiate(req).await?;
    let tx = initiation.transaction;

    Ok(Json(InitiateResponse {
        transaction_id: tx.id,
        idempotency_key: tx.idempotency_key,
        status: tx.status.to_string(),
        amount: tx.amount,
        currency: tx.currency,
        created: initiation.created,
        gateway_order_id: initiation.gateway_order_id,
        message: initiation.message,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub refresh: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub idempotency_key: String,
    pub status: String,
    pub amount: i64,
    pub currency: String,
    pub gateway_reference: Option<String>,
    pub payment_channel: Option<String>,
}

impl From<Transaction> for StatusResponse {
    fn from(tx: Transaction) -> Self {
        Self {
            idempotency_key: tx.idempotency_key,
            status: tx.status.to_string(),
            amount: tx.amount,
            currency: tx.currency,
            gateway_reference: tx.gateway_reference,
            payment_channel: tx.payment_channel,
        }
    }
}

async fn payment_status(
    State(ctx): State<AppContext>,
    Path(idempotency_key): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>> {
    let tx = ctx
        .billing
        .payments
        .status(&idempotency_key, query.refresh)
        .await?;
    Ok(Json(tx.into()))
}

#[derive(Debug, Default, Deserialize)]
pub struct RefundRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

async fn refund_payment(
    State(ctx): State<AppContext>,
    Path(idempotency_key): Path<String>,
    body: Option<Json<RefundRequest>>,
) -> Result<Json<Transaction>> {
    let reason = body.and_then(|Json(req)| req.reason);
    let tx = ctx
        .billing
        .payments
        .refund(&idempotency_key, reason.as_deref())
        .await?;
    Ok(Json(tx))
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub accepted: bool,
    pub outcome: &'static str,
}

/// Always answers `200`: the gateway retries on anything else, and a
/// rejected callback will not get better by being resent.
async fn payment_webhook(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<WebhookResponse> {
    let presented = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = ctx.billing.webhooks.handle_callback(&body, presented).await;

    Json(WebhookResponse {
        accepted: outcome.accepted(),
        outcome: match outcome {
            WebhookOutcome::Applied { .. } => "applied",
            WebhookOutcome::Recovered => "recovered",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Rejected(_) => "rejected",
        },
    })
}

async fn payment_requirements(
    State(ctx): State<AppContext>,
    Path(user_id): Path<String>,
) -> Result<Json<PaymentRequirements>> {
    let requirements = ctx
        .billing
        .authorization
        .payment_requirements(&user_id)
        .await?;
    Ok(Json(requirements))
}

async fn payment_history(
    State(ctx): State<AppContext>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Transaction>>> {
    Ok(Json(ctx.billing.payments.history(&user_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct PlanQuery {
    #[serde(default, rename = "type")]
    pub plan_type: Option<PlanType>,
}

async fn list_plans(
    State(ctx): State<AppContext>,
    Query(query): Query<PlanQuery>,
) -> Result<Json<Vec<PaymentPlan>>> {
    let plans = match query.plan_type {
        Some(plan_type) => ctx.billing.plans.list_by_type(plan_type).await?,
        None => ctx.billing.plans.list_active().await?,
    };
    Ok(Json(plans))
}
