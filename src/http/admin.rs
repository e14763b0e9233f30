//! Admin endpoints for the billing policy and plan catalog.
//!
//! Authentication is expected upstream; the acting admin is taken from the
//! `x-admin-actor` header for the audit trail.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
};

use crate::app::AppContext;
use crate::billing::{BillingPolicy, PaymentPlan, PolicyUpdate};
use crate::error::Result;
use crate::http::RouteModule;

const ACTOR_HEADER: &str = "x-admin-actor";

/// Routes under `/admin`.
pub struct AdminSettingsModule;

impl RouteModule for AdminSettingsModule {
    fn routes(&self) -> Router<AppContext> {
        Router::new()
            .route("/settings", get(get_settings).patch(update_settings))
            .route("/settings/reset", post(reset_settings))
            .route("/plans", get(list_all_plans))
            .route("/plans/:plan_id/toggle", post(toggle_plan))
    }

    fn prefix(&self) -> Option<&str> {
        Some("/admin")
    }
}

fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .unwrap_or("admin")
        .to_string()
}

async fn get_settings(State(ctx): State<AppContext>) -> Result<Json<BillingPolicy>> {
    Ok(Json(ctx.billing.policy.current().await?))
}

async fn update_settings(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    Json(update): Json<PolicyUpdate>,
) -> Result<Json<BillingPolicy>> {
    let policy = ctx.billing.policy.update(&update, &actor(&headers)).await?;
    Ok(Json(policy))
}

async fn reset_settings(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
) -> Result<Json<BillingPolicy>> {
    let policy = ctx.billing.policy.reset_to_defaults(&actor(&headers)).await?;
    Ok(Json(policy))
}

async fn list_all_plans(State(ctx): State<AppContext>) -> Result<Json<Vec<PaymentPlan>>> {
    Ok(Json(ctx.billing.plans.list_all().await?))
}

async fn toggle_plan(
    State(ctx): State<AppContext>,
    Path(plan_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PaymentPlan>> {
    let current = ctx.billing.plans.get(&plan_id).await?;
    let plan = ctx
        .billing
        .plans
        .set_active(&plan_id, !current.is_active)
        .await?;

    tracing::info!(
        actor = %actor(&headers),
        plan_id = %plan.id,
        is_active = plan.is_active,
        "Plan availability changed"
    );
    Ok(Json(plan))
}
