//! HTTP surface tests driven through `tower::ServiceExt::oneshot`.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tollgate::billing::error::Result as BillingResult;
use tollgate::billing::{
    InitiationReceipt, OrderStatus, PaymentGateway, PaymentRequest, default_catalog,
    GatewayPaymentStatus,
};
use tollgate::{App, AppContext};
use tower::ServiceExt;

const SECRET: &str = "zp_http_key";

struct AcceptingGateway;

#[async_trait]
impl PaymentGateway for AcceptingGateway {
    async fn initiate(&self, request: &PaymentRequest) -> BillingResult<InitiationReceipt> {
        Ok(InitiationReceipt {
            gateway_order_id: request.order_id.clone(),
            message: Some("Request in progress".to_string()),
            result_code: Some("000".to_string()),
        })
    }

    async fn poll_status(&self, order_id: &str) -> BillingResult<OrderStatus> {
        Ok(OrderStatus {
            order_id: order_id.to_string(),
            status: GatewayPaymentStatus::Pending,
            amount: None,
            channel: None,
            reference: None,
            gateway_transaction_id: None,
        })
    }
}

async fn test_app() -> Router {
    let context = AppContext::builder()
        .with_gateway(Arc::new(AcceptingGateway))
        .with_webhook_secret(SECRET)
        .build();
    context.billing.plans.seed(default_catalog()).await.unwrap();

    App::builder()
        .with_context(context)
        .with_billing_routes()
        .build()
        .into_test_router()
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn initiate_body(key: &str) -> Value {
    json!({
        "idempotency_key": key,
        "user_id": "user-1",
        "type": "subscription",
        "plan_id": "basic-monthly",
        "buyer": {
            "name": "Juma Hassan",
            "email": "juma@example.com",
            "phone": "255712345678"
        }
    })
}

#[tokio::test]
async fn test_health_reports_billing_store() {
    let app = test_app().await;
    let (status, body) = send(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_authorize_in_free_mode_is_allowed() {
    let app = test_app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/actions/post_job/authorize",
        Some(json!({ "user_id": "user-1" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], true);
    assert_eq!(body["fee_required"], false);
}

#[tokio::test]
async fn test_enforced_denial_answers_payment_required() {
    let app = test_app().await;
    let (status, _) = send(
        &app,
        Method::PATCH,
        "/admin/settings",
        Some(json!({ "payments_enabled": true, "mode": "subscription_required" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Method::POST,
        "/actions/apply_job/authorize",
        Some(json!({ "user_id": "user-1", "enforce": true })),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["context"]["amount"], "5000");
    assert_eq!(body["context"]["plan_id"], "basic-monthly");
    assert_eq!(body["context"]["payment_type"], "subscription");
}

#[tokio::test]
async fn test_initiate_then_webhook_completes_payment() {
    let app = test_app().await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/payments/initiate",
        Some(initiate_body("http-order-1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["amount"], 5000);
    assert_eq!(body["created"], true);

    let callback = json!({
        "order_id": "http-order-1",
        "payment_status": "COMPLETED",
        "reference": "REF123",
        "amount": "5000",
    });
    let request = Request::builder()
        .method(Method::POST)
        .uri("/payments/webhook")
        .header("content-type", "application/json")
        .header("x-api-key", SECRET)
        .body(Body::from(serde_json::to_vec(&callback).unwrap()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, body) = send(&app, Method::GET, "/payments/http-order-1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["gateway_reference"], "REF123");

    let (_, requirements) = send(&app, Method::GET, "/payments/requirements/user-1", None).await;
    assert_eq!(requirements["has_active_subscription"], true);
}

#[tokio::test]
async fn test_webhook_answers_ok_even_when_rejected() {
    let app = test_app().await;
    let (status, body) = send(
        &app,
        Method::POST,
        "/payments/webhook",
        Some(json!({ "order_id": "missing", "payment_status": "COMPLETED", "api_key": "wrong" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], false);
    assert_eq!(body["outcome"], "rejected");
}

#[tokio::test]
async fn test_initiate_rejects_mismatched_amount() {
    let app = test_app().await;
    let mut body = initiate_body("http-order-2");
    body["amount"] = json!(10);

    let (status, _) = send(&app, Method::POST, "/payments/initiate", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_settings_round_trip() {
    let app = test_app().await;

    let (status, before) = send(&app, Method::GET, "/admin/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(before["payments_enabled"], false);

    let (status, updated) = send(
        &app,
        Method::PATCH,
        "/admin/settings",
        Some(json!({ "payments_enabled": true, "mode": "pay_per_job", "job_posting_fee": 1500 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["mode"], "pay_per_job");
    assert_eq!(updated["job_posting_fee"], 1500);
    assert!(updated["version"].as_i64().unwrap() > before["version"].as_i64().unwrap());

    let (status, reset) = send(&app, Method::POST, "/admin/settings/reset", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reset["payments_enabled"], false);
    assert_eq!(reset["mode"], "free");
}

#[tokio::test]
async fn test_plans_can_be_listed_and_toggled() {
    let app = test_app().await;

    let (status, plans) = send(&app, Method::GET, "/plans?type=subscription", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plans.as_array().unwrap().len(), 2);

    let (status, toggled) = send(&app, Method::POST, "/admin/plans/pay-per-job/toggle", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["is_active"], false);

    let (_, active) = send(&app, Method::GET, "/plans", None).await;
    assert!(
        active
            .as_array()
            .unwrap()
            .iter()
            .all(|p| p["id"] != "pay-per-job")
    );
}
