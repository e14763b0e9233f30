//! Live ZenoPay client.
//!
//! Mobile-money collection for Tanzania over the ZenoPay HTTP API, with
//! retry on transient failures and redacted API key handling.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;

use super::{GatewayPaymentStatus, InitiationReceipt, OrderStatus, PaymentGateway, PaymentRequest};
use crate::billing::error::{BillingError, Result};

pub const DEFAULT_BASE_URL: &str = "https://zenoapi.com";
const INITIATE_PATH: &str = "/api/payments/mobile_money_tanzania";
const ORDER_STATUS_PATH: &str = "/api/payments/order-status";
const API_KEY_HEADER: &str = "x-api-key";

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the live ZenoPay client.
#[derive(Debug, Clone)]
pub struct ZenoPayConfig {
    /// API root, without a trailing slash.
    pub base_url: String,
    /// Where ZenoPay should deliver payment callbacks.
    pub webhook_url: Option<String>,
    /// Maximum number of retry attempts for transient failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    pub max_delay_ms: u64,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for ZenoPayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            webhook_url: None,
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            timeout_seconds: 60,
        }
    }
}

impl ZenoPayConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn webhook_url(mut self, url: Option<String>) -> Self {
        self.webhook_url = url;
        self
    }

    /// Set maximum retry attempts.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set base delay for exponential backoff.
    #[must_use]
    pub fn base_delay_ms(mut self, ms: u64) -> Self {
        self.base_delay_ms = ms;
        self
    }

    /// Set maximum delay between retries.
    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Set request timeout.
    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

// ============================================================================
// Client
// ============================================================================

/// ZenoPay API client.
#[derive(Clone)]
pub struct LiveZenoPayClient {
    http: reqwest::Client,
    api_key: SecretString,
    config: ZenoPayConfig,
}

impl LiveZenoPayClient {
    /// Create a client. Fails if the API key is blank.
    pub fn new(api_key: SecretString, config: ZenoPayConfig) -> Result<Self> {
        if api_key.expose_secret().trim().is_empty() {
            return Err(BillingError::validation("ZenoPay API key cannot be empty"));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("tollgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BillingError::internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_key,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ZenoPayConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn initiate_once(
        &self,
        url: &str,
        payload: &InitiatePayload<'_>,
    ) -> std::result::Result<InitiationReceipt, AttemptError> {
        let response = self
            .http
            .post(url)
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(AttemptError::from_transport)?;

        let body = read_body(response).await?;

        if body.get("status").and_then(Value::as_str) != Some("success") {
            return Err(AttemptError::Rejected(
                str_field(&body, "message").unwrap_or_else(|| "payment initiation failed".to_string()),
            ));
        }

        Ok(InitiationReceipt {
            gateway_order_id: str_field(&body, "order_id")
                .unwrap_or_else(|| payload.order_id.to_string()),
            message: str_field(&body, "message"),
            result_code: str_field(&body, "resultcode"),
        })
    }

    async fn poll_once(
        &self,
        url: &str,
        order_id: &str,
    ) -> std::result::Result<OrderStatus, AttemptError> {
        let response = self
            .http
            .get(url)
            .query(&[("order_id", order_id)])
            .header(API_KEY_HEADER, self.api_key.expose_secret())
            .send()
            .await
            .map_err(AttemptError::from_transport)?;

        let body = read_body(response).await?;

        if body.get("result").and_then(Value::as_str) != Some("SUCCESS") {
            return Err(AttemptError::Rejected(
                str_field(&body, "message").unwrap_or_else(|| "order status lookup failed".to_string()),
            ));
        }

        let entry = body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|data| data.first())
            .ok_or_else(|| AttemptError::Rejected(format!("no payment data for order {}", order_id)))?;

        let status = str_field(entry, "payment_status")
            .map(|s| GatewayPaymentStatus::parse(&s))
            .unwrap_or_else(|| GatewayPaymentStatus::Unknown(String::new()));

        Ok(OrderStatus {
            order_id: order_id.to_string(),
            status,
            amount: entry.get("amount").and_then(parse_amount),
            channel: str_field(entry, "channel"),
            reference: str_field(entry, "reference"),
            gateway_transaction_id: str_field(entry, "transid"),
        })
    }
}

impl std::fmt::Debug for LiveZenoPayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveZenoPayClient")
            .field("config", &self.config)
            .field("api_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PaymentGateway for LiveZenoPayClient {
    async fn initiate(&self, request: &PaymentRequest) -> Result<InitiationReceipt> {
        let url = self.url(INITIATE_PATH);
        let url = url.as_str();
        let payload = InitiatePayload {
            order_id: &request.order_id,
            buyer_email: &request.buyer.email,
            buyer_name: &request.buyer.name,
            buyer_phone: &request.buyer.phone,
            amount: request.amount,
            webhook_url: self.config.webhook_url.as_deref(),
        };
        let payload = &payload;

        with_retry(&self.config, "initiate", || self.initiate_once(url, payload)).await
    }

    async fn poll_status(&self, order_id: &str) -> Result<OrderStatus> {
        let url = self.url(ORDER_STATUS_PATH);
        let url = url.as_str();

        with_retry(&self.config, "order_status", || self.poll_once(url, order_id)).await
    }
}

/// Stand-in used when no API key is configured.
///
/// Every initiation is refused outright, so no transaction waits on a charge
/// that can never happen.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredGateway;

#[async_trait]
impl PaymentGateway for UnconfiguredGateway {
    async fn initiate(&self, request: &PaymentRequest) -> Result<InitiationReceipt> {
        tracing::warn!(
            target: "tollgate::billing::zenopay",
            order_id = %request.order_id,
            "Payment gateway is not configured"
        );
        Err(BillingError::gateway_rejected("payment gateway is not configured"))
    }

    async fn poll_status(&self, _order_id: &str) -> Result<OrderStatus> {
        Err(BillingError::gateway_unavailable("payment gateway is not configured"))
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct InitiatePayload<'a> {
    order_id: &'a str,
    buyer_email: &'a str,
    buyer_name: &'a str,
    buyer_phone: &'a str,
    amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_url: Option<&'a str>,
}

/// Read a JSON body, classifying the HTTP status first.
async fn read_body(response: reqwest::Response) -> std::result::Result<Value, AttemptError> {
    let status = response.status();
    if is_transient_status(status) {
        return Err(AttemptError::Transient(format!("HTTP {}", status.as_u16())));
    }

    let body = response.json::<Value>().await;

    if !status.is_success() {
        let message = body
            .ok()
            .and_then(|b| str_field(&b, "message"))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        return Err(AttemptError::Rejected(message));
    }

    // A 200 we cannot read says nothing about whether the charge went through
    body.map_err(|e| AttemptError::Transient(format!("unreadable response body: {}", e)))
}

/// String-or-number field as a string.
pub(crate) fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Amounts come back as numbers or as strings like `"1000.00"`.
pub(crate) fn parse_amount(value: &Value) -> Option<i64> {
    let amount = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64))?,
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64))?
        }
        _ => return None,
    };
    Some(amount)
}

// ============================================================================
// Retry Logic
// ============================================================================

/// Outcome of a single attempt that did not succeed.
#[derive(Debug)]
enum AttemptError {
    /// Worth retrying: network failure, timeout, 429 or 5xx.
    Transient(String),
    /// The gateway answered and said no.
    Rejected(String),
}

impl AttemptError {
    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Transient("request timed out".to_string())
        } else if err.is_connect() {
            Self::Transient(format!("connection failed: {}", err))
        } else if err.is_builder() {
            Self::Rejected(format!("invalid request: {}", err))
        } else {
            Self::Transient(err.to_string())
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

async fn with_retry<T, F, Fut>(config: &ZenoPayConfig, operation: &str, operation_fn: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, AttemptError>>,
{
    let timeout_duration = Duration::from_secs(config.timeout_seconds);
    let mut attempts = 0;

    loop {
        let outcome = match tokio::time::timeout(timeout_duration, operation_fn()).await {
            Ok(outcome) => outcome,
            Err(_elapsed) => Err(AttemptError::Transient(format!(
                "request timed out after {} seconds",
                config.timeout_seconds
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(AttemptError::Rejected(message)) => {
                return Err(BillingError::gateway_rejected(message));
            }
            Err(AttemptError::Transient(message)) => {
                if attempts >= config.max_retries {
                    return Err(BillingError::gateway_unavailable(format!(
                        "{} failed after {} attempts: {}",
                        operation,
                        attempts + 1,
                        message
                    )));
                }

                let delay = calculate_backoff_delay(attempts, config.base_delay_ms, config.max_delay_ms);
                tracing::warn!(
                    target: "tollgate::billing::zenopay",
                    operation = operation,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Retrying ZenoPay call after transient error"
                );
                tokio::time::sleep(delay).await;
                attempts += 1;
            }
        }
    }
}

/// Calculate backoff delay with jitter.
fn calculate_backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let delay_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let delay_ms = delay_ms.min(max_ms);

    // Jitter of up to 25%
    let jitter = if delay_ms > 0 {
        fastrand::u64(0..=delay_ms / 4)
    } else {
        0
    };
    Duration::from_millis(delay_ms.saturating_add(jitter))
}
