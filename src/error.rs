//! HTTP-facing errors.
//!
//! Billing code reports [`BillingError`](crate::billing::BillingError); the
//! handlers convert it into [`TollgateError`], which decides the status code
//! and what the client is allowed to see.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::collections::HashMap;

/// The main error type for Tollgate handlers
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The action needs a fee or subscription first.
    #[error("Payment required: {0}")]
    PaymentRequired(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    /// The gateway or the store could not be reached; safe to retry.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

/// Extra fields returned alongside an error.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub error_id: Option<String>,
    pub details: Option<String>,
    pub context: HashMap<String, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details = Some(detail.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// An error plus the context a client needs to act on it, e.g. the fee and
/// plan attached to a `402 Payment Required`.
#[derive(Debug)]
pub struct ErrorWithContext {
    error: TollgateError,
    context: ErrorContext,
}

impl ErrorWithContext {
    pub fn error(&self) -> &TollgateError {
        &self.error
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }
}

impl std::fmt::Display for ErrorWithContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.context.details {
            Some(details) => write!(f, "{} ({})", self.error, details),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for ErrorWithContext {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<ErrorWithContext> for TollgateError {
    fn from(err: ErrorWithContext) -> Self {
        err.error
    }
}

impl IntoResponse for ErrorWithContext {
    fn into_response(self) -> Response {
        self.error.respond(Some(self.context))
    }
}

/// JSON error body.
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    error_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    context: HashMap<String, String>,
}

impl TollgateError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn payment_required(msg: impl Into<String>) -> Self {
        Self::PaymentRequired(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn with_context(self, context: ErrorContext) -> ErrorWithContext {
        ErrorWithContext {
            error: self,
            context,
        }
    }

    pub(crate) fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// What the client sees. Server errors never carry their message.
    fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            Self::ServiceUnavailable(_) => "Service unavailable, please retry later".to_string(),
            other => other.to_string(),
        }
    }

    fn respond(self, context: Option<ErrorContext>) -> Response {
        let status = self.status_code();
        let context = context.unwrap_or_default();
        let error_id = context
            .error_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request failed"
            );
        } else {
            tracing::debug!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Request rejected"
            );
        }

        let body = ErrorResponse {
            error: self.client_message(),
            error_id,
            details: context.details,
            context: context.context,
        };
        (status, Json(body)).into_response()
    }
}

impl IntoResponse for TollgateError {
    fn into_response(self) -> Response {
        self.respond(None)
    }
}

/// Result type alias for Tollgate handlers
pub type Result<T> = std::result::Result<T, TollgateError>;

impl From<serde_json::Error> for TollgateError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            TollgateError::BadRequest(format!("JSON error: {}", err))
        } else {
            TollgateError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_payment_required_status() {
        let err = TollgateError::payment_required("fee owed");
        assert_eq!(err.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(err.client_message(), "Payment required: fee owed");
    }

    #[test]
    fn test_service_unavailable_is_retry_hint() {
        let err = TollgateError::service_unavailable("gateway timed out after 60s");
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.client_message(), "Service unavailable, please retry later");
    }

    #[test]
    fn test_internal_errors_hide_message() {
        let err = TollgateError::internal("connection string leaked");
        assert_eq!(err.client_message(), "Internal server error");
    }

    #[test]
    fn test_json_syntax_error_is_bad_request() {
        let err: TollgateError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_with_context_display() {
        let err = TollgateError::payment_required("fee owed")
            .with_context(ErrorContext::new().with_detail("job posting fee"));
        assert_eq!(err.to_string(), "Payment required: fee owed (job posting fee)");
        assert!(matches!(err.error(), TollgateError::PaymentRequired(_)));
    }

    #[tokio::test]
    async fn test_context_reaches_response_body() {
        let response = TollgateError::payment_required("subscription needed")
            .with_context(ErrorContext::new().with_context("amount", "5000"))
            .into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["context"]["amount"], "5000");
        assert!(body["error_id"].is_string());
    }
}
