//! `/health` endpoint.
//!
//! Answers `200` while every component is healthy or degraded and `503` as
//! soon as one is unhealthy, so a load balancer can pull a replica whose
//! store has gone away.

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::app::AppContext;
use crate::billing::BillingStore;

#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result for one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: Vec<ComponentHealth>,
}

impl IntoResponse for HealthResponse {
    fn into_response(self) -> Response {
        let status_code = match self.status {
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::OK,
        };
        (status_code, Json(self)).into_response()
    }
}

/// A component that can report on itself.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> ComponentHealth;
}

/// Reports whether the billing store answers.
pub struct BillingStoreHealthCheck {
    store: Arc<dyn BillingStore>,
}

impl BillingStoreHealthCheck {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for BillingStoreHealthCheck {
    fn name(&self) -> &str {
        "billing_store"
    }

    async fn check(&self) -> ComponentHealth {
        let (status, message) = match self.store.ping().await {
            Ok(()) => (HealthStatus::Healthy, None),
            Err(e) => {
                tracing::warn!(error = %e, "Billing store health check failed");
                (
                    HealthStatus::Unhealthy,
                    Some("billing store unreachable".to_string()),
                )
            }
        };
        ComponentHealth {
            name: self.name().to_string(),
            status,
            message,
        }
    }
}

/// Runs registered checks and folds them into one status.
#[derive(Default)]
pub struct HealthChecker {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    pub async fn check_health(&self) -> HealthResponse {
        let mut checks = Vec::with_capacity(self.checks.len());
        let mut overall = HealthStatus::Healthy;

        for check in &self.checks {
            let result = check.check().await;
            overall = match (&overall, &result.status) {
                (_, HealthStatus::Unhealthy) | (HealthStatus::Unhealthy, _) => {
                    HealthStatus::Unhealthy
                }
                (_, HealthStatus::Degraded) | (HealthStatus::Degraded, _) => HealthStatus::Degraded,
                _ => HealthStatus::Healthy,
            };
            checks.push(result);
        }

        HealthResponse {
            status: overall,
            checks,
        }
    }
}

pub async fn health_handler(State(ctx): State<AppContext>) -> HealthResponse {
    HealthChecker::new()
        .with_check(Arc::new(BillingStoreHealthCheck::new(
            ctx.billing.store.clone(),
        )))
        .check_health()
        .await
}

pub fn health_routes() -> Router<AppContext> {
    Router::new().route("/health", get(health_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::InMemoryBillingStore;

    struct Fixed(HealthStatus);

    #[async_trait]
    impl HealthCheck for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn check(&self) -> ComponentHealth {
            ComponentHealth {
                name: self.name().to_string(),
                status: self.0.clone(),
                message: None,
            }
        }
    }

    #[tokio::test]
    async fn test_in_memory_store_is_healthy() {
        let store: Arc<dyn BillingStore> = Arc::new(InMemoryBillingStore::new());
        let response = HealthChecker::new()
            .with_check(Arc::new(BillingStoreHealthCheck::new(store)))
            .check_health()
            .await;
        assert_eq!(response.status, HealthStatus::Healthy);
        assert_eq!(response.checks.len(), 1);
        assert_eq!(response.checks[0].name, "billing_store");
    }

    #[tokio::test]
    async fn test_degraded_still_answers_ok() {
        let response = HealthChecker::new()
            .with_check(Arc::new(Fixed(HealthStatus::Healthy)))
            .with_check(Arc::new(Fixed(HealthStatus::Degraded)))
            .check_health()
            .await;
        assert_eq!(response.status, HealthStatus::Degraded);
        assert_eq!(response.into_response().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unhealthy_component_fails_overall() {
        let response = HealthChecker::new()
            .with_check(Arc::new(Fixed(HealthStatus::Unhealthy)))
            .with_check(Arc::new(Fixed(HealthStatus::Degraded)))
            .check_health()
            .await;
        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert_eq!(
            response.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
