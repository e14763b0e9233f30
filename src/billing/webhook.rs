//! Gateway webhook reconciliation.
//!
//! Each callback passes four gates in order: the shared secret, the payload
//! shape, the order lookup, and the idempotent transition. A callback that
//! fails a gate never touches the ledger. The HTTP layer answers `200` for
//! every outcome and reports business success through
//! [`WebhookOutcome::accepted`].

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use subtle::ConstantTimeEq;

use super::audit::{BillingAuditEvent, BillingAuditLogger};
use super::error::BillingError;
use super::gateway::{parse_amount, str_field, GatewayPaymentStatus};
use super::settlement::{GatewayReport, Settlement, SettlementOutcome};
use super::transaction::TransactionStatus;
use std::sync::Arc;

/// Body fields that carry the secret when the header is absent.
const SECRET_FIELDS: [&str; 2] = ["api_key", "secret"];

/// Why a callback was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookRejection {
    Authenticity,
    Malformed,
    UnknownOrder,
    AmountMismatch,
    IllegalTransition,
    Internal,
}

/// Result of handling one callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// This callback moved the transaction to `status`.
    Applied { status: TransactionStatus },
    /// The payment had already completed; this callback granted the
    /// subscription that an earlier attempt failed to write.
    Recovered,
    /// The transaction was already in (or past) the reported state.
    Duplicate,
    /// The gateway reported a non-final status; nothing to do yet.
    Ignored,
    Rejected(WebhookRejection),
}

impl WebhookOutcome {
    #[must_use]
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Authenticates and applies gateway callbacks.
#[derive(Clone)]
pub struct WebhookReconciler {
    secret: SecretString,
    settlement: Settlement,
    audit: Arc<dyn BillingAuditLogger>,
}

impl std::fmt::Debug for WebhookReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookReconciler").finish_non_exhaustive()
    }
}

impl WebhookReconciler {
    #[must_use]
    pub fn new(
        secret: SecretString,
        settlement: Settlement,
        audit: Arc<dyn BillingAuditLogger>,
    ) -> Self {
        Self {
            secret,
            settlement,
            audit,
        }
    }

    /// Handle one raw callback.
    ///
    /// `presented_secret` is the `x-api-key` header value. When it is absent
    /// the secret may be carried in the body instead.
    pub async fn handle_callback(
        &self,
        raw_payload: &[u8],
        presented_secret: Option<&str>,
    ) -> WebhookOutcome {
        let parsed = serde_json::from_slice::<Value>(raw_payload).ok();

        // 1. Authenticity
        let presented = presented_secret.map(str::to_string).or_else(|| {
            parsed
                .as_ref()
                .and_then(|body| SECRET_FIELDS.iter().find_map(|f| str_field(body, f)))
        });
        if !self.verify_secret(presented.as_deref()) {
            self.audit.log(BillingAuditEvent::WebhookAuthenticityFailure { remote: None });
            return WebhookOutcome::Rejected(WebhookRejection::Authenticity);
        }

        // 2. Shape
        let Some(report) = parsed.as_ref().and_then(parse_report) else {
            tracing::warn!(
                target: "tollgate::billing::webhook",
                "Rejecting malformed webhook payload"
            );
            return WebhookOutcome::Rejected(WebhookRejection::Malformed);
        };

        tracing::info!(
            target: "tollgate::billing::webhook",
            order_id = %report.order_id,
            payment_status = %report.status.as_str(),
            "Webhook received"
        );

        // 3 and 4. Lookup, idempotent apply, side effects
        match self.settlement.apply(&report, "webhook").await {
            Ok(SettlementOutcome::Settled { transaction, .. }) => WebhookOutcome::Applied {
                status: transaction.status,
            },
            Ok(SettlementOutcome::Recovered { .. }) => WebhookOutcome::Recovered,
            Ok(SettlementOutcome::AlreadySettled(_)) => WebhookOutcome::Duplicate,
            Ok(SettlementOutcome::StillPending(_)) => WebhookOutcome::Ignored,
            Err(BillingError::TransactionNotFound { .. }) => {
                self.audit.log(BillingAuditEvent::WebhookUnknownOrder {
                    order_id: report.order_id,
                });
                WebhookOutcome::Rejected(WebhookRejection::UnknownOrder)
            }
            // Amount mismatch and illegal transitions are audited where detected
            Err(BillingError::Validation { .. }) => {
                WebhookOutcome::Rejected(WebhookRejection::AmountMismatch)
            }
            Err(BillingError::IllegalTransition { .. }) => {
                WebhookOutcome::Rejected(WebhookRejection::IllegalTransition)
            }
            Err(e) => {
                tracing::error!(
                    target: "tollgate::billing::webhook",
                    order_id = %report.order_id,
                    error = %e,
                    "Webhook processing failed; redelivery or the sweep will finish it"
                );
                WebhookOutcome::Rejected(WebhookRejection::Internal)
            }
        }
    }

    fn verify_secret(&self, presented: Option<&str>) -> bool {
        let expected = self.secret.expose_secret().as_bytes();
        if expected.is_empty() {
            tracing::error!(
                target: "tollgate::billing::webhook",
                "Webhook secret is not configured; rejecting callback"
            );
            return false;
        }
        let Some(presented) = presented else {
            return false;
        };
        expected.ct_eq(presented.as_bytes()).into()
    }
}

fn parse_report(body: &Value) -> Option<GatewayReport> {
    let order_id = str_field(body, "order_id")?;
    let status = str_field(body, "payment_status")?;

    let metadata = body.get("metadata").filter(|m| m.is_object()).cloned();

    Some(GatewayReport {
        order_id,
        status: GatewayPaymentStatus::parse(&status),
        amount: body.get("amount").and_then(parse_amount),
        channel: str_field(body, "channel"),
        reference: str_field(body, "reference"),
        gateway_transaction_id: str_field(body, "transid"),
        metadata,
    })
}
