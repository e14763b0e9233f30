//! Audit logging for billing operations.
//!
//! Money-moving events and security signals are routed through
//! [`BillingAuditLogger`] so operators can review them separately from
//! ordinary application logs. Security events (bad webhook secrets, illegal
//! state transitions, amount tampering) are kept distinct from routine ones.

use std::fmt;

use super::policy::BillingMode;
use super::transaction::TransactionStatus;

/// Audit event types for billing operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingAuditEvent {
    /// Admin changed the billing policy.
    PolicyUpdated {
        actor: String,
        mode: BillingMode,
        payments_enabled: bool,
        version: i64,
    },
    /// A pending transaction was recorded.
    TransactionCreated {
        idempotency_key: String,
        user_id: String,
        amount: i64,
    },
    /// A transaction changed status.
    TransactionTransitioned {
        idempotency_key: String,
        from: TransactionStatus,
        to: TransactionStatus,
        source: String,
    },
    /// Subscription activated or extended.
    SubscriptionActivated {
        user_id: String,
        plan_id: String,
        subscription_id: String,
    },
    /// Subscription cancelled.
    SubscriptionCancelled {
        user_id: String,
        subscription_id: String,
    },

    // Security events
    /// Webhook presented the wrong shared secret.
    WebhookAuthenticityFailure { remote: Option<String> },
    /// Webhook referenced an order id we never issued.
    WebhookUnknownOrder { order_id: String },
    /// Gateway-reported amount differs from the stored amount.
    AmountMismatch {
        idempotency_key: String,
        expected: i64,
        reported: i64,
    },
    /// A state machine edge that should never be requested.
    IllegalTransition {
        idempotency_key: String,
        from: TransactionStatus,
        to: TransactionStatus,
        source: String,
    },
}

impl BillingAuditEvent {
    /// Security events are logged at a higher level and reviewed separately.
    #[must_use]
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::WebhookAuthenticityFailure { .. }
                | Self::WebhookUnknownOrder { .. }
                | Self::AmountMismatch { .. }
                | Self::IllegalTransition { .. }
        )
    }

    /// Event kind for structured logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PolicyUpdated { .. } => "policy_updated",
            Self::TransactionCreated { .. } => "transaction_created",
            Self::TransactionTransitioned { .. } => "transaction_transitioned",
            Self::SubscriptionActivated { .. } => "subscription_activated",
            Self::SubscriptionCancelled { .. } => "subscription_cancelled",
            Self::WebhookAuthenticityFailure { .. } => "webhook_authenticity_failure",
            Self::WebhookUnknownOrder { .. } => "webhook_unknown_order",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::IllegalTransition { .. } => "illegal_transition",
        }
    }
}

impl fmt::Display for BillingAuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PolicyUpdated { actor, mode, payments_enabled, version } => {
                write!(f, "Policy updated: actor={}, mode={}, payments_enabled={}, version={}", actor, mode, payments_enabled, version)
            }
            Self::TransactionCreated { idempotency_key, user_id, amount } => {
                write!(f, "Transaction created: key={}, user={}, amount={}", idempotency_key, user_id, amount)
            }
            Self::TransactionTransitioned { idempotency_key, from, to, source } => {
                write!(f, "Transaction transitioned: key={}, {} -> {}, source={}", idempotency_key, from, to, source)
            }
            Self::SubscriptionActivated { user_id, plan_id, subscription_id } => {
                write!(f, "Subscription activated: user={}, plan={}, sub={}", user_id, plan_id, subscription_id)
            }
            Self::SubscriptionCancelled { user_id, subscription_id } => {
                write!(f, "Subscription cancelled: user={}, sub={}", user_id, subscription_id)
            }
            Self::WebhookAuthenticityFailure { remote } => {
                write!(f, "Webhook authenticity failure: remote={}", remote.as_deref().unwrap_or("unknown"))
            }
            Self::WebhookUnknownOrder { order_id } => {
                write!(f, "Webhook for unknown order: order={}", order_id)
            }
            Self::AmountMismatch { idempotency_key, expected, reported } => {
                write!(f, "Amount mismatch: key={}, expected={}, reported={}", idempotency_key, expected, reported)
            }
            Self::IllegalTransition { idempotency_key, from, to, source } => {
                write!(f, "Illegal transition rejected: key={}, {} -> {}, source={}", idempotency_key, from, to, source)
            }
        }
    }
}

/// Trait for audit logging backends.
///
/// Implementations must not fail the billing operation; swallow and report
/// backend errors internally.
pub trait BillingAuditLogger: Send + Sync {
    fn log(&self, event: BillingAuditEvent);
}

/// No-op audit logger.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAuditLogger;

impl BillingAuditLogger for NoOpAuditLogger {
    fn log(&self, _event: BillingAuditEvent) {}
}

/// Tracing-based audit logger.
///
/// Routine events go out at INFO, security events at WARN, both under the
/// `tollgate::billing::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

impl BillingAuditLogger for TracingAuditLogger {
    fn log(&self, event: BillingAuditEvent) {
        if event.is_security_event() {
            tracing::warn!(
                target: "tollgate::billing::audit",
                event_type = %event.kind(),
                security = true,
                "{}", event
            );
        } else {
            tracing::info!(
                target: "tollgate::billing::audit",
                event_type = %event.kind(),
                "{}", event
            );
        }
    }
}
