//! Billing-specific error types.
//!
//! Each variant corresponds to one way a billing operation can fail. The
//! classification helpers decide how the failure propagates: client errors
//! surface to the caller, retryable errors are left for the sweep.

use std::fmt;

use super::transaction::TransactionStatus;

/// Result type for billing operations.
pub type Result<T> = std::result::Result<T, BillingError>;

/// Billing-specific errors.
///
/// These errors can be converted to `TollgateError` for HTTP responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// Malformed input, rejected before any state is touched.
    Validation { message: String },

    /// The idempotency key already belongs to a transaction.
    ///
    /// Not a user-facing error: callers resolve it by fetching the existing row.
    DuplicateKey { key: String },

    /// A state machine edge outside `pending -> {completed, failed}` and
    /// `completed -> refunded` was requested.
    IllegalTransition {
        key: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// Webhook secret mismatch. Carries no detail on purpose.
    AuthenticityFailure,

    /// Network failure or timeout talking to the payment gateway.
    GatewayUnavailable { message: String },

    /// The gateway answered and explicitly refused the request.
    GatewayRejected { message: String },

    /// The policy denies the action until the stated fee is paid.
    InsufficientAuthorization {
        reason: String,
        amount: i64,
        currency: String,
        plan_id: Option<String>,
    },

    /// No transaction exists for the key.
    TransactionNotFound { key: String },

    /// No plan exists for the id.
    PlanNotFound { plan_id: String },

    /// The backing store failed.
    Storage { message: String },

    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl BillingError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn gateway_unavailable(message: impl Into<String>) -> Self {
        Self::GatewayUnavailable {
            message: message.into(),
        }
    }

    pub fn gateway_rejected(message: impl Into<String>) -> Self {
        Self::GatewayRejected {
            message: message.into(),
        }
    }

    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::DuplicateKey { .. }
                | Self::IllegalTransition { .. }
                | Self::AuthenticityFailure
                | Self::GatewayRejected { .. }
                | Self::InsufficientAuthorization { .. }
                | Self::TransactionNotFound { .. }
                | Self::PlanNotFound { .. }
        )
    }

    /// Check if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::GatewayUnavailable { .. } | Self::Storage { .. } | Self::Internal { .. }
        )
    }

    /// Check if this error is retryable.
    ///
    /// Only gateway unavailability is: the charge may still settle on the
    /// provider side, so the transaction stays pending for the sweep.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayUnavailable { .. })
    }
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { message } => write!(f, "Validation failed: {}", message),
            Self::DuplicateKey { key } => {
                write!(f, "Transaction with idempotency key '{}' already exists", key)
            }
            Self::IllegalTransition { key, from, to } => {
                write!(f, "Illegal transition for '{}': {} -> {}", key, from, to)
            }
            Self::AuthenticityFailure => write!(f, "Webhook authentication failed"),
            Self::GatewayUnavailable { message } => {
                write!(f, "Payment gateway unavailable: {}", message)
            }
            Self::GatewayRejected { message } => {
                write!(f, "Payment gateway rejected the request: {}", message)
            }
            Self::InsufficientAuthorization {
                reason,
                amount,
                currency,
                plan_id,
            } => {
                write!(f, "{}: payment of {} {} required", reason, amount, currency)?;
                if let Some(plan) = plan_id {
                    write!(f, " (plan: {})", plan)?;
                }
                Ok(())
            }
            Self::TransactionNotFound { key } => write!(f, "Transaction not found: {}", key),
            Self::PlanNotFound { plan_id } => write!(f, "Plan not found: {}", plan_id),
            Self::Storage { message } => write!(f, "Billing storage error: {}", message),
            Self::Internal { message } => write!(f, "Internal billing error: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for crate::error::TollgateError {
    fn from(err: BillingError) -> Self {
        use crate::error::TollgateError;

        match &err {
            BillingError::Validation { message } => TollgateError::BadRequest(message.clone()),

            BillingError::TransactionNotFound { .. } | BillingError::PlanNotFound { .. } => {
                TollgateError::NotFound(err.to_string())
            }

            BillingError::InsufficientAuthorization { .. } => {
                TollgateError::PaymentRequired(err.to_string())
            }

            BillingError::DuplicateKey { .. } => TollgateError::Conflict(err.to_string()),

            // Never echo state machine detail to the caller
            BillingError::IllegalTransition { .. } => TollgateError::Conflict(
                "Transaction cannot move to the requested status".to_string(),
            ),

            BillingError::AuthenticityFailure => {
                TollgateError::Unauthorized("invalid credentials".to_string())
            }

            BillingError::GatewayRejected { .. } => TollgateError::BadRequest(err.to_string()),

            BillingError::GatewayUnavailable { .. } => {
                TollgateError::ServiceUnavailable(err.to_string())
            }

            BillingError::Storage { .. } | BillingError::Internal { .. } => {
                TollgateError::Internal(err.to_string())
            }
        }
    }
}

#[cfg(feature = "database")]
impl From<sea_orm::DbErr> for BillingError {
    fn from(err: sea_orm::DbErr) -> Self {
        BillingError::storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;

    #[test]
    fn test_error_display() {
        let err = BillingError::IllegalTransition {
            key: "ord-1".to_string(),
            from: TransactionStatus::Failed,
            to: TransactionStatus::Completed,
        };
        assert_eq!(err.to_string(), "Illegal transition for 'ord-1': failed -> completed");

        let err = BillingError::InsufficientAuthorization {
            reason: "Active subscription required".to_string(),
            amount: 5000,
            currency: "TZS".to_string(),
            plan_id: Some("premium-monthly".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "Active subscription required: payment of 5000 TZS required (plan: premium-monthly)"
        );
    }

    #[test]
    fn test_error_classification() {
        let err = BillingError::GatewayUnavailable {
            message: "timed out".to_string(),
        };
        assert!(!err.is_client_error());
        assert!(err.is_server_error());
        assert!(err.is_retryable());

        let err = BillingError::GatewayRejected {
            message: "invalid phone".to_string(),
        };
        assert!(err.is_client_error());
        assert!(!err.is_retryable());

        assert!(BillingError::AuthenticityFailure.is_client_error());
        assert!(!BillingError::storage("down").is_retryable());
    }

    #[test]
    fn test_convert_to_tollgate_error() {
        let err: TollgateError = BillingError::InsufficientAuthorization {
            reason: "Job posting fee".to_string(),
            amount: 1000,
            currency: "TZS".to_string(),
            plan_id: None,
        }
        .into();
        assert!(matches!(err, TollgateError::PaymentRequired(ref m) if m.contains("1000")));

        let err: TollgateError = BillingError::GatewayUnavailable {
            message: "timeout".to_string(),
        }
        .into();
        assert!(matches!(err, TollgateError::ServiceUnavailable(_)));

        let err: TollgateError = BillingError::IllegalTransition {
            key: "ord-1".to_string(),
            from: TransactionStatus::Failed,
            to: TransactionStatus::Completed,
        }
        .into();
        assert!(matches!(err, TollgateError::Conflict(ref m) if !m.contains("ord-1")));

        let err: TollgateError = BillingError::validation("amount below minimum").into();
        assert!(matches!(err, TollgateError::BadRequest(_)));
    }
}
