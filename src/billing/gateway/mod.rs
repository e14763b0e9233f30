//! Payment gateway integration.
//!
//! [`PaymentGateway`] is the seam to the external mobile-money provider.
//! [`GatewayAdapter`] sits on top of it and owns the one rule that ties
//! gateway answers to the ledger: a definitive rejection fails the pending
//! transaction, while transport trouble leaves it pending for the sweep.

mod phone;
mod zenopay;

pub use phone::{normalize_phone, MobileChannel};
pub use zenopay::{LiveZenoPayClient, UnconfiguredGateway, ZenoPayConfig, DEFAULT_BASE_URL};
pub(crate) use zenopay::{parse_amount, str_field};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::error::{BillingError, Result};
use super::transaction::{Transaction, TransactionLedger, TransactionStatus, TransitionRequest};
use super::validation::validate_fields;

/// Who pays. The gateway pushes the payment prompt to `phone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BuyerDetails {
    #[validate(length(min = 1, max = 128, message = "buyer name is required"))]
    pub name: String,
    #[validate(email(message = "invalid buyer email"))]
    pub email: String,
    pub phone: String,
}

impl BuyerDetails {
    /// Check the fields and normalize the phone number.
    pub fn normalized(&self) -> Result<Self> {
        let trimmed = Self {
            name: self.name.trim().to_string(),
            email: self.email.trim().to_string(),
            phone: self.phone.clone(),
        };
        validate_fields(&trimmed)?;
        Ok(Self {
            phone: normalize_phone(&trimmed.phone)?,
            ..trimmed
        })
    }
}

/// A charge request as sent to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Our idempotency key. The gateway echoes it back as the order id.
    pub order_id: String,
    pub buyer: BuyerDetails,
    pub amount: i64,
}

/// The gateway accepted a charge request and prompted the buyer.
#[derive(Debug, Clone, PartialEq)]
pub struct InitiationReceipt {
    pub gateway_order_id: String,
    pub message: Option<String>,
    pub result_code: Option<String>,
}

/// Payment status as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayPaymentStatus {
    Completed,
    Pending,
    Failed,
    Cancelled,
    Unknown(String),
}

impl GatewayPaymentStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "COMPLETED" | "SUCCESS" | "SUCCESSFUL" => Self::Completed,
            "PENDING" | "PROCESSING" => Self::Pending,
            "FAILED" => Self::Failed,
            "CANCELLED" | "CANCELED" => Self::Cancelled,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Completed => "COMPLETED",
            Self::Pending => "PENDING",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unknown(raw) => raw,
        }
    }

    /// Ledger status this report settles to, if any.
    pub fn settles_to(&self) -> Option<TransactionStatus> {
        match self {
            Self::Completed => Some(TransactionStatus::Completed),
            Self::Failed | Self::Cancelled => Some(TransactionStatus::Failed),
            Self::Pending | Self::Unknown(_) => None,
        }
    }
}

/// Order status as returned by a status poll.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderStatus {
    pub order_id: String,
    pub status: GatewayPaymentStatus,
    pub amount: Option<i64>,
    pub channel: Option<String>,
    pub reference: Option<String>,
    pub gateway_transaction_id: Option<String>,
}

/// External payment gateway.
///
/// Implementations map definitive refusals to
/// [`BillingError::GatewayRejected`] and transport failures or timeouts to
/// [`BillingError::GatewayUnavailable`].
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Push a payment prompt to the buyer.
    async fn initiate(&self, request: &PaymentRequest) -> Result<InitiationReceipt>;

    /// Ask the gateway where an order stands.
    async fn poll_status(&self, order_id: &str) -> Result<OrderStatus>;
}

/// Drives gateway calls for ledger transactions.
#[derive(Clone)]
pub struct GatewayAdapter {
    gateway: Arc<dyn PaymentGateway>,
    ledger: TransactionLedger,
}

impl GatewayAdapter {
    #[must_use]
    pub fn new(gateway: Arc<dyn PaymentGateway>, ledger: TransactionLedger) -> Self {
        Self { gateway, ledger }
    }

    /// Start collecting payment for a pending transaction.
    ///
    /// The transaction stays pending on success; completion arrives through
    /// the webhook or the sweep. A rejection moves it to failed.
    pub async fn initiate(
        &self,
        transaction: &Transaction,
        buyer: &BuyerDetails,
    ) -> Result<InitiationReceipt> {
        let request = PaymentRequest {
            order_id: transaction.idempotency_key.clone(),
            buyer: buyer.clone(),
            amount: transaction.amount,
        };

        match self.gateway.initiate(&request).await {
            Ok(receipt) => {
                tracing::info!(
                    target: "tollgate::billing::gateway",
                    idempotency_key = %transaction.idempotency_key,
                    gateway_order_id = %receipt.gateway_order_id,
                    amount = transaction.amount,
                    "Payment initiated"
                );
                Ok(receipt)
            }
            Err(BillingError::GatewayRejected { message }) => {
                tracing::warn!(
                    target: "tollgate::billing::gateway",
                    idempotency_key = %transaction.idempotency_key,
                    reason = %message,
                    "Gateway rejected payment initiation"
                );
                let request = TransitionRequest::new(TransactionStatus::Failed, "initiation")
                    .metadata(Some(serde_json::json!({ "failure_reason": message })));
                self.ledger
                    .transition(&transaction.idempotency_key, request)
                    .await?;
                Err(BillingError::GatewayRejected { message })
            }
            Err(err) => {
                tracing::warn!(
                    target: "tollgate::billing::gateway",
                    idempotency_key = %transaction.idempotency_key,
                    error = %err,
                    "Payment initiation did not complete, leaving transaction pending"
                );
                Err(err)
            }
        }
    }

    /// Poll the gateway for an order.
    pub async fn poll(&self, order_id: &str) -> Result<OrderStatus> {
        let status = self.gateway.poll_status(order_id).await?;
        tracing::debug!(
            target: "tollgate::billing::gateway",
            order_id = %order_id,
            status = ?status.status,
            "Polled gateway order status"
        );
        Ok(status)
    }
}
