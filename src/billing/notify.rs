//! Payment confirmation notifications.
//!
//! Settlement sends one notification per transaction, the first time it
//! completes. Delivery is best effort: a failed send is logged and never
//! undoes the settlement.

use async_trait::async_trait;

use super::error::Result;
use super::transaction::{Transaction, TransactionType};

/// A message for a user, delivered by SMS in production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub user_id: String,
    pub phone_number: Option<String>,
    pub message: String,
}

/// Delivers notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log instead of sending them.
///
/// The phone number is masked; the message itself carries no secrets.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        tracing::info!(
            target: "tollgate::billing::notify",
            user_id = %notification.user_id,
            phone = %notification.phone_number.as_deref().map(mask_phone).unwrap_or_default(),
            message = %notification.message,
            "Payment notification"
        );
        Ok(())
    }
}

/// Build the confirmation text for a completed transaction.
///
/// `plan_name` is used for subscriptions when the plan is known.
pub fn confirmation_message(tx: &Transaction, plan_name: Option<&str>) -> String {
    let amount = format_amount(tx.amount);
    let reference = tx
        .gateway_reference
        .as_deref()
        .unwrap_or(&tx.idempotency_key);

    match tx.transaction_type {
        TransactionType::Subscription => format!(
            "Payment Successful! Your {} subscription of {} {} has been confirmed. Reference: {}.",
            plan_name.or(tx.plan_id.as_deref()).unwrap_or("Premium"),
            tx.currency,
            amount,
            reference
        ),
        other => format!(
            "Payment Successful! Your {} payment of {} {} has been confirmed. Reference: {}.",
            describe(other),
            tx.currency,
            amount,
            reference
        ),
    }
}

fn describe(kind: TransactionType) -> &'static str {
    match kind {
        TransactionType::Subscription => "subscription",
        TransactionType::PayPerUse => "service",
        TransactionType::JobPosting => "job posting",
        TransactionType::FundiApplication => "job application",
    }
}

/// `5000` -> `5,000`.
fn format_amount(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if amount < 0 {
        out.push('-');
    }
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn mask_phone(phone: &str) -> String {
    let visible: String = phone.chars().rev().take(3).collect::<Vec<_>>().into_iter().rev().collect();
    format!("*******{}", visible)
}
