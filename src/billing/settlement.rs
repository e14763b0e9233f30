//! Applying gateway-reported outcomes to the ledger.
//!
//! Webhook callbacks and sweep polls both end up here. The transaction
//! transition is the single point of truth: only the call that actually
//! moves a transaction to completed runs the side effects (subscription
//! activation and the confirmation notification), so concurrent or replayed
//! reports grant access exactly once.
//!
//! If activation fails after the status has committed, the payment is left
//! completed without a subscription. A redelivered completion report, or the
//! sweep's reconciliation pass, notices the missing subscription and grants
//! it; the subscription row carrying the payment's key is the marker that the
//! side effects ran.

use std::sync::Arc;

use super::audit::{BillingAuditEvent, BillingAuditLogger};
use super::error::{BillingError, Result};
use super::gateway::{GatewayPaymentStatus, OrderStatus};
use super::notify::{confirmation_message, Notification, Notifier};
use super::plans::{BillingCycle, PlanCatalog};
use super::subscription::{Activation, Subscription, SubscriptionLedger, SubscriptionTerm};
use super::transaction::{
    Transaction, TransactionLedger, TransactionStatus, TransactionType, TransitionOutcome,
    TransitionRequest,
};

/// A payment outcome as reported by the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayReport {
    pub order_id: String,
    pub status: GatewayPaymentStatus,
    pub amount: Option<i64>,
    pub channel: Option<String>,
    pub reference: Option<String>,
    pub gateway_transaction_id: Option<String>,
    /// Extra callback fields worth keeping on the transaction.
    pub metadata: Option<serde_json::Value>,
}

impl From<OrderStatus> for GatewayReport {
    fn from(status: OrderStatus) -> Self {
        Self {
            order_id: status.order_id,
            status: status.status,
            amount: status.amount,
            channel: status.channel,
            reference: status.reference,
            gateway_transaction_id: status.gateway_transaction_id,
            metadata: None,
        }
    }
}

/// What applying a report did.
#[derive(Debug, Clone, PartialEq)]
pub enum SettlementOutcome {
    /// The transaction moved to a new status.
    Settled {
        transaction: Transaction,
        subscription: Option<Subscription>,
    },
    /// The payment had already completed but its subscription was missing;
    /// this call granted it.
    Recovered {
        transaction: Transaction,
        subscription: Subscription,
    },
    /// Already in (or past) the reported state; nothing happened.
    AlreadySettled(Transaction),
    /// The gateway has no final answer yet.
    StillPending(Transaction),
}

impl SettlementOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            Self::Settled { transaction, .. } | Self::Recovered { transaction, .. } => transaction,
            Self::AlreadySettled(tx) | Self::StillPending(tx) => tx,
        }
    }
}

/// Applies gateway reports and runs first-completion side effects.
#[derive(Clone)]
pub struct Settlement {
    ledger: TransactionLedger,
    subscriptions: SubscriptionLedger,
    plans: PlanCatalog,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn BillingAuditLogger>,
}

impl Settlement {
    #[must_use]
    pub fn new(
        ledger: TransactionLedger,
        subscriptions: SubscriptionLedger,
        plans: PlanCatalog,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn BillingAuditLogger>,
    ) -> Self {
        Self {
            ledger,
            subscriptions,
            plans,
            notifier,
            audit,
        }
    }

    /// Apply `report` to the transaction it names.
    ///
    /// Fails with [`BillingError::TransactionNotFound`] for unknown orders and
    /// with a validation error when a completion reports a different amount
    /// than was charged. Neither touches the ledger.
    pub async fn apply(&self, report: &GatewayReport, source: &'static str) -> Result<SettlementOutcome> {
        let current = self.ledger.get(&report.order_id).await?;

        let Some(target) = report.status.settles_to() else {
            return Ok(SettlementOutcome::StillPending(current));
        };

        if target == TransactionStatus::Completed {
            if let Some(reported) = report.amount {
                if reported != current.amount {
                    self.audit.log(BillingAuditEvent::AmountMismatch {
                        idempotency_key: current.idempotency_key.clone(),
                        expected: current.amount,
                        reported,
                    });
                    return Err(BillingError::validation(format!(
                        "reported amount {} does not match transaction amount {}",
                        reported, current.amount
                    )));
                }
            }
        }

        let outcome = self
            .ledger
            .transition(&report.order_id, self.transition_request(report, target, source))
            .await?;

        if !outcome.changed {
            if target == TransactionStatus::Completed
                && self.is_unfulfilled(&outcome.transaction).await?
            {
                return self.fulfil(outcome.transaction).await;
            }
            return Ok(SettlementOutcome::AlreadySettled(outcome.transaction));
        }

        let subscription = self.after_transition(&outcome).await?;
        Ok(SettlementOutcome::Settled {
            transaction: outcome.transaction,
            subscription,
        })
    }

    /// Grant the subscription of a completed payment whose activation never
    /// landed, e.g. because the store failed right after the status commit.
    ///
    /// Returns [`SettlementOutcome::AlreadySettled`] when nothing was missing
    /// or a concurrent caller granted it first.
    pub async fn reconcile(&self, transaction: Transaction) -> Result<SettlementOutcome> {
        if self.is_unfulfilled(&transaction).await? {
            return self.fulfil(transaction).await;
        }
        Ok(SettlementOutcome::AlreadySettled(transaction))
    }

    async fn is_unfulfilled(&self, tx: &Transaction) -> Result<bool> {
        if tx.status != TransactionStatus::Completed
            || tx.transaction_type != TransactionType::Subscription
        {
            return Ok(false);
        }
        let granted = self
            .subscriptions
            .history(&tx.user_id)
            .await?
            .iter()
            .any(|s| s.transaction_key.as_deref() == Some(tx.idempotency_key.as_str()));
        Ok(!granted)
    }

    async fn fulfil(&self, transaction: Transaction) -> Result<SettlementOutcome> {
        tracing::warn!(
            target: "tollgate::billing::settlement",
            idempotency_key = %transaction.idempotency_key,
            user_id = %transaction.user_id,
            "Completed payment has no subscription, activating now"
        );
        match self.on_completed(&transaction).await? {
            Some(activation) if activation.created => Ok(SettlementOutcome::Recovered {
                transaction,
                subscription: activation.subscription,
            }),
            _ => Ok(SettlementOutcome::AlreadySettled(transaction)),
        }
    }

    fn transition_request(
        &self,
        report: &GatewayReport,
        target: TransactionStatus,
        source: &'static str,
    ) -> TransitionRequest {
        let mut metadata = serde_json::json!({
            "settled_by": source,
            "gateway_status": report.status.as_str(),
        });
        if let Some(tid) = &report.gateway_transaction_id {
            metadata["gateway_transaction_id"] = serde_json::Value::String(tid.clone());
        }
        if let Some(extra) = &report.metadata {
            super::transaction::merge_metadata(&mut metadata, extra);
        }

        TransitionRequest::new(target, source)
            .gateway_reference(report.reference.clone())
            .payment_channel(report.channel.clone())
            .metadata(Some(metadata))
    }

    /// Side effects for the call that changed the status.
    async fn after_transition(&self, outcome: &TransitionOutcome) -> Result<Option<Subscription>> {
        if !outcome.newly_completed() {
            return Ok(None);
        }
        Ok(self
            .on_completed(&outcome.transaction)
            .await?
            .map(|activation| activation.subscription))
    }

    /// Activate what the payment bought and confirm it to the buyer.
    ///
    /// The notification goes out only from the call that wrote the
    /// subscription, so two concurrent recoveries of the same payment send
    /// one message.
    async fn on_completed(&self, tx: &Transaction) -> Result<Option<Activation>> {
        let mut plan_name = None;
        let mut granted = None;

        if tx.transaction_type == TransactionType::Subscription {
            let plan_id = tx.plan_id.as_deref().ok_or_else(|| {
                BillingError::internal(format!(
                    "subscription transaction '{}' has no plan",
                    tx.idempotency_key
                ))
            })?;
            let plan = self.plans.get(plan_id).await?;
            let term = SubscriptionTerm::Cycle(plan.billing_cycle.unwrap_or(BillingCycle::Monthly));

            let activation = self
                .subscriptions
                .grant(&tx.user_id, plan_id, term, Some(&tx.idempotency_key))
                .await
                .inspect_err(|e| {
                    tracing::error!(
                        target: "tollgate::billing::settlement",
                        idempotency_key = %tx.idempotency_key,
                        user_id = %tx.user_id,
                        error = %e,
                        "Subscription activation failed for completed payment"
                    );
                })?;

            plan_name = Some(plan.name);
            granted = Some(activation);
        }

        if granted.as_ref().is_none_or(|activation| activation.created) {
            let notification = Notification {
                user_id: tx.user_id.clone(),
                phone_number: tx.phone_number.clone(),
                message: confirmation_message(tx, plan_name.as_deref()),
            };
            if let Err(e) = self.notifier.send(&notification).await {
                tracing::warn!(
                    target: "tollgate::billing::settlement",
                    idempotency_key = %tx.idempotency_key,
                    error = %e,
                    "Failed to send payment confirmation"
                );
            }
        }

        tracing::info!(
            target: "tollgate::billing::settlement",
            idempotency_key = %tx.idempotency_key,
            user_id = %tx.user_id,
            amount = tx.amount,
            "Payment settled"
        );

        Ok(granted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::tests::RecordingAuditLogger;
    use crate::billing::notify::tests::RecordingNotifier;
    use crate::billing::plans::default_catalog;
    use crate::billing::storage::memory::InMemoryBillingStore;
    use crate::billing::storage::BillingStore;
    use crate::billing::transaction::NewTransaction;

    struct Fixture {
        store: InMemoryBillingStore,
        settlement: Settlement,
        ledger: TransactionLedger,
        subscriptions: SubscriptionLedger,
        notifier: RecordingNotifier,
        audit: RecordingAuditLogger,
    }

    async fn fixture() -> Fixture {
        let memory = InMemoryBillingStore::new();
        let store: Arc<dyn BillingStore> = Arc::new(memory.clone());
        let audit = RecordingAuditLogger::default();
        let notifier = RecordingNotifier::default();
        let plans = PlanCatalog::new(store.clone());
        plans.seed(default_catalog()).await.unwrap();
        let ledger = TransactionLedger::new(store.clone(), Arc::new(audit.clone()));
        let subscriptions = SubscriptionLedger::new(store.clone(), plans.clone(), Arc::new(audit.clone()));
        let settlement = Settlement::new(
            ledger.clone(),
            subscriptions.clone(),
            plans,
            Arc::new(notifier.clone()),
            Arc::new(audit.clone()),
        );
        Fixture {
            store: memory,
            settlement,
            ledger,
            subscriptions,
            notifier,
            audit,
        }
    }

    fn report(order_id: &str, status: GatewayPaymentStatus, amount: Option<i64>) -> GatewayReport {
        GatewayReport {
            order_id: order_id.to_string(),
            status,
            amount,
            channel: Some("TIGO-TZ".to_string()),
            reference: Some("0936183435".to_string()),
            gateway_transaction_id: Some("CEJ3I3SETSN".to_string()),
            metadata: None,
        }
    }

    async fn subscription_tx(f: &Fixture, key: &str) {
        f.ledger
            .create(
                NewTransaction::new(key, "user-1", TransactionType::Subscription, 5000)
                    .plan("basic-monthly")
                    .phone("0712345678"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_completion_activates_and_notifies_once() {
        let f = fixture().await;
        subscription_tx(&f, "sub-1").await;

        let first = f
            .settlement
            .apply(&report("sub-1", GatewayPaymentStatus::Completed, Some(5000)), "webhook")
            .await
            .unwrap();
        let SettlementOutcome::Settled { transaction, subscription } = first else {
            panic!("expected settlement");
        };
        assert_eq!(transaction.status, TransactionStatus::Completed);
        assert_eq!(transaction.gateway_reference.as_deref(), Some("0936183435"));
        assert_eq!(transaction.payment_channel.as_deref(), Some("TIGO-TZ"));
        assert!(transaction.completed_at.is_some());
        assert_eq!(subscription.unwrap().plan_id, "basic-monthly");

        let replay = f
            .settlement
            .apply(&report("sub-1", GatewayPaymentStatus::Completed, Some(5000)), "sweep")
            .await
            .unwrap();
        assert!(matches!(replay, SettlementOutcome::AlreadySettled(_)));

        assert!(f.subscriptions.has_active("user-1").await.unwrap());
        let sent = f.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].message.contains("Basic Subscription"));
        assert_eq!(sent[0].phone_number.as_deref(), Some("0712345678"));
    }

    #[tokio::test]
    async fn test_cancelled_report_fails_transaction() {
        let f = fixture().await;
        subscription_tx(&f, "sub-2").await;

        let outcome = f
            .settlement
            .apply(&report("sub-2", GatewayPaymentStatus::Cancelled, None), "webhook")
            .await
            .unwrap();
        assert_eq!(outcome.transaction().status, TransactionStatus::Failed);
        assert_eq!(outcome.transaction().metadata["gateway_status"], "CANCELLED");
        assert!(!f.subscriptions.has_active("user-1").await.unwrap());
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_pending_report_changes_nothing() {
        let f = fixture().await;
        subscription_tx(&f, "sub-3").await;

        let outcome = f
            .settlement
            .apply(&report("sub-3", GatewayPaymentStatus::Pending, None), "sweep")
            .await
            .unwrap();
        assert!(matches!(outcome, SettlementOutcome::StillPending(_)));
    }

    #[tokio::test]
    async fn test_amount_mismatch_is_rejected_and_audited() {
        let f = fixture().await;
        subscription_tx(&f, "sub-4").await;

        let err = f
            .settlement
            .apply(&report("sub-4", GatewayPaymentStatus::Completed, Some(50)), "webhook")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation { .. }));
        assert_eq!(f.ledger.get("sub-4").await.unwrap().status, TransactionStatus::Pending);
        assert!(f
            .audit
            .security_events()
            .iter()
            .any(|e| matches!(e, BillingAuditEvent::AmountMismatch { reported: 50, .. })));
    }

    #[tokio::test]
    async fn test_completion_after_failure_is_illegal() {
        let f = fixture().await;
        subscription_tx(&f, "sub-5").await;
        f.settlement
            .apply(&report("sub-5", GatewayPaymentStatus::Failed, None), "webhook")
            .await
            .unwrap();

        let err = f
            .settlement
            .apply(&report("sub-5", GatewayPaymentStatus::Completed, Some(5000)), "webhook")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::IllegalTransition { .. }));
        assert!(!f.subscriptions.has_active("user-1").await.unwrap());
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let f = fixture().await;
        let err = f
            .settlement
            .apply(&report("nope", GatewayPaymentStatus::Completed, None), "webhook")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::TransactionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_job_posting_completion_notifies_without_subscription() {
        let f = fixture().await;
        f.ledger
            .create(NewTransaction::new("job-1", "user-2", TransactionType::JobPosting, 1000).reference("job-77"))
            .await
            .unwrap();

        let outcome = f
            .settlement
            .apply(&report("job-1", GatewayPaymentStatus::Completed, Some(1000)), "webhook")
            .await
            .unwrap();
        assert!(matches!(outcome, SettlementOutcome::Settled { subscription: None, .. }));
        assert!(!f.subscriptions.has_active("user-2").await.unwrap());
        assert_eq!(f.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_redelivery_grants_subscription_lost_after_commit() {
        let f = fixture().await;
        subscription_tx(&f, "sub-6").await;
        f.store.fail_next_subscription_write();

        let err = f
            .settlement
            .apply(&report("sub-6", GatewayPaymentStatus::Completed, Some(5000)), "webhook")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Storage { .. }));
        assert_eq!(f.ledger.get("sub-6").await.unwrap().status, TransactionStatus::Completed);
        assert!(!f.subscriptions.has_active("user-1").await.unwrap());
        assert!(f.notifier.sent().is_empty());

        let redelivered = f
            .settlement
            .apply(&report("sub-6", GatewayPaymentStatus::Completed, Some(5000)), "webhook")
            .await
            .unwrap();
        let SettlementOutcome::Recovered { subscription, .. } = redelivered else {
            panic!("expected the missing subscription to be granted");
        };
        assert_eq!(subscription.transaction_key.as_deref(), Some("sub-6"));
        assert!(f.subscriptions.has_active("user-1").await.unwrap());
        assert_eq!(f.notifier.sent().len(), 1);

        // Once granted, further reports are plain duplicates
        let again = f
            .settlement
            .apply(&report("sub-6", GatewayPaymentStatus::Completed, Some(5000)), "webhook")
            .await
            .unwrap();
        assert!(matches!(again, SettlementOutcome::AlreadySettled(_)));
        assert_eq!(f.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_only_acts_on_missing_grants() {
        let f = fixture().await;
        subscription_tx(&f, "sub-7").await;
        f.store.fail_next_subscription_write();
        assert!(f
            .settlement
            .apply(&report("sub-7", GatewayPaymentStatus::Completed, Some(5000)), "webhook")
            .await
            .is_err());

        let tx = f.ledger.get("sub-7").await.unwrap();
        let outcome = f.settlement.reconcile(tx.clone()).await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::Recovered { .. }));

        let outcome = f.settlement.reconcile(tx).await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::AlreadySettled(_)));
        assert_eq!(f.store.subscriptions_for("user-1").len(), 1);
        assert_eq!(f.notifier.sent().len(), 1);
    }
}
