//! Payment initiation, status queries and refunds.
//!
//! [`PaymentService`] is the entry point callers use once the authorization
//! engine has told them a fee is owed. Amounts are checked against the
//! current policy or plan price, so a client cannot choose its own price.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::{BillingError, Result};
use super::gateway::{BuyerDetails, GatewayAdapter};
use super::plans::PlanCatalog;
use super::policy::PolicyService;
use super::settlement::Settlement;
use super::subscription::SubscriptionLedger;
use super::transaction::{
    NewTransaction, Transaction, TransactionLedger, TransactionStatus, TransactionType,
    TransitionRequest,
};
use super::validation::validate_amount;

/// Bounds applied to every initiation.
#[derive(Debug, Clone)]
pub struct PaymentLimits {
    pub currency: String,
    pub min_amount: i64,
    pub max_amount: i64,
    pub refund_window: Duration,
}

impl Default for PaymentLimits {
    fn default() -> Self {
        Self {
            currency: "TZS".to_string(),
            min_amount: 100,
            max_amount: 1_000_000,
            refund_window: Duration::days(7),
        }
    }
}

/// A request to start collecting a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatePayment {
    pub idempotency_key: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    /// Derived from the policy or plan when omitted; must match it when given.
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub plan_id: Option<String>,
    /// The job or application the payment unlocks.
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub buyer: BuyerDetails,
}

/// Result of [`PaymentService::initiate`].
#[derive(Debug, Clone, PartialEq)]
pub struct Initiation {
    pub transaction: Transaction,
    /// `false` when the key already existed and the stored row was returned.
    pub created: bool,
    pub gateway_order_id: Option<String>,
    /// Gateway prompt text, e.g. "confirm on your phone".
    pub message: Option<String>,
}

/// Payment operations.
#[derive(Clone)]
pub struct PaymentService {
    ledger: TransactionLedger,
    gateway: GatewayAdapter,
    settlement: Settlement,
    subscriptions: SubscriptionLedger,
    plans: PlanCatalog,
    policy: PolicyService,
    limits: Arc<PaymentLimits>,
}

impl PaymentService {
    #[must_use]
    pub fn new(
        ledger: TransactionLedger,
        gateway: GatewayAdapter,
        settlement: Settlement,
        subscriptions: SubscriptionLedger,
        plans: PlanCatalog,
        policy: PolicyService,
        limits: PaymentLimits,
    ) -> Self {
        Self {
            ledger,
            gateway,
            settlement,
            subscriptions,
            plans,
            policy,
            limits: Arc::new(limits),
        }
    }

    /// Record a pending transaction and ask the gateway to collect it.
    ///
    /// A repeated idempotency key never creates a second row. If the stored
    /// row is still pending the gateway is asked again, so a retry after
    /// [`BillingError::GatewayUnavailable`] reaches the buyer; a settled row
    /// is returned without a gateway call. Gateway unavailability leaves the
    /// new transaction pending and is returned as a retryable error.
    pub async fn initiate(&self, request: InitiatePayment) -> Result<Initiation> {
        let buyer = request.buyer.normalized()?;
        let (amount, plan_id) = self.resolve_price(&request).await?;
        validate_amount(amount, self.limits.min_amount, self.limits.max_amount)?;

        let mut new = NewTransaction::new(
            &request.idempotency_key,
            &request.user_id,
            request.transaction_type,
            amount,
        )
        .currency(&self.limits.currency)
        .phone(&buyer.phone);
        if let Some(plan_id) = plan_id {
            new = new.plan(plan_id);
        }
        if let Some(reference) = &request.reference_id {
            new = new.reference(reference);
        }
        if let Some(description) = &request.description {
            new = new.description(description);
        }

        let transaction = match self.ledger.create(new).await {
            Ok(tx) => tx,
            Err(BillingError::DuplicateKey { key }) => {
                let existing = self.ledger.get(&key).await?;
                if existing.user_id != request.user_id {
                    return Err(BillingError::validation(
                        "idempotency key is already in use",
                    ));
                }
                return self.replay(existing, &buyer).await;
            }
            Err(e) => return Err(e),
        };

        let receipt = self.gateway.initiate(&transaction, &buyer).await?;

        Ok(Initiation {
            transaction,
            created: true,
            gateway_order_id: Some(receipt.gateway_order_id),
            message: receipt.message,
        })
    }

    /// Answer a repeated initiation for a transaction this user already owns.
    ///
    /// A pending transaction may never have reached the gateway (the first
    /// attempt timed out), so the prompt is pushed again under the same order
    /// id. A settled transaction is returned as stored.
    async fn replay(&self, existing: Transaction, buyer: &BuyerDetails) -> Result<Initiation> {
        tracing::info!(
            target: "tollgate::billing::payments",
            idempotency_key = %existing.idempotency_key,
            status = %existing.status,
            "Initiation replayed for existing transaction"
        );

        if existing.status != TransactionStatus::Pending {
            return Ok(Initiation {
                transaction: existing,
                created: false,
                gateway_order_id: None,
                message: None,
            });
        }

        let receipt = self.gateway.initiate(&existing, buyer).await?;
        Ok(Initiation {
            transaction: existing,
            created: false,
            gateway_order_id: Some(receipt.gateway_order_id),
            message: receipt.message,
        })
    }

    /// The price the caller must pay, and the plan it buys if any.
    ///
    /// The subscription plan on offer costs the policy's subscription fee;
    /// any other subscription plan costs its catalog price.
    async fn resolve_price(&self, request: &InitiatePayment) -> Result<(i64, Option<String>)> {
        let (expected, plan_id) = match request.transaction_type {
            TransactionType::Subscription => {
                let policy = self.policy.current().await?;
                let offer = self.plans.subscription_offer(&policy).await?;
                let plan = match (&request.plan_id, offer) {
                    (Some(plan_id), Some(offer)) if offer.id == *plan_id => offer,
                    (Some(plan_id), _) => self.plans.get(plan_id).await?,
                    (None, Some(offer)) => offer,
                    (None, None) => {
                        return Err(BillingError::validation("no subscription plan is on sale"));
                    }
                };
                if !plan.is_subscription() || !plan.is_active {
                    return Err(BillingError::validation(format!(
                        "plan '{}' cannot be purchased as a subscription",
                        plan.id
                    )));
                }
                (Some(plan.price), Some(plan.id))
            }
            TransactionType::JobPosting => {
                (Some(self.policy.current().await?.job_posting_fee), None)
            }
            TransactionType::FundiApplication => {
                (Some(self.policy.current().await?.application_fee), None)
            }
            TransactionType::PayPerUse => match &request.plan_id {
                Some(plan_id) => {
                    let plan = self.plans.get(plan_id).await?;
                    (Some(plan.price), Some(plan.id))
                }
                None => (None, None),
            },
        };

        match (expected, request.amount) {
            (Some(expected), Some(given)) if given != expected => Err(BillingError::validation(format!(
                "amount {} does not match the price of {}",
                given, expected
            ))),
            (Some(expected), _) => Ok((expected, plan_id)),
            (None, Some(given)) => Ok((given, plan_id)),
            (None, None) => Err(BillingError::validation("amount is required")),
        }
    }

    /// Current state of a transaction, optionally refreshed from the gateway.
    ///
    /// A refresh that cannot reach the gateway still returns the stored row.
    pub async fn status(&self, idempotency_key: &str, refresh: bool) -> Result<Transaction> {
        let tx = self.ledger.get(idempotency_key).await?;
        if !refresh || tx.status != TransactionStatus::Pending {
            return Ok(tx);
        }

        match self.gateway.poll(idempotency_key).await {
            Ok(status) => {
                let outcome = self.settlement.apply(&status.into(), "status_poll").await?;
                Ok(outcome.transaction().clone())
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    target: "tollgate::billing::payments",
                    idempotency_key = %idempotency_key,
                    error = %e,
                    "Status refresh failed, returning stored status"
                );
                Ok(tx)
            }
            Err(e) => Err(e),
        }
    }

    /// Refund a completed transaction within the refund window.
    ///
    /// Refunding a subscription payment also cancels the subscription it
    /// bought. Refunding twice is a no-op.
    pub async fn refund(&self, idempotency_key: &str, reason: Option<&str>) -> Result<Transaction> {
        let tx = self.ledger.get(idempotency_key).await?;

        match tx.status {
            TransactionStatus::Refunded => return Ok(tx),
            TransactionStatus::Completed => {}
            other => {
                return Err(BillingError::validation(format!(
                    "only completed transactions can be refunded (status: {})",
                    other
                )));
            }
        }

        let completed_at = tx.completed_at.unwrap_or(tx.updated_at);
        if Utc::now() - completed_at > self.limits.refund_window {
            return Err(BillingError::validation(format!(
                "refund window of {} days has passed",
                self.limits.refund_window.num_days()
            )));
        }

        let request = TransitionRequest::new(TransactionStatus::Refunded, "refund").metadata(Some(
            serde_json::json!({
                "refund_reason": reason.unwrap_or("requested"),
                "refunded_at": Utc::now().to_rfc3339(),
            }),
        ));
        let outcome = self.ledger.transition(idempotency_key, request).await?;

        if outcome.changed && tx.transaction_type == TransactionType::Subscription {
            let active = self.subscriptions.get_active(&tx.user_id).await?;
            if active.is_some_and(|s| s.transaction_key.as_deref() == Some(idempotency_key)) {
                self.subscriptions.cancel(&tx.user_id).await?;
            }
        }

        tracing::info!(
            target: "tollgate::billing::payments",
            idempotency_key = %idempotency_key,
            amount = tx.amount,
            "Transaction refunded"
        );

        Ok(outcome.transaction)
    }

    /// A user's transactions, newest first.
    pub async fn history(&self, user_id: &str) -> Result<Vec<Transaction>> {
        self.ledger.for_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::NoOpAuditLogger;
    use crate::billing::authorization::{AuthorizationEngine, BillableAction};
    use crate::billing::gateway::tests::{buyer, MockGateway};
    use crate::billing::plans::BillingCycle;
    use crate::billing::policy::{BillingMode, PolicyUpdate};
    use crate::billing::gateway::GatewayPaymentStatus;
    use crate::billing::notify::tests::RecordingNotifier;
    use crate::billing::plans::default_catalog;
    use crate::billing::storage::memory::InMemoryBillingStore;
    use crate::billing::storage::BillingStore;

    struct Fixture {
        payments: PaymentService,
        gateway: MockGateway,
        subscriptions: SubscriptionLedger,
        policy: PolicyService,
        engine: AuthorizationEngine,
        store: InMemoryBillingStore,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryBillingStore::new();
        let shared: Arc<dyn BillingStore> = Arc::new(store.clone());
        let audit = Arc::new(NoOpAuditLogger);
        let plans = PlanCatalog::new(shared.clone());
        plans.seed(default_catalog()).await.unwrap();
        let ledger = TransactionLedger::new(shared.clone(), audit.clone());
        let subscriptions = SubscriptionLedger::new(shared.clone(), plans.clone(), audit.clone());
        let settlement = Settlement::new(
            ledger.clone(),
            subscriptions.clone(),
            plans.clone(),
            Arc::new(RecordingNotifier::default()),
            audit.clone(),
        );
        let gateway = MockGateway::default();
        let adapter = GatewayAdapter::new(Arc::new(gateway.clone()), ledger.clone());
        let policy = PolicyService::new(shared, audit);
        let engine = AuthorizationEngine::new(policy.clone(), subscriptions.clone(), plans.clone());
        let payments = PaymentService::new(
            ledger,
            adapter,
            settlement,
            subscriptions.clone(),
            plans,
            policy.clone(),
            PaymentLimits::default(),
        );
        Fixture {
            payments,
            gateway,
            subscriptions,
            policy,
            engine,
            store,
        }
    }

    fn subscription_request(key: &str) -> InitiatePayment {
        InitiatePayment {
            idempotency_key: key.to_string(),
            user_id: "user-1".to_string(),
            transaction_type: TransactionType::Subscription,
            amount: Some(5000),
            plan_id: Some("basic-monthly".to_string()),
            reference_id: None,
            description: None,
            buyer: buyer(),
        }
    }

    #[tokio::test]
    async fn test_initiate_creates_pending_and_calls_gateway() {
        let f = fixture().await;
        let result = f.payments.initiate(subscription_request("sub-1")).await.unwrap();

        assert!(result.created);
        assert_eq!(result.transaction.status, TransactionStatus::Pending);
        assert_eq!(result.transaction.phone_number.as_deref(), Some("0712345678"));
        assert_eq!(result.gateway_order_id.as_deref(), Some("sub-1"));
        assert_eq!(f.gateway.initiated().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_reuses_pending_transaction() {
        let f = fixture().await;
        let first = f.payments.initiate(subscription_request("sub-1")).await.unwrap();
        let second = f.payments.initiate(subscription_request("sub-1")).await.unwrap();

        assert!(!second.created);
        assert_eq!(second.transaction.id, first.transaction.id);
        assert_eq!(second.gateway_order_id.as_deref(), Some("sub-1"));
        assert_eq!(f.store.all_transactions().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_gateway_outage_reaches_gateway() {
        let f = fixture().await;
        f.gateway.fail_initiation_with(BillingError::gateway_unavailable("timeout"));
        let err = f.payments.initiate(subscription_request("sub-1")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(f.gateway.initiated().is_empty());

        f.gateway.clear_initiation_failure();
        let retried = f.payments.initiate(subscription_request("sub-1")).await.unwrap();
        assert!(!retried.created);
        assert_eq!(retried.transaction.status, TransactionStatus::Pending);
        assert_eq!(retried.gateway_order_id.as_deref(), Some("sub-1"));
        assert_eq!(f.gateway.initiated().len(), 1);
        assert_eq!(f.gateway.initiated()[0].amount, 5000);
    }

    #[tokio::test]
    async fn test_replay_of_settled_transaction_skips_gateway() {
        let f = fixture().await;
        f.payments.initiate(subscription_request("sub-1")).await.unwrap();
        f.gateway.set_status("sub-1", GatewayPaymentStatus::Completed, Some(5000));
        f.payments.status("sub-1", true).await.unwrap();

        let replay = f.payments.initiate(subscription_request("sub-1")).await.unwrap();
        assert!(!replay.created);
        assert_eq!(replay.transaction.status, TransactionStatus::Completed);
        assert!(replay.gateway_order_id.is_none());
        assert_eq!(f.gateway.initiated().len(), 1);
    }

    #[tokio::test]
    async fn test_quoted_subscription_fee_is_accepted() {
        let f = fixture().await;
        f.policy
            .update(
                &PolicyUpdate {
                    payments_enabled: Some(true),
                    mode: Some(BillingMode::SubscriptionRequired),
                    subscription_fee: Some(8000),
                    ..Default::default()
                },
                "admin-1",
            )
            .await
            .unwrap();

        let decision = f.engine.authorize("user-1", &BillableAction::PostJob).await.unwrap();
        assert_eq!(decision.amount, 8000);

        let mut request = subscription_request("sub-1");
        request.amount = Some(decision.amount);
        request.plan_id = decision.plan_id.clone();
        let result = f.payments.initiate(request).await.unwrap();
        assert_eq!(result.transaction.amount, 8000);
        assert_eq!(result.transaction.plan_id.as_deref(), Some("basic-monthly"));

        // The catalog price no longer applies to the plan on offer
        let mut stale = subscription_request("sub-2");
        stale.amount = Some(5000);
        assert!(matches!(
            f.payments.initiate(stale).await,
            Err(BillingError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_yearly_subscription_follows_decision() {
        let f = fixture().await;
        f.policy
            .update(
                &PolicyUpdate {
                    payments_enabled: Some(true),
                    mode: Some(BillingMode::SubscriptionRequired),
                    subscription_period: Some(BillingCycle::Yearly),
                    subscription_fee: Some(45000),
                    ..Default::default()
                },
                "admin-1",
            )
            .await
            .unwrap();

        let decision = f.engine.authorize("user-1", &BillableAction::PostJob).await.unwrap();
        assert_eq!(decision.plan_id.as_deref(), Some("premium-yearly"));
        assert_eq!(decision.amount, 45000);

        let request = InitiatePayment {
            amount: Some(decision.amount),
            plan_id: None,
            ..subscription_request("sub-y")
        };
        let result = f.payments.initiate(request).await.unwrap();
        assert_eq!(result.transaction.plan_id.as_deref(), Some("premium-yearly"));

        f.gateway.set_status("sub-y", GatewayPaymentStatus::Completed, Some(45000));
        f.payments.status("sub-y", true).await.unwrap();
        let active = f.subscriptions.get_active("user-1").await.unwrap().unwrap();
        assert_eq!(active.plan_id, "premium-yearly");
        let term = active.expires_at.unwrap() - active.starts_at;
        assert!(term.num_days() >= 365);
    }

    #[tokio::test]
    async fn test_duplicate_key_from_other_user_rejected() {
        let f = fixture().await;
        f.payments.initiate(subscription_request("sub-1")).await.unwrap();
        let mut other = subscription_request("sub-1");
        other.user_id = "user-2".to_string();
        assert!(matches!(
            f.payments.initiate(other).await,
            Err(BillingError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_amount_rejected_before_any_write() {
        let f = fixture().await;
        let mut request = subscription_request("sub-1");
        request.amount = Some(100);
        assert!(matches!(
            f.payments.initiate(request).await,
            Err(BillingError::Validation { .. })
        ));
        assert!(f.store.all_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_phone_rejected_before_any_write() {
        let f = fixture().await;
        let mut request = subscription_request("sub-1");
        request.buyer.phone = "12345".to_string();
        assert!(f.payments.initiate(request).await.is_err());
        assert!(f.store.all_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_job_posting_amount_comes_from_policy() {
        let f = fixture().await;
        let request = InitiatePayment {
            idempotency_key: "job-1".to_string(),
            user_id: "user-1".to_string(),
            transaction_type: TransactionType::JobPosting,
            amount: None,
            plan_id: None,
            reference_id: Some("job-42".to_string()),
            description: None,
            buyer: buyer(),
        };
        let result = f.payments.initiate(request).await.unwrap();
        assert_eq!(result.transaction.amount, 1000);
        assert_eq!(result.transaction.reference_id.as_deref(), Some("job-42"));
    }

    #[tokio::test]
    async fn test_gateway_unavailable_leaves_pending() {
        let f = fixture().await;
        f.gateway.fail_initiation_with(BillingError::gateway_unavailable("timeout"));

        let err = f.payments.initiate(subscription_request("sub-1")).await.unwrap_err();
        assert!(err.is_retryable());
        let stored = f.payments.status("sub-1", false).await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_status_refresh_settles() {
        let f = fixture().await;
        f.payments.initiate(subscription_request("sub-1")).await.unwrap();
        f.gateway.set_status("sub-1", GatewayPaymentStatus::Completed, Some(5000));

        let cached = f.payments.status("sub-1", false).await.unwrap();
        assert_eq!(cached.status, TransactionStatus::Pending);

        let refreshed = f.payments.status("sub-1", true).await.unwrap();
        assert_eq!(refreshed.status, TransactionStatus::Completed);
        assert!(f.subscriptions.has_active("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_refund_cancels_subscription() {
        let f = fixture().await;
        f.payments.initiate(subscription_request("sub-1")).await.unwrap();
        f.gateway.set_status("sub-1", GatewayPaymentStatus::Completed, Some(5000));
        f.payments.status("sub-1", true).await.unwrap();

        let refunded = f.payments.refund("sub-1", Some("duplicate charge")).await.unwrap();
        assert_eq!(refunded.status, TransactionStatus::Refunded);
        assert_eq!(refunded.metadata["refund_reason"], "duplicate charge");
        assert!(!f.subscriptions.has_active("user-1").await.unwrap());

        // Second refund is a no-op
        let again = f.payments.refund("sub-1", None).await.unwrap();
        assert_eq!(again.status, TransactionStatus::Refunded);
    }

    #[tokio::test]
    async fn test_refund_requires_completed() {
        let f = fixture().await;
        f.payments.initiate(subscription_request("sub-1")).await.unwrap();
        assert!(matches!(
            f.payments.refund("sub-1", None).await,
            Err(BillingError::Validation { .. })
        ));
    }
}
