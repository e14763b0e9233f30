//! Transaction ledger.
//!
//! One row per attempted charge, keyed by the caller-chosen idempotency key.
//! Status only ever moves forward:
//!
//! ```text
//! pending ──► completed ──► refunded
//!    │
//!    └──────► failed
//! ```
//!
//! Every status change goes through [`TransactionLedger::transition`], which
//! compare-and-sets against the stored status. Requests for the current
//! status or for an earlier one are no-ops so replayed callbacks are
//! harmless; anything else is an [`BillingError::IllegalTransition`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::audit::{BillingAuditEvent, BillingAuditLogger};
use super::error::{BillingError, Result};
use super::storage::BillingStore;
use super::validation::{validate_currency, validate_idempotency_key, validate_plan_id, validate_user_id};

/// Upper bound on compare-and-set retries. Status has at most two forward
/// steps, so a transition can lose the race at most twice.
const MAX_TRANSITION_ATTEMPTS: usize = 4;

/// What a transaction pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Subscription,
    PayPerUse,
    JobPosting,
    FundiApplication,
}

impl TransactionType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscription => "subscription",
            Self::PayPerUse => "pay_per_use",
            Self::JobPosting => "job_posting",
            Self::FundiApplication => "fundi_application",
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "subscription" => Ok(Self::Subscription),
            "pay_per_use" => Ok(Self::PayPerUse),
            "job_posting" => Ok(Self::JobPosting),
            "fundi_application" => Ok(Self::FundiApplication),
            other => Err(BillingError::validation(format!(
                "unknown transaction type '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

/// How a requested status change relates to the current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCheck {
    /// A legal forward edge.
    Apply,
    /// Already there, or asking for an earlier state. Nothing to do.
    NoOp,
    Illegal,
}

impl TransactionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// States this one can only have been reached through.
    fn predecessors(&self) -> &'static [TransactionStatus] {
        match self {
            Self::Pending => &[],
            Self::Completed | Self::Failed => &[Self::Pending],
            Self::Refunded => &[Self::Pending, Self::Completed],
        }
    }

    /// Classify a requested move from `self` to `to`.
    #[must_use]
    pub fn check_transition(&self, to: TransactionStatus) -> TransitionCheck {
        use TransactionStatus::*;

        match (self, to) {
            (Pending, Completed) | (Pending, Failed) | (Completed, Refunded) => {
                TransitionCheck::Apply
            }
            (from, to) if *from == to || from.predecessors().contains(&to) => {
                TransitionCheck::NoOp
            }
            _ => TransitionCheck::Illegal,
        }
    }

    /// No transition out of this state is legal any more.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Failed | Self::Refunded)
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(BillingError::validation(format!(
                "unknown transaction status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A payment transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub idempotency_key: String,
    pub user_id: String,
    pub plan_id: Option<String>,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub currency: String,
    pub status: TransactionStatus,
    pub gateway_reference: Option<String>,
    /// Mobile-money channel reported by the gateway (e.g. `MPESA-TZ`).
    pub payment_channel: Option<String>,
    pub phone_number: Option<String>,
    /// The job or application this payment unlocks.
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for a new pending transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub idempotency_key: String,
    pub user_id: String,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub currency: String,
    pub plan_id: Option<String>,
    pub phone_number: Option<String>,
    pub reference_id: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
}

impl NewTransaction {
    #[must_use]
    pub fn new(
        idempotency_key: impl Into<String>,
        user_id: impl Into<String>,
        transaction_type: TransactionType,
        amount: i64,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            user_id: user_id.into(),
            transaction_type,
            amount,
            currency: "TZS".to_string(),
            plan_id: None,
            phone_number: None,
            reference_id: None,
            description: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    #[must_use]
    pub fn plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    #[must_use]
    pub fn currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    #[must_use]
    pub fn phone(mut self, phone_number: impl Into<String>) -> Self {
        self.phone_number = Some(phone_number.into());
        self
    }

    #[must_use]
    pub fn reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn validate(&self) -> Result<()> {
        validate_idempotency_key(&self.idempotency_key)?;
        validate_user_id(&self.user_id)?;
        validate_currency(&self.currency)?;
        if let Some(plan_id) = &self.plan_id {
            validate_plan_id(plan_id)?;
        }
        if self.amount <= 0 {
            return Err(BillingError::validation("amount must be positive"));
        }
        if self.transaction_type == TransactionType::Subscription && self.plan_id.is_none() {
            return Err(BillingError::validation(
                "subscription transactions must name a plan",
            ));
        }
        if !self.metadata.is_object() {
            return Err(BillingError::validation("metadata must be a JSON object"));
        }
        Ok(())
    }
}

/// Fields written together with a status change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub to: TransactionStatus,
    pub gateway_reference: Option<String>,
    pub payment_channel: Option<String>,
    /// Merged into the stored metadata object, key by key.
    pub metadata: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    /// Apply this change to a row. Stores call this inside their atomic section.
    pub fn apply(&self, tx: &mut Transaction) {
        tx.status = self.to;
        if self.gateway_reference.is_some() {
            tx.gateway_reference = self.gateway_reference.clone();
        }
        if self.payment_channel.is_some() {
            tx.payment_channel = self.payment_channel.clone();
        }
        if let Some(patch) = &self.metadata {
            merge_metadata(&mut tx.metadata, patch);
        }
        if self.to == TransactionStatus::Completed {
            tx.paid_at = Some(self.at);
            tx.completed_at = Some(self.at);
        }
        tx.updated_at = self.at;
    }
}

/// Shallow-merge `patch` into `target`. Non-object targets are replaced.
pub fn merge_metadata(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let Some(patch) = patch.as_object() else {
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(Default::default());
    }
    if let Some(obj) = target.as_object_mut() {
        for (k, v) in patch {
            obj.insert(k.clone(), v.clone());
        }
    }
}

/// A requested status change and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub to: TransactionStatus,
    pub gateway_reference: Option<String>,
    pub payment_channel: Option<String>,
    pub metadata: Option<serde_json::Value>,
    /// Who asked: `webhook`, `sweep`, `initiation`, `refund`.
    pub source: &'static str,
}

impl TransitionRequest {
    #[must_use]
    pub fn new(to: TransactionStatus, source: &'static str) -> Self {
        Self {
            to,
            gateway_reference: None,
            payment_channel: None,
            metadata: None,
            source,
        }
    }

    #[must_use]
    pub fn gateway_reference(mut self, reference: Option<String>) -> Self {
        self.gateway_reference = reference;
        self
    }

    #[must_use]
    pub fn payment_channel(mut self, channel: Option<String>) -> Self {
        self.payment_channel = channel;
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of [`TransactionLedger::transition`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    /// The row after the call.
    pub transaction: Transaction,
    /// Whether this call changed the status. Side effects key off this.
    pub changed: bool,
}

impl TransitionOutcome {
    /// This call moved the transaction from pending to completed.
    #[must_use]
    pub fn newly_completed(&self) -> bool {
        self.changed && self.transaction.status == TransactionStatus::Completed
    }
}

/// Transaction ledger operations.
#[derive(Clone)]
pub struct TransactionLedger {
    store: Arc<dyn BillingStore>,
    audit: Arc<dyn BillingAuditLogger>,
}

impl TransactionLedger {
    #[must_use]
    pub fn new(store: Arc<dyn BillingStore>, audit: Arc<dyn BillingAuditLogger>) -> Self {
        Self { store, audit }
    }

    /// Record a new pending transaction.
    ///
    /// Fails with [`BillingError::DuplicateKey`] if the key is taken; callers
    /// should then fetch the existing row with [`get`](Self::get).
    pub async fn create(&self, new: NewTransaction) -> Result<Transaction> {
        new.validate()?;
        let tx = self.store.insert_transaction(&new, Utc::now()).await?;

        self.audit.log(BillingAuditEvent::TransactionCreated {
            idempotency_key: tx.idempotency_key.clone(),
            user_id: tx.user_id.clone(),
            amount: tx.amount,
        });

        Ok(tx)
    }

    pub async fn find(&self, idempotency_key: &str) -> Result<Option<Transaction>> {
        self.store.get_transaction_by_key(idempotency_key).await
    }

    pub async fn get(&self, idempotency_key: &str) -> Result<Transaction> {
        self.find(idempotency_key)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound {
                key: idempotency_key.to_string(),
            })
    }

    /// Pending transactions older than `created_before`, least recently
    /// polled first.
    pub async fn stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Transaction>> {
        self.store.list_stale_pending(created_before, limit).await
    }

    /// Record that a pending transaction was just polled, moving it behind
    /// the rows not yet looked at.
    pub async fn mark_polled(&self, idempotency_key: &str, at: DateTime<Utc>) -> Result<bool> {
        self.store.touch_pending(idempotency_key, at).await
    }

    /// Completed subscription payments since `completed_after` that never
    /// produced a subscription.
    pub async fn unfulfilled_subscriptions(
        &self,
        completed_after: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Transaction>> {
        self.store
            .list_unfulfilled_subscriptions(completed_after, limit)
            .await
    }

    pub async fn for_user(&self, user_id: &str) -> Result<Vec<Transaction>> {
        validate_user_id(user_id)?;
        self.store.list_user_transactions(user_id).await
    }

    /// Move a transaction to `request.to`, at most once.
    ///
    /// Replays and requests for an earlier state return the current row with
    /// `changed = false`. Illegal edges are audited and rejected.
    pub async fn transition(
        &self,
        idempotency_key: &str,
        request: TransitionRequest,
    ) -> Result<TransitionOutcome> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let current = self.get(idempotency_key).await?;

            match current.status.check_transition(request.to) {
                TransitionCheck::NoOp => {
                    tracing::debug!(
                        target: "tollgate::billing::transaction",
                        idempotency_key = %idempotency_key,
                        status = %current.status,
                        requested = %request.to,
                        source = request.source,
                        "Transition is a no-op"
                    );
                    return Ok(TransitionOutcome {
                        transaction: current,
                        changed: false,
                    });
                }
                TransitionCheck::Illegal => {
                    self.audit.log(BillingAuditEvent::IllegalTransition {
                        idempotency_key: idempotency_key.to_string(),
                        from: current.status,
                        to: request.to,
                        source: request.source.to_string(),
                    });
                    return Err(BillingError::IllegalTransition {
                        key: idempotency_key.to_string(),
                        from: current.status,
                        to: request.to,
                    });
                }
                TransitionCheck::Apply => {
                    let change = StatusChange {
                        to: request.to,
                        gateway_reference: request.gateway_reference.clone(),
                        payment_channel: request.payment_channel.clone(),
                        metadata: request.metadata.clone(),
                        at: Utc::now(),
                    };

                    if let Some(updated) = self
                        .store
                        .compare_and_set_status(idempotency_key, current.status, &change)
                        .await?
                    {
                        self.audit.log(BillingAuditEvent::TransactionTransitioned {
                            idempotency_key: idempotency_key.to_string(),
                            from: current.status,
                            to: request.to,
                            source: request.source.to_string(),
                        });
                        return Ok(TransitionOutcome {
                            transaction: updated,
                            changed: true,
                        });
                    }

                    // Someone else moved it first; re-read and classify again
                    tracing::debug!(
                        target: "tollgate::billing::transaction",
                        idempotency_key = %idempotency_key,
                        expected = %current.status,
                        "Lost status race, retrying"
                    );
                }
            }
        }

        Err(BillingError::Internal {
            message: format!("transition of '{}' did not settle", idempotency_key),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::tests::RecordingAuditLogger;
    use crate::billing::storage::memory::InMemoryBillingStore;
    use TransactionStatus::*;

    fn ledger() -> (TransactionLedger, RecordingAuditLogger) {
        let audit = RecordingAuditLogger::default();
        let ledger = TransactionLedger::new(
            Arc::new(InMemoryBillingStore::new()),
            Arc::new(audit.clone()),
        );
        (ledger, audit)
    }

    #[test]
    fn test_transition_table() {
        assert_eq!(Pending.check_transition(Completed), TransitionCheck::Apply);
        assert_eq!(Pending.check_transition(Failed), TransitionCheck::Apply);
        assert_eq!(Completed.check_transition(Refunded), TransitionCheck::Apply);

        assert_eq!(Pending.check_transition(Pending), TransitionCheck::NoOp);
        assert_eq!(Completed.check_transition(Completed), TransitionCheck::NoOp);
        assert_eq!(Completed.check_transition(Pending), TransitionCheck::NoOp);
        assert_eq!(Failed.check_transition(Pending), TransitionCheck::NoOp);
        assert_eq!(Refunded.check_transition(Completed), TransitionCheck::NoOp);

        assert_eq!(Failed.check_transition(Completed), TransitionCheck::Illegal);
        assert_eq!(Completed.check_transition(Failed), TransitionCheck::Illegal);
        assert_eq!(Pending.check_transition(Refunded), TransitionCheck::Illegal);
        assert_eq!(Failed.check_transition(Refunded), TransitionCheck::Illegal);
        assert_eq!(Refunded.check_transition(Failed), TransitionCheck::Illegal);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_key() {
        let (ledger, _) = ledger();
        let new = NewTransaction::new("ord-1", "user_1", TransactionType::JobPosting, 1000);

        let first = ledger.create(new.clone()).await.unwrap();
        assert_eq!(first.status, Pending);

        let err = ledger.create(new).await.unwrap_err();
        assert_eq!(err, BillingError::DuplicateKey { key: "ord-1".to_string() });
    }

    #[tokio::test]
    async fn test_create_validates_before_writing() {
        let (ledger, _) = ledger();
        let bad = NewTransaction::new("ord 1", "user_1", TransactionType::JobPosting, 1000);
        assert!(matches!(ledger.create(bad).await, Err(BillingError::Validation { .. })));

        let no_plan = NewTransaction::new("ord-2", "user_1", TransactionType::Subscription, 5000);
        assert!(ledger.create(no_plan).await.is_err());
        assert!(ledger.find("ord-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_is_idempotent() {
        let (ledger, audit) = ledger();
        ledger
            .create(NewTransaction::new("ord-1", "user_1", TransactionType::JobPosting, 1000))
            .await
            .unwrap();

        let request = TransitionRequest::new(Completed, "webhook")
            .gateway_reference(Some("REF-1".to_string()));

        let first = ledger.transition("ord-1", request.clone()).await.unwrap();
        assert!(first.changed);
        assert!(first.newly_completed());
        assert_eq!(first.transaction.gateway_reference.as_deref(), Some("REF-1"));
        assert!(first.transaction.completed_at.is_some());

        let second = ledger.transition("ord-1", request).await.unwrap();
        assert!(!second.changed);
        assert_eq!(second.transaction, first.transaction);

        let transitions = audit
            .events()
            .into_iter()
            .filter(|e| matches!(e, BillingAuditEvent::TransactionTransitioned { .. }))
            .count();
        assert_eq!(transitions, 1);
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected_and_audited() {
        let (ledger, audit) = ledger();
        ledger
            .create(NewTransaction::new("ord-1", "user_1", TransactionType::JobPosting, 1000))
            .await
            .unwrap();
        ledger
            .transition("ord-1", TransitionRequest::new(Failed, "sweep"))
            .await
            .unwrap();

        let err = ledger
            .transition("ord-1", TransitionRequest::new(Completed, "webhook"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::IllegalTransition { from: Failed, to: Completed, .. }));
        assert_eq!(ledger.get("ord-1").await.unwrap().status, Failed);
        assert_eq!(audit.security_events().len(), 1);
    }

    #[tokio::test]
    async fn test_refund_after_completion() {
        let (ledger, _) = ledger();
        ledger
            .create(NewTransaction::new("ord-1", "user_1", TransactionType::JobPosting, 1000))
            .await
            .unwrap();
        assert!(ledger
            .transition("ord-1", TransitionRequest::new(Refunded, "refund"))
            .await
            .is_err());

        ledger
            .transition("ord-1", TransitionRequest::new(Completed, "webhook"))
            .await
            .unwrap();
        let refunded = ledger
            .transition("ord-1", TransitionRequest::new(Refunded, "refund"))
            .await
            .unwrap();
        assert!(refunded.changed);
        assert!(!refunded.newly_completed());

        // A late COMPLETED replay after the refund does nothing
        let replay = ledger
            .transition("ord-1", TransitionRequest::new(Completed, "webhook"))
            .await
            .unwrap();
        assert!(!replay.changed);
        assert_eq!(replay.transaction.status, Refunded);
    }

    #[tokio::test]
    async fn test_transition_merges_metadata() {
        let (ledger, _) = ledger();
        let mut new = NewTransaction::new("ord-1", "user_1", TransactionType::JobPosting, 1000);
        new.metadata = serde_json::json!({ "job_id": "job_9" });
        ledger.create(new).await.unwrap();

        let outcome = ledger
            .transition(
                "ord-1",
                TransitionRequest::new(Completed, "webhook")
                    .metadata(Some(serde_json::json!({ "channel": "MPESA-TZ" }))),
            )
            .await
            .unwrap();
        assert_eq!(outcome.transaction.metadata["job_id"], "job_9");
        assert_eq!(outcome.transaction.metadata["channel"], "MPESA-TZ");
    }

    #[tokio::test]
    async fn test_unknown_key() {
        let (ledger, _) = ledger();
        let err = ledger
            .transition("missing", TransitionRequest::new(Completed, "webhook"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::TransactionNotFound { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completion_changes_once() {
        let (ledger, _) = ledger();
        ledger
            .create(NewTransaction::new("ord-1", "user_1", TransactionType::JobPosting, 1000))
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .transition("ord-1", TransitionRequest::new(Completed, "webhook"))
                        .await
                })
            })
            .collect();

        let mut changed = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().changed {
                changed += 1;
            }
        }
        assert_eq!(changed, 1);
    }
}
