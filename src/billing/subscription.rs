//! Subscription ledger.
//!
//! A user has at most one `active` subscription at a time. Activation swaps
//! the previous one out (marking it `cancelled`) and inserts the new row in
//! a single store operation guarded by the id of the subscription it
//! expects to replace. Rows are never deleted.
//!
//! Whether a subscription is in force is always computed from `expires_at`
//! at read time; a lapsed row stays `active` in storage until
//! [`SubscriptionLedger::expire_lapsed`] tidies it up for reporting.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::audit::{BillingAuditEvent, BillingAuditLogger};
use super::error::{BillingError, Result};
use super::plans::{BillingCycle, PlanCatalog};
use super::storage::BillingStore;
use super::validation::validate_user_id;

const MAX_ACTIVATION_ATTEMPTS: usize = 5;

/// Stored subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Expired,
    Cancelled,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(BillingError::validation(format!(
                "unknown subscription status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A user's subscription to a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub starts_at: DateTime<Utc>,
    /// `None` means the subscription does not lapse.
    pub expires_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Idempotency key of the transaction that paid for it, if any.
    pub transaction_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// In force at `now`: stored as active and not past its expiry.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.expires_at.is_none_or(|exp| exp > now)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Whole days left before expiry; 0 when lapsed or cancelled.
    /// `None` for subscriptions without an expiry.
    #[must_use]
    pub fn days_remaining_at(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.status != SubscriptionStatus::Active {
            return Some(0);
        }
        self.expires_at
            .map(|exp| (exp - now).num_days().max(0))
    }
}

/// How long an activation lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionTerm {
    Cycle(BillingCycle),
    Days(u32),
    /// No expiry, e.g. a complimentary grant.
    Unbounded,
}

impl SubscriptionTerm {
    fn end_from(&self, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cycle(cycle) => Some(cycle.advance(base)),
            Self::Days(days) => Some(base + Duration::days(i64::from(*days))),
            Self::Unbounded => None,
        }
    }
}

/// Result of [`SubscriptionLedger::grant`].
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub subscription: Subscription,
    /// `false` when the subscription for this payment already existed.
    pub created: bool,
}

/// Subscription ledger operations.
#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn BillingStore>,
    plans: PlanCatalog,
    audit: Arc<dyn BillingAuditLogger>,
}

impl SubscriptionLedger {
    #[must_use]
    pub fn new(
        store: Arc<dyn BillingStore>,
        plans: PlanCatalog,
        audit: Arc<dyn BillingAuditLogger>,
    ) -> Self {
        Self { store, plans, audit }
    }

    /// Activate `plan_id` for `user_id`, replacing any active subscription.
    ///
    /// Re-activating the plan the user already holds carries the remaining
    /// time over: the new expiry is counted from the old one. Activating with
    /// the same `transaction_key` as the current subscription returns it
    /// unchanged.
    pub async fn activate(
        &self,
        user_id: &str,
        plan_id: &str,
        term: SubscriptionTerm,
        transaction_key: Option<&str>,
    ) -> Result<Subscription> {
        self.grant(user_id, plan_id, term, transaction_key)
            .await
            .map(|activation| activation.subscription)
    }

    /// Like [`activate`](Self::activate), but also reports whether this call
    /// wrote the subscription or found it already granted for
    /// `transaction_key`.
    pub async fn grant(
        &self,
        user_id: &str,
        plan_id: &str,
        term: SubscriptionTerm,
        transaction_key: Option<&str>,
    ) -> Result<Activation> {
        validate_user_id(user_id)?;
        let plan = self.plans.get(plan_id).await?;
        if !plan.is_subscription() {
            return Err(BillingError::validation(format!(
                "plan '{}' is not a subscription plan",
                plan_id
            )));
        }

        for _ in 0..MAX_ACTIVATION_ATTEMPTS {
            let now = Utc::now();
            let current = self.store.get_active_subscription(user_id).await?;

            if let (Some(existing), Some(key)) = (&current, transaction_key) {
                if existing.transaction_key.as_deref() == Some(key) {
                    return Ok(Activation {
                        subscription: existing.clone(),
                        created: false,
                    });
                }
            }

            let base = match &current {
                Some(existing) if existing.plan_id == plan_id && existing.is_active_at(now) => {
                    existing.expires_at.unwrap_or(now)
                }
                _ => now,
            };

            let next = Subscription {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                plan_id: plan_id.to_string(),
                status: SubscriptionStatus::Active,
                starts_at: now,
                expires_at: term.end_from(base),
                cancelled_at: None,
                transaction_key: transaction_key.map(str::to_string),
                created_at: now,
                updated_at: now,
            };

            let replaced = current.as_ref().map(|s| s.id);
            if self
                .store
                .replace_active_subscription(user_id, replaced, &next, now)
                .await?
            {
                tracing::info!(
                    target: "tollgate::billing::subscription",
                    user_id = %user_id,
                    plan_id = %plan_id,
                    expires_at = ?next.expires_at,
                    replaced = ?replaced,
                    "Subscription activated"
                );
                self.audit.log(BillingAuditEvent::SubscriptionActivated {
                    user_id: user_id.to_string(),
                    plan_id: plan_id.to_string(),
                    subscription_id: next.id.to_string(),
                });
                return Ok(Activation {
                    subscription: next,
                    created: true,
                });
            }

            tracing::debug!(
                target: "tollgate::billing::subscription",
                user_id = %user_id,
                "Concurrent activation detected, retrying"
            );
        }

        Err(BillingError::Internal {
            message: format!("subscription activation for '{}' did not settle", user_id),
        })
    }

    /// Cancel the user's active subscription, if any.
    ///
    /// Cancellation only stops future authorization; it never reverses a charge.
    pub async fn cancel(&self, user_id: &str) -> Result<Option<Subscription>> {
        let Some(current) = self.store.get_active_subscription(user_id).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        let cancelled = self.store.cancel_subscription(current.id, now).await?;

        if let Some(sub) = &cancelled {
            self.audit.log(BillingAuditEvent::SubscriptionCancelled {
                user_id: user_id.to_string(),
                subscription_id: sub.id.to_string(),
            });
        }
        Ok(cancelled)
    }

    /// The subscription currently in force for the user.
    pub async fn get_active(&self, user_id: &str) -> Result<Option<Subscription>> {
        let now = Utc::now();
        Ok(self
            .store
            .get_active_subscription(user_id)
            .await?
            .filter(|s| s.is_active_at(now)))
    }

    pub async fn has_active(&self, user_id: &str) -> Result<bool> {
        Ok(self.get_active(user_id).await?.is_some())
    }

    /// Every subscription the user ever had, newest first.
    pub async fn history(&self, user_id: &str) -> Result<Vec<Subscription>> {
        self.store.list_subscriptions(user_id).await
    }

    /// Mark active rows whose expiry has passed as `expired`.
    pub async fn expire_lapsed(&self, now: DateTime<Utc>) -> Result<usize> {
        let count = self.store.expire_lapsed_subscriptions(now).await?;
        if count > 0 {
            tracing::info!(
                target: "tollgate::billing::subscription",
                count,
                "Marked lapsed subscriptions expired"
            );
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::audit::NoOpAuditLogger;
    use crate::billing::plans::default_catalog;
    use crate::billing::storage::memory::InMemoryBillingStore;

    async fn ledger() -> (SubscriptionLedger, InMemoryBillingStore) {
        let store = InMemoryBillingStore::new();
        let shared: Arc<dyn BillingStore> = Arc::new(store.clone());
        let plans = PlanCatalog::new(shared.clone());
        plans.seed(default_catalog()).await.unwrap();
        (
            SubscriptionLedger::new(shared, plans, Arc::new(NoOpAuditLogger)),
            store,
        )
    }

    fn subscription(expires_at: Option<DateTime<Utc>>) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            user_id: "user_1".to_string(),
            plan_id: "basic-monthly".to_string(),
            status: SubscriptionStatus::Active,
            starts_at: now - Duration::days(40),
            expires_at,
            cancelled_at: None,
            transaction_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_expiry_is_computed() {
        let now = Utc::now();
        let lapsed = subscription(Some(now - Duration::days(1)));
        assert_eq!(lapsed.status, SubscriptionStatus::Active);
        assert!(!lapsed.is_active_at(now));
        assert!(lapsed.is_expired_at(now));
        assert_eq!(lapsed.days_remaining_at(now), Some(0));

        let open_ended = subscription(None);
        assert!(open_ended.is_active_at(now));
        assert_eq!(open_ended.days_remaining_at(now), None);

        let running = subscription(Some(now + Duration::days(10) + Duration::hours(1)));
        assert_eq!(running.days_remaining_at(now), Some(10));
    }

    #[tokio::test]
    async fn test_activate_and_cancel() {
        let (ledger, _) = ledger().await;

        let sub = ledger
            .activate("user_1", "basic-monthly", SubscriptionTerm::Cycle(BillingCycle::Monthly), None)
            .await
            .unwrap();
        assert!(sub.is_active());
        assert!(ledger.has_active("user_1").await.unwrap());

        let cancelled = ledger.cancel("user_1").await.unwrap().unwrap();
        assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert!(!ledger.has_active("user_1").await.unwrap());

        // History is retained
        assert_eq!(ledger.history("user_1").await.unwrap().len(), 1);
        assert!(ledger.cancel("user_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_switching_plans_cancels_previous() {
        let (ledger, _) = ledger().await;
        let first = ledger
            .activate("user_1", "basic-monthly", SubscriptionTerm::Cycle(BillingCycle::Monthly), None)
            .await
            .unwrap();
        let second = ledger
            .activate("user_1", "premium-yearly", SubscriptionTerm::Cycle(BillingCycle::Yearly), None)
            .await
            .unwrap();

        let history = ledger.history("user_1").await.unwrap();
        let active: Vec<_> = history
            .iter()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
        let old = history.iter().find(|s| s.id == first.id).unwrap();
        assert_eq!(old.status, SubscriptionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_same_plan_extends_from_current_expiry() {
        let (ledger, _) = ledger().await;
        let first = ledger
            .activate("user_1", "basic-monthly", SubscriptionTerm::Days(30), None)
            .await
            .unwrap();
        let second = ledger
            .activate("user_1", "basic-monthly", SubscriptionTerm::Days(30), None)
            .await
            .unwrap();

        let first_exp = first.expires_at.unwrap();
        assert_eq!(second.expires_at.unwrap(), first_exp + Duration::days(30));
    }

    #[tokio::test]
    async fn test_same_transaction_key_does_not_extend_twice() {
        let (ledger, _) = ledger().await;
        let term = SubscriptionTerm::Cycle(BillingCycle::Monthly);
        let first = ledger
            .activate("user_1", "basic-monthly", term, Some("ord-1"))
            .await
            .unwrap();
        let again = ledger
            .activate("user_1", "basic-monthly", term, Some("ord-1"))
            .await
            .unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_rejects_non_subscription_plan() {
        let (ledger, _) = ledger().await;
        let err = ledger
            .activate("user_1", "pay-per-job", SubscriptionTerm::Days(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_expire_lapsed() {
        let (ledger, store) = ledger().await;
        ledger
            .activate("user_1", "basic-monthly", SubscriptionTerm::Days(1), None)
            .await
            .unwrap();

        let later = Utc::now() + Duration::days(2);
        assert_eq!(ledger.expire_lapsed(later).await.unwrap(), 1);
        let subs = store.subscriptions_for("user_1");
        assert_eq!(subs[0].status, SubscriptionStatus::Expired);
        assert!(!ledger.has_active("user_1").await.unwrap());
    }
}
