//! Storage traits for billing data.
//!
//! The engine only needs a handful of atomic primitives from its store:
//! a snapshot read and versioned write of the policy, an insert that fails on
//! duplicate idempotency keys, a compare-and-set on transaction status, and
//! a guarded swap of a user's active subscription. Everything else is
//! built on top of those in the ledgers.
//!
//! [`memory::InMemoryBillingStore`] is always available for tests and local
//! development; a PostgreSQL store lives in `sea_orm_store` behind the
//! `database` feature.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::Result;
use super::plans::PaymentPlan;
use super::policy::BillingPolicy;
use super::subscription::Subscription;
use super::transaction::{NewTransaction, StatusChange, Transaction, TransactionStatus};

/// Plan persistence.
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// Active plans, ordered by `sort_order`.
    async fn list_plans(&self) -> Result<Vec<PaymentPlan>>;

    /// All plans including inactive ones.
    async fn list_all_plans(&self) -> Result<Vec<PaymentPlan>>;

    async fn get_plan(&self, plan_id: &str) -> Result<Option<PaymentPlan>>;

    async fn create_plan(&self, plan: &PaymentPlan) -> Result<()>;

    /// Soft-delete or restore a plan.
    async fn set_plan_active(&self, plan_id: &str, is_active: bool) -> Result<()>;
}

/// Billing policy persistence. Exactly one policy row exists.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Read the whole policy in one go. Returns the defaults if it was never written.
    async fn get_policy(&self) -> Result<BillingPolicy>;

    /// Replace the policy if the stored version still equals `expected_version`.
    ///
    /// Returns `Ok(false)` when another writer got there first.
    async fn compare_and_save_policy(
        &self,
        policy: &BillingPolicy,
        expected_version: i64,
    ) -> Result<bool>;
}

/// Subscription persistence.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// The user's row with `status = active`, regardless of expiry.
    async fn get_active_subscription(&self, user_id: &str) -> Result<Option<Subscription>>;

    /// Atomically cancel the active subscription `expected` (or require that
    /// none exists when `None`) and insert `next`.
    ///
    /// Returns `Ok(false)` without writing anything if the user's active
    /// subscription is no longer `expected`. Implementations must hold a lock
    /// keyed by `user_id` (or equivalent) across the check and both writes.
    async fn replace_active_subscription(
        &self,
        user_id: &str,
        expected: Option<Uuid>,
        next: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Cancel the subscription if it is still active. Returns the updated row.
    async fn cancel_subscription(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Subscription>>;

    /// Newest first.
    async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>>;

    /// Flip active rows with `expires_at <= now` to expired. Returns the count.
    async fn expire_lapsed_subscriptions(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Transaction persistence.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a pending transaction.
    ///
    /// Fails with `BillingError::DuplicateKey` if the idempotency key exists.
    async fn insert_transaction(
        &self,
        new: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<Transaction>;

    async fn get_transaction_by_key(&self, idempotency_key: &str) -> Result<Option<Transaction>>;

    /// Apply `change` only if the stored status is still `expected`.
    ///
    /// Returns the updated row, or `None` if the status moved in the meantime.
    /// Equivalent to `UPDATE ... WHERE idempotency_key = $1 AND status = $expected`.
    async fn compare_and_set_status(
        &self,
        idempotency_key: &str,
        expected: TransactionStatus,
        change: &StatusChange,
    ) -> Result<Option<Transaction>>;

    /// Pending transactions created before `created_before`, least recently
    /// touched first, so rows that keep failing rotate to the back.
    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Transaction>>;

    /// Bump `updated_at` of a still-pending transaction. Returns `false` if
    /// the row is missing or no longer pending.
    async fn touch_pending(&self, idempotency_key: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Completed subscription payments since `completed_after` that no
    /// subscription row references, oldest first.
    async fn list_unfulfilled_subscriptions(
        &self,
        completed_after: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Transaction>>;

    /// A user's transactions, newest first.
    async fn list_user_transactions(&self, user_id: &str) -> Result<Vec<Transaction>>;
}

/// Everything the billing services need from a backing store.
#[async_trait]
pub trait BillingStore: PlanStore + PolicyStore + SubscriptionStore + TransactionStore {
    /// Cheap reachability check for health reporting.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory store for tests and local development.
pub mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::billing::error::BillingError;
    use crate::billing::subscription::SubscriptionStatus;
    use crate::billing::transaction::TransactionType;

    #[derive(Default)]
    struct Inner {
        plans: RwLock<HashMap<String, PaymentPlan>>,
        policy: RwLock<BillingPolicy>,
        subscriptions: RwLock<Vec<Subscription>>,
        transactions: RwLock<HashMap<String, Transaction>>,
        next_transaction_id: RwLock<i64>,
        fail_next_subscription_write: AtomicBool,
    }

    /// In-memory billing store.
    ///
    /// Each compare-and-set runs under a single write lock, which gives the
    /// same guarantees as the row-level guards of the SQL store.
    #[derive(Clone, Default)]
    pub struct InMemoryBillingStore {
        inner: Arc<Inner>,
    }

    fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
        lock.read()
            .map_err(|_| BillingError::storage("in-memory store lock poisoned"))
    }

    fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
        lock.write()
            .map_err(|_| BillingError::storage("in-memory store lock poisoned"))
    }

    impl InMemoryBillingStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot of every subscription the user has (for tests).
        pub fn subscriptions_for(&self, user_id: &str) -> Vec<Subscription> {
            self.inner
                .subscriptions
                .read()
                .map(|subs| subs.iter().filter(|s| s.user_id == user_id).cloned().collect())
                .unwrap_or_default()
        }

        /// Snapshot of all transactions (for tests).
        pub fn all_transactions(&self) -> Vec<Transaction> {
            self.inner
                .transactions
                .read()
                .map(|txs| txs.values().cloned().collect())
                .unwrap_or_default()
        }

        /// Make the next subscription write fail with a storage error (for
        /// tests of partial settlement).
        #[cfg(test)]
        pub(crate) fn fail_next_subscription_write(&self) {
            self.inner
                .fail_next_subscription_write
                .store(true, Ordering::SeqCst);
        }

        /// Overwrite a transaction's timestamps (for sweep tests).
        pub fn backdate_transaction(&self, idempotency_key: &str, created_at: DateTime<Utc>) {
            if let Ok(mut txs) = self.inner.transactions.write() {
                if let Some(tx) = txs.get_mut(idempotency_key) {
                    tx.created_at = created_at;
                    tx.updated_at = created_at;
                }
            }
        }
    }

    #[async_trait]
    impl PlanStore for InMemoryBillingStore {
        async fn list_plans(&self) -> Result<Vec<PaymentPlan>> {
            let mut active: Vec<PaymentPlan> = read(&self.inner.plans)?
                .values()
                .filter(|p| p.is_active)
                .cloned()
                .collect();
            active.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.id.cmp(&b.id)));
            Ok(active)
        }

        async fn list_all_plans(&self) -> Result<Vec<PaymentPlan>> {
            let mut all: Vec<PaymentPlan> = read(&self.inner.plans)?.values().cloned().collect();
            all.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.id.cmp(&b.id)));
            Ok(all)
        }

        async fn get_plan(&self, plan_id: &str) -> Result<Option<PaymentPlan>> {
            Ok(read(&self.inner.plans)?.get(plan_id).cloned())
        }

        async fn create_plan(&self, plan: &PaymentPlan) -> Result<()> {
            write(&self.inner.plans)?.insert(plan.id.clone(), plan.clone());
            Ok(())
        }

        async fn set_plan_active(&self, plan_id: &str, is_active: bool) -> Result<()> {
            let mut plans = write(&self.inner.plans)?;
            match plans.get_mut(plan_id) {
                Some(plan) => {
                    plan.is_active = is_active;
                    Ok(())
                }
                None => Err(BillingError::PlanNotFound {
                    plan_id: plan_id.to_string(),
                }),
            }
        }
    }

    #[async_trait]
    impl PolicyStore for InMemoryBillingStore {
        async fn get_policy(&self) -> Result<BillingPolicy> {
            Ok(read(&self.inner.policy)?.clone())
        }

        async fn compare_and_save_policy(
            &self,
            policy: &BillingPolicy,
            expected_version: i64,
        ) -> Result<bool> {
            let mut current = write(&self.inner.policy)?;
            if current.version != expected_version {
                return Ok(false);
            }
            *current = policy.clone();
            Ok(true)
        }
    }

    #[async_trait]
    impl SubscriptionStore for InMemoryBillingStore {
        async fn get_active_subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
            Ok(read(&self.inner.subscriptions)?
                .iter()
                .find(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active)
                .cloned())
        }

        async fn replace_active_subscription(
            &self,
            user_id: &str,
            expected: Option<Uuid>,
            next: &Subscription,
            now: DateTime<Utc>,
        ) -> Result<bool> {
            if self
                .inner
                .fail_next_subscription_write
                .swap(false, Ordering::SeqCst)
            {
                return Err(BillingError::storage("subscription write failed"));
            }
            let mut subs = write(&self.inner.subscriptions)?;

            let current = subs
                .iter_mut()
                .find(|s| s.user_id == user_id && s.status == SubscriptionStatus::Active);

            match (current, expected) {
                (None, None) => {}
                (Some(sub), Some(id)) if sub.id == id => {
                    sub.status = SubscriptionStatus::Cancelled;
                    sub.cancelled_at = Some(now);
                    sub.updated_at = now;
                }
                _ => return Ok(false),
            }

            subs.push(next.clone());
            Ok(true)
        }

        async fn cancel_subscription(
            &self,
            subscription_id: Uuid,
            now: DateTime<Utc>,
        ) -> Result<Option<Subscription>> {
            let mut subs = write(&self.inner.subscriptions)?;
            Ok(subs
                .iter_mut()
                .find(|s| s.id == subscription_id && s.status == SubscriptionStatus::Active)
                .map(|sub| {
                    sub.status = SubscriptionStatus::Cancelled;
                    sub.cancelled_at = Some(now);
                    sub.updated_at = now;
                    sub.clone()
                }))
        }

        async fn list_subscriptions(&self, user_id: &str) -> Result<Vec<Subscription>> {
            let mut subs: Vec<Subscription> = read(&self.inner.subscriptions)?
                .iter()
                .filter(|s| s.user_id == user_id)
                .cloned()
                .collect();
            subs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(subs)
        }

        async fn expire_lapsed_subscriptions(&self, now: DateTime<Utc>) -> Result<usize> {
            let mut subs = write(&self.inner.subscriptions)?;
            let mut count = 0;
            for sub in subs.iter_mut() {
                if sub.status == SubscriptionStatus::Active && sub.is_expired_at(now) {
                    sub.status = SubscriptionStatus::Expired;
                    sub.updated_at = now;
                    count += 1;
                }
            }
            Ok(count)
        }
    }

    #[async_trait]
    impl TransactionStore for InMemoryBillingStore {
        async fn insert_transaction(
            &self,
            new: &NewTransaction,
            now: DateTime<Utc>,
        ) -> Result<Transaction> {
            let mut txs = write(&self.inner.transactions)?;
            if txs.contains_key(&new.idempotency_key) {
                return Err(BillingError::DuplicateKey {
                    key: new.idempotency_key.clone(),
                });
            }

            let id = {
                let mut next = write(&self.inner.next_transaction_id)?;
                *next += 1;
                *next
            };

            let tx = Transaction {
                id,
                idempotency_key: new.idempotency_key.clone(),
                user_id: new.user_id.clone(),
                plan_id: new.plan_id.clone(),
                transaction_type: new.transaction_type,
                amount: new.amount,
                currency: new.currency.clone(),
                status: TransactionStatus::Pending,
                gateway_reference: None,
                payment_channel: None,
                phone_number: new.phone_number.clone(),
                reference_id: new.reference_id.clone(),
                description: new.description.clone(),
                metadata: new.metadata.clone(),
                created_at: now,
                updated_at: now,
                paid_at: None,
                completed_at: None,
            };
            txs.insert(tx.idempotency_key.clone(), tx.clone());
            Ok(tx)
        }

        async fn get_transaction_by_key(
            &self,
            idempotency_key: &str,
        ) -> Result<Option<Transaction>> {
            Ok(read(&self.inner.transactions)?.get(idempotency_key).cloned())
        }

        async fn compare_and_set_status(
            &self,
            idempotency_key: &str,
            expected: TransactionStatus,
            change: &StatusChange,
        ) -> Result<Option<Transaction>> {
            let mut txs = write(&self.inner.transactions)?;
            match txs.get_mut(idempotency_key) {
                Some(tx) if tx.status == expected => {
                    change.apply(tx);
                    Ok(Some(tx.clone()))
                }
                _ => Ok(None),
            }
        }

        async fn list_stale_pending(
            &self,
            created_before: DateTime<Utc>,
            limit: u64,
        ) -> Result<Vec<Transaction>> {
            let mut stale: Vec<Transaction> = read(&self.inner.transactions)?
                .values()
                .filter(|tx| tx.status == TransactionStatus::Pending && tx.created_at < created_before)
                .cloned()
                .collect();
            stale.sort_by_key(|tx| (tx.updated_at, tx.id));
            stale.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(stale)
        }

        async fn touch_pending(&self, idempotency_key: &str, at: DateTime<Utc>) -> Result<bool> {
            let mut txs = write(&self.inner.transactions)?;
            match txs.get_mut(idempotency_key) {
                Some(tx) if tx.status == TransactionStatus::Pending => {
                    tx.updated_at = at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn list_unfulfilled_subscriptions(
            &self,
            completed_after: DateTime<Utc>,
            limit: u64,
        ) -> Result<Vec<Transaction>> {
            let subs = read(&self.inner.subscriptions)?;
            let mut unfulfilled: Vec<Transaction> = read(&self.inner.transactions)?
                .values()
                .filter(|tx| {
                    tx.status == TransactionStatus::Completed
                        && tx.transaction_type == TransactionType::Subscription
                        && tx.completed_at.is_some_and(|at| at > completed_after)
                })
                .filter(|tx| {
                    !subs
                        .iter()
                        .any(|s| s.transaction_key.as_deref() == Some(tx.idempotency_key.as_str()))
                })
                .cloned()
                .collect();
            unfulfilled.sort_by_key(|tx| (tx.completed_at, tx.id));
            unfulfilled.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            Ok(unfulfilled)
        }

        async fn list_user_transactions(&self, user_id: &str) -> Result<Vec<Transaction>> {
            let mut txs: Vec<Transaction> = read(&self.inner.transactions)?
                .values()
                .filter(|tx| tx.user_id == user_id)
                .cloned()
                .collect();
            txs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            Ok(txs)
        }
    }

    #[async_trait]
    impl BillingStore for InMemoryBillingStore {}
}
