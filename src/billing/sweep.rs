//! Pending-transaction sweep.
//!
//! Webhook delivery is not guaranteed, so transactions left pending past a
//! timeout are polled at the gateway and settled from its answer. A
//! transaction the gateway still does not report as paid after the expiry
//! window is failed. Transport errors never fail anything: the transaction
//! is polled again on a later pass. Every polled row that stays pending is
//! stamped, so each pass starts with the rows looked at least recently and a
//! batch of unreachable orders cannot hide newer ones.
//!
//! Each pass also grants subscriptions for completed payments whose
//! activation never landed.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;

use super::error::{BillingError, Result};
use super::gateway::GatewayAdapter;
use super::settlement::{Settlement, SettlementOutcome};
use super::subscription::SubscriptionLedger;
use super::transaction::{Transaction, TransactionLedger, TransactionStatus, TransitionRequest};

/// Sweep tuning.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Age before a pending transaction is polled.
    pub pending_timeout: Duration,
    /// Age after which an unpaid pending transaction is failed.
    pub pending_expiry: Duration,
    /// Transactions examined per pass.
    pub batch_size: u64,
    /// How far back completed subscription payments are checked for a
    /// missing subscription.
    pub recovery_window: Duration,
    /// Time between passes.
    pub interval: std::time::Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            pending_timeout: Duration::minutes(30),
            pending_expiry: Duration::hours(24),
            batch_size: 100,
            recovery_window: Duration::days(7),
            interval: std::time::Duration::from_secs(60),
        }
    }
}

/// Counts from one sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub settled: usize,
    pub expired: usize,
    pub still_pending: usize,
    pub errors: usize,
    /// Completed payments whose missing subscription was granted.
    pub recovered: usize,
    pub subscriptions_expired: usize,
}

/// Polls the gateway for stuck transactions.
#[derive(Clone)]
pub struct PendingSweeper {
    ledger: TransactionLedger,
    gateway: GatewayAdapter,
    settlement: Settlement,
    subscriptions: SubscriptionLedger,
    config: SweepConfig,
}

impl PendingSweeper {
    #[must_use]
    pub fn new(
        ledger: TransactionLedger,
        gateway: GatewayAdapter,
        settlement: Settlement,
        subscriptions: SubscriptionLedger,
        config: SweepConfig,
    ) -> Self {
        Self {
            ledger,
            gateway,
            settlement,
            subscriptions,
            config,
        }
    }

    /// Run one pass as of `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let stale = self
            .ledger
            .stale_pending(now - self.config.pending_timeout, self.config.batch_size)
            .await?;

        for tx in stale {
            report.examined += 1;
            let swept = self.sweep_one(&tx, now).await;
            match &swept {
                Ok(Swept::Settled) => report.settled += 1,
                Ok(Swept::Expired) => report.expired += 1,
                Ok(Swept::Pending) => report.still_pending += 1,
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        target: "tollgate::billing::sweep",
                        idempotency_key = %tx.idempotency_key,
                        error = %e,
                        "Failed to sweep transaction"
                    );
                }
            }
            if matches!(swept, Ok(Swept::Pending) | Err(_)) {
                self.mark_polled(&tx, now).await;
            }
        }

        self.recover_unfulfilled(now, &mut report).await?;

        report.subscriptions_expired = self.subscriptions.expire_lapsed(now).await?;

        if report.examined > 0 || report.recovered > 0 || report.subscriptions_expired > 0 {
            tracing::info!(
                target: "tollgate::billing::sweep",
                examined = report.examined,
                settled = report.settled,
                expired = report.expired,
                still_pending = report.still_pending,
                errors = report.errors,
                recovered = report.recovered,
                subscriptions_expired = report.subscriptions_expired,
                "Sweep pass finished"
            );
        }

        Ok(report)
    }

    async fn sweep_one(&self, tx: &Transaction, now: DateTime<Utc>) -> Result<Swept> {
        let past_expiry = tx.created_at < now - self.config.pending_expiry;

        match self.gateway.poll(&tx.idempotency_key).await {
            Ok(status) => match self.settlement.apply(&status.into(), "sweep").await {
                Ok(
                    SettlementOutcome::Settled { .. }
                    | SettlementOutcome::Recovered { .. }
                    | SettlementOutcome::AlreadySettled(_),
                ) => Ok(Swept::Settled),
                Ok(SettlementOutcome::StillPending(_)) if past_expiry => {
                    self.expire(tx, "no payment confirmation before expiry").await
                }
                Ok(SettlementOutcome::StillPending(_)) => Ok(Swept::Pending),
                // The gateway keeps reporting a different amount than was charged
                Err(BillingError::Validation { .. }) if past_expiry => {
                    self.expire(tx, "reported amount did not match before expiry").await
                }
                Err(e) => Err(e),
            },
            Err(e) if e.is_retryable() => {
                tracing::debug!(
                    target: "tollgate::billing::sweep",
                    idempotency_key = %tx.idempotency_key,
                    error = %e,
                    "Gateway unavailable, will poll again"
                );
                Ok(Swept::Pending)
            }
            // The gateway has no record of the order
            Err(BillingError::GatewayRejected { .. }) if past_expiry => {
                self.expire(tx, "no payment confirmation before expiry").await
            }
            Err(BillingError::GatewayRejected { .. }) => Ok(Swept::Pending),
            Err(e) => Err(e),
        }
    }

    async fn mark_polled(&self, tx: &Transaction, now: DateTime<Utc>) {
        if let Err(e) = self.ledger.mark_polled(&tx.idempotency_key, now).await {
            tracing::debug!(
                target: "tollgate::billing::sweep",
                idempotency_key = %tx.idempotency_key,
                error = %e,
                "Could not stamp polled transaction"
            );
        }
    }

    async fn recover_unfulfilled(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        let unfulfilled = self
            .ledger
            .unfulfilled_subscriptions(now - self.config.recovery_window, self.config.batch_size)
            .await?;

        for tx in unfulfilled {
            let key = tx.idempotency_key.clone();
            match self.settlement.reconcile(tx).await {
                Ok(SettlementOutcome::Recovered { .. }) => report.recovered += 1,
                Ok(_) => {}
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(
                        target: "tollgate::billing::sweep",
                        idempotency_key = %key,
                        error = %e,
                        "Failed to grant subscription for completed payment"
                    );
                }
            }
        }
        Ok(())
    }

    async fn expire(&self, tx: &Transaction, reason: &str) -> Result<Swept> {
        let request = TransitionRequest::new(TransactionStatus::Failed, "sweep")
            .metadata(Some(serde_json::json!({ "failure_reason": reason })));
        let outcome = self.ledger.transition(&tx.idempotency_key, request).await?;
        tracing::info!(
            target: "tollgate::billing::sweep",
            idempotency_key = %tx.idempotency_key,
            status = %outcome.transaction.status,
            reason,
            "Expired unpaid transaction"
        );
        Ok(Swept::Expired)
    }

    /// Run passes every `interval` on a background task until shut down.
    pub fn spawn(self) -> SweepHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let interval = self.config.interval;

        let handle = tokio::spawn(async move {
            tracing::info!(
                target: "tollgate::billing::sweep",
                interval_secs = interval.as_secs(),
                "Pending sweep started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            tracing::error!(
                                target: "tollgate::billing::sweep",
                                error = %e,
                                "Sweep pass failed"
                            );
                        }
                    }
                }
            }

            tracing::info!(target: "tollgate::billing::sweep", "Pending sweep stopped");
        });

        SweepHandle {
            handle,
            shutdown_tx,
        }
    }
}

enum Swept {
    Settled,
    Expired,
    Pending,
}

/// Handle to a running sweep task.
pub struct SweepHandle {
    handle: tokio::task::JoinHandle<()>,
    shutdown_tx: mpsc::Sender<()>,
}

impl SweepHandle {
    /// Stop after the current pass finishes.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::billing::audit::NoOpAuditLogger;
    use crate::billing::gateway::tests::MockGateway;
    use crate::billing::gateway::GatewayPaymentStatus;
    use crate::billing::notify::tests::RecordingNotifier;
    use crate::billing::plans::{default_catalog, PlanCatalog};
    use crate::billing::storage::memory::InMemoryBillingStore;
    use crate::billing::transaction::{NewTransaction, TransactionType};

    struct Fixture {
        sweeper: PendingSweeper,
        ledger: TransactionLedger,
        store: InMemoryBillingStore,
        gateway: MockGateway,
        notifier: RecordingNotifier,
        subscriptions: SubscriptionLedger,
    }

    async fn fixture() -> Fixture {
        fixture_with(SweepConfig::default()).await
    }

    async fn fixture_with(config: SweepConfig) -> Fixture {
        let store = InMemoryBillingStore::new();
        let shared: Arc<dyn crate::billing::storage::BillingStore> = Arc::new(store.clone());
        let audit = Arc::new(NoOpAuditLogger);
        let plans = PlanCatalog::new(shared.clone());
        plans.seed(default_catalog()).await.unwrap();
        let ledger = TransactionLedger::new(shared.clone(), audit.clone());
        let subscriptions = SubscriptionLedger::new(shared.clone(), plans.clone(), audit.clone());
        let notifier = RecordingNotifier::default();
        let settlement = Settlement::new(
            ledger.clone(),
            subscriptions.clone(),
            plans,
            Arc::new(notifier.clone()),
            audit,
        );
        let gateway = MockGateway::default();
        let adapter = GatewayAdapter::new(Arc::new(gateway.clone()), ledger.clone());
        let sweeper = PendingSweeper::new(
            ledger.clone(),
            adapter,
            settlement,
            subscriptions.clone(),
            config,
        );
        Fixture {
            sweeper,
            ledger,
            store,
            gateway,
            notifier,
            subscriptions,
        }
    }

    async fn stale_subscription(f: &Fixture, key: &str, age: Duration) {
        f.ledger
            .create(NewTransaction::new(key, "user-1", TransactionType::Subscription, 5000).plan("basic-monthly"))
            .await
            .unwrap();
        f.store.backdate_transaction(key, Utc::now() - age);
    }

    #[tokio::test]
    async fn test_fresh_transactions_are_not_polled() {
        let f = fixture().await;
        stale_subscription(&f, "fresh", Duration::minutes(5)).await;

        let report = f.sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(f.gateway.poll_count(), 0);
    }

    #[tokio::test]
    async fn test_completed_poll_settles_and_activates() {
        let f = fixture().await;
        stale_subscription(&f, "stuck", Duration::hours(1)).await;
        f.gateway.set_status("stuck", GatewayPaymentStatus::Completed, Some(5000));

        let report = f.sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.settled, 1);
        assert_eq!(f.ledger.get("stuck").await.unwrap().status, TransactionStatus::Completed);
        assert!(f.subscriptions.has_active("user-1").await.unwrap());
        assert_eq!(f.notifier.sent().len(), 1);

        // Nothing left to do on the next pass
        let again = f.sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(again.examined, 0);
        assert_eq!(f.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_gateway_leaves_pending() {
        let f = fixture().await;
        stale_subscription(&f, "stuck", Duration::days(3)).await;
        f.gateway.fail_polls_with(BillingError::gateway_unavailable("connection refused"));

        let report = f.sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.still_pending, 1);
        assert_eq!(f.ledger.get("stuck").await.unwrap().status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_unpaid_past_expiry_is_failed() {
        let f = fixture().await;
        stale_subscription(&f, "old", Duration::days(2)).await;
        stale_subscription(&f, "recent", Duration::hours(2)).await;

        let report = f.sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.expired, 1);
        assert_eq!(report.still_pending, 1);
        assert_eq!(f.ledger.get("old").await.unwrap().status, TransactionStatus::Failed);
        assert_eq!(f.ledger.get("recent").await.unwrap().status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_rows_left_pending_rotate_behind_newer_ones() {
        let f = fixture_with(SweepConfig {
            batch_size: 3,
            ..SweepConfig::default()
        })
        .await;
        for (key, minutes) in [("old-1", 180), ("old-2", 150), ("old-3", 120)] {
            stale_subscription(&f, key, Duration::minutes(minutes)).await;
        }
        stale_subscription(&f, "newer", Duration::minutes(60)).await;
        f.gateway.set_status("newer", GatewayPaymentStatus::Completed, Some(5000));

        let first = f.sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(first.examined, 3);
        assert_eq!(first.still_pending, 3);
        assert_eq!(f.ledger.get("newer").await.unwrap().status, TransactionStatus::Pending);

        let second = f.sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(second.settled, 1);
        assert_eq!(f.ledger.get("newer").await.unwrap().status, TransactionStatus::Completed);
        assert!(f.subscriptions.has_active("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_amount_mismatch_fails_only_after_expiry() {
        let f = fixture().await;
        stale_subscription(&f, "recent", Duration::hours(2)).await;
        stale_subscription(&f, "old", Duration::days(2)).await;
        f.gateway.set_status("recent", GatewayPaymentStatus::Completed, Some(50));
        f.gateway.set_status("old", GatewayPaymentStatus::Completed, Some(50));

        let report = f.sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.errors, 1);

        let old = f.ledger.get("old").await.unwrap();
        assert_eq!(old.status, TransactionStatus::Failed);
        assert_eq!(old.metadata["failure_reason"], "reported amount did not match before expiry");
        assert_eq!(f.ledger.get("recent").await.unwrap().status, TransactionStatus::Pending);
        assert!(!f.subscriptions.has_active("user-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_grants_subscription_missing_after_completion() {
        let f = fixture().await;
        stale_subscription(&f, "stuck", Duration::hours(1)).await;
        f.gateway.set_status("stuck", GatewayPaymentStatus::Completed, Some(5000));
        f.store.fail_next_subscription_write();

        let report = f.sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.recovered, 1);
        assert_eq!(f.ledger.get("stuck").await.unwrap().status, TransactionStatus::Completed);

        let active = f.subscriptions.get_active("user-1").await.unwrap().unwrap();
        assert_eq!(active.transaction_key.as_deref(), Some("stuck"));
        assert_eq!(f.notifier.sent().len(), 1);

        let again = f.sweeper.run_once(Utc::now()).await.unwrap();
        assert_eq!(again.recovered, 0);
        assert_eq!(f.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_sweep_shuts_down() {
        let f = fixture().await;
        let mut sweeper = f.sweeper.clone();
        sweeper.config.interval = std::time::Duration::from_millis(10);

        let handle = sweeper.spawn();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
    }
}
