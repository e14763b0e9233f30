//! Billing for a mobile-money marketplace.
//!
//! Gates monetizable actions behind an admin-configured policy and converges
//! payment state with an asynchronous gateway.
//!
//! # Components
//!
//! - [`PolicyService`] and [`PlanCatalog`]: what things cost
//! - [`AuthorizationEngine`]: may this user do this, and what must they pay
//! - [`TransactionLedger`]: one row per charge, forward-only status
//! - [`SubscriptionLedger`]: at most one active subscription per user
//! - [`GatewayAdapter`]: initiation and status polls against the gateway
//! - [`WebhookReconciler`] and [`PendingSweeper`]: apply gateway outcomes
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate::billing::{BillingServices, BillableAction, InMemoryBillingStore};
//!
//! let billing = BillingServices::builder(Arc::new(InMemoryBillingStore::new()))
//!     .gateway(Arc::new(zenopay_client))
//!     .webhook_secret(secret)
//!     .build();
//!
//! let decision = billing.authorization.authorize("user-1", &BillableAction::PostJob).await?;
//! if decision.fee_required {
//!     billing.payments.initiate(request).await?;
//! }
//! ```

pub mod audit;
pub mod authorization;
pub mod error;
pub mod gateway;
#[cfg(feature = "database")]
pub mod migration;
pub mod notify;
pub mod payments;
pub mod plans;
pub mod policy;
#[cfg(feature = "database")]
pub mod sea_orm_store;
pub mod settlement;
pub mod storage;
pub mod subscription;
pub mod sweep;
pub mod transaction;
pub mod validation;
pub mod webhook;

use std::sync::Arc;

use secrecy::SecretString;

// Plan exports
pub use plans::{
    default_catalog, BillingCycle, LimitCheckResult, PaymentPlan, PlanCatalog, PlanLimits, PlanType,
};

// Policy exports
pub use policy::{BillingMode, BillingPolicy, PolicyService, PolicyUpdate};

// Authorization exports
pub use authorization::{
    AuthorizationEngine, BillableAction, Decision, FeeSchedule, PaymentRequirements,
};

// Ledger exports
pub use subscription::{
    Activation, Subscription, SubscriptionLedger, SubscriptionStatus, SubscriptionTerm,
};
pub use transaction::{
    NewTransaction, Transaction, TransactionLedger, TransactionStatus, TransactionType,
    TransitionOutcome, TransitionRequest,
};

// Gateway exports
pub use gateway::{
    normalize_phone, BuyerDetails, GatewayAdapter, GatewayPaymentStatus, InitiationReceipt,
    LiveZenoPayClient, MobileChannel, OrderStatus, PaymentGateway, PaymentRequest,
    UnconfiguredGateway, ZenoPayConfig,
};

// Reconciliation exports
pub use settlement::{GatewayReport, Settlement, SettlementOutcome};
pub use sweep::{PendingSweeper, SweepConfig, SweepHandle, SweepReport};
pub use webhook::{WebhookOutcome, WebhookReconciler, WebhookRejection};

// Payment exports
pub use payments::{InitiatePayment, Initiation, PaymentLimits, PaymentService};

// Notification exports
pub use notify::{Notification, Notifier, TracingNotifier};

// Audit exports
pub use audit::{BillingAuditEvent, BillingAuditLogger, NoOpAuditLogger, TracingAuditLogger};

// Error exports
pub use error::BillingError;

// Storage exports
pub use storage::memory::InMemoryBillingStore;
pub use storage::{BillingStore, PlanStore, PolicyStore, SubscriptionStore, TransactionStore};

#[cfg(feature = "database")]
pub use sea_orm_store::SeaOrmBillingStore;

/// Every billing service, wired to one store.
#[derive(Clone)]
pub struct BillingServices {
    pub store: Arc<dyn BillingStore>,
    pub plans: PlanCatalog,
    pub policy: PolicyService,
    pub authorization: AuthorizationEngine,
    pub transactions: TransactionLedger,
    pub subscriptions: SubscriptionLedger,
    pub gateway: GatewayAdapter,
    pub settlement: Settlement,
    pub payments: PaymentService,
    pub webhooks: WebhookReconciler,
    pub sweeper: PendingSweeper,
}

impl BillingServices {
    #[must_use]
    pub fn builder(store: Arc<dyn BillingStore>) -> BillingServicesBuilder {
        BillingServicesBuilder::new(store)
    }
}

/// Builder for [`BillingServices`].
pub struct BillingServicesBuilder {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn BillingAuditLogger>,
    webhook_secret: SecretString,
    limits: PaymentLimits,
    sweep: SweepConfig,
}

impl BillingServicesBuilder {
    /// Defaults: no live gateway, log-only notifications and audit.
    #[must_use]
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self {
            store,
            gateway: Arc::new(UnconfiguredGateway),
            notifier: Arc::new(TracingNotifier),
            audit: Arc::new(TracingAuditLogger),
            webhook_secret: SecretString::from(String::new()),
            limits: PaymentLimits::default(),
            sweep: SweepConfig::default(),
        }
    }

    #[must_use]
    pub fn gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateway = gateway;
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn BillingAuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn webhook_secret(mut self, secret: SecretString) -> Self {
        self.webhook_secret = secret;
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: PaymentLimits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub fn sweep(mut self, sweep: SweepConfig) -> Self {
        self.sweep = sweep;
        self
    }

    #[must_use]
    pub fn build(self) -> BillingServices {
        let store = self.store;
        let audit = self.audit;

        let plans = PlanCatalog::new(store.clone());
        let policy = PolicyService::new(store.clone(), audit.clone());
        let transactions = TransactionLedger::new(store.clone(), audit.clone());
        let subscriptions = SubscriptionLedger::new(store.clone(), plans.clone(), audit.clone());
        let authorization =
            AuthorizationEngine::new(policy.clone(), subscriptions.clone(), plans.clone());
        let gateway = GatewayAdapter::new(self.gateway, transactions.clone());
        let settlement = Settlement::new(
            transactions.clone(),
            subscriptions.clone(),
            plans.clone(),
            self.notifier,
            audit.clone(),
        );
        let payments = PaymentService::new(
            transactions.clone(),
            gateway.clone(),
            settlement.clone(),
            subscriptions.clone(),
            plans.clone(),
            policy.clone(),
            self.limits,
        );
        let webhooks = WebhookReconciler::new(self.webhook_secret, settlement.clone(), audit);
        let sweeper = PendingSweeper::new(
            transactions.clone(),
            gateway.clone(),
            settlement.clone(),
            subscriptions.clone(),
            self.sweep,
        );

        BillingServices {
            store,
            plans,
            policy,
            authorization,
            transactions,
            subscriptions,
            gateway,
            settlement,
            payments,
            webhooks,
            sweeper,
        }
    }
}
