//! Billing policy: the admin-controlled singleton deciding what is charged.
//!
//! The policy is always read as one snapshot per decision and written as a
//! whole row, guarded by a version number so two concurrent admin edits
//! cannot interleave field by field.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::audit::{BillingAuditEvent, BillingAuditLogger};
use super::error::{BillingError, Result};
use super::plans::BillingCycle;
use super::storage::BillingStore;

/// How many times an admin update is retried after losing a version race.
const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Platform billing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    Free,
    SubscriptionRequired,
    PayPerJob,
    PayPerApplication,
    /// Subscription and per-action fees are switched on individually by flag.
    Hybrid,
}

impl BillingMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::SubscriptionRequired => "subscription_required",
            Self::PayPerJob => "pay_per_job",
            Self::PayPerApplication => "pay_per_application",
            Self::Hybrid => "hybrid",
        }
    }
}

impl std::str::FromStr for BillingMode {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(Self::Free),
            "subscription_required" => Ok(Self::SubscriptionRequired),
            "pay_per_job" => Ok(Self::PayPerJob),
            "pay_per_application" => Ok(Self::PayPerApplication),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(BillingError::validation(format!("unknown billing mode '{}'", other))),
        }
    }
}

impl std::fmt::Display for BillingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The billing policy snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPolicy {
    /// Master switch. When off, every action is free regardless of `mode`.
    pub payments_enabled: bool,
    pub mode: BillingMode,
    pub subscription_enabled: bool,
    pub job_posting_fee_enabled: bool,
    pub job_application_fee_enabled: bool,
    pub subscription_fee: i64,
    pub subscription_period: BillingCycle,
    pub job_posting_fee: i64,
    pub application_fee: i64,
    pub premium_profile_fee: i64,
    pub featured_job_fee: i64,
    pub platform_commission_percentage: u8,
    pub currency: String,
    /// Incremented on every write.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            payments_enabled: false,
            mode: BillingMode::Free,
            subscription_enabled: false,
            job_posting_fee_enabled: false,
            job_application_fee_enabled: false,
            subscription_fee: 5000,
            subscription_period: BillingCycle::Monthly,
            job_posting_fee: 1000,
            application_fee: 200,
            premium_profile_fee: 500,
            featured_job_fee: 2000,
            platform_commission_percentage: 10,
            currency: "TZS".to_string(),
            version: 0,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl BillingPolicy {
    /// A subscription is required before gated actions.
    #[must_use]
    pub fn requires_subscription(&self) -> bool {
        self.payments_enabled
            && match self.mode {
                BillingMode::SubscriptionRequired => true,
                BillingMode::Hybrid => self.subscription_enabled,
                _ => false,
            }
    }

    /// Posting a job carries a per-action fee.
    #[must_use]
    pub fn requires_job_posting_fee(&self) -> bool {
        self.payments_enabled
            && match self.mode {
                BillingMode::PayPerJob => true,
                BillingMode::Hybrid => self.job_posting_fee_enabled,
                _ => false,
            }
    }

    /// Applying to a job carries a per-action fee.
    #[must_use]
    pub fn requires_application_fee(&self) -> bool {
        self.payments_enabled
            && match self.mode {
                BillingMode::PayPerApplication => true,
                BillingMode::Hybrid => self.job_application_fee_enabled,
                _ => false,
            }
    }

    /// Nothing is charged for anything.
    #[must_use]
    pub fn is_free_mode(&self) -> bool {
        !self.payments_enabled
            || self.mode == BillingMode::Free
            || !(self.requires_subscription()
                || self.requires_job_posting_fee()
                || self.requires_application_fee())
    }

    fn validate(&self) -> Result<()> {
        let fees = [
            ("subscription_fee", self.subscription_fee),
            ("job_posting_fee", self.job_posting_fee),
            ("application_fee", self.application_fee),
            ("premium_profile_fee", self.premium_profile_fee),
            ("featured_job_fee", self.featured_job_fee),
        ];
        for (name, fee) in fees {
            if fee < 0 {
                return Err(BillingError::validation(format!("{} must not be negative", name)));
            }
        }
        if self.platform_commission_percentage > 100 {
            return Err(BillingError::validation(
                "platform_commission_percentage must be between 0 and 100",
            ));
        }
        super::validation::validate_currency(&self.currency)
    }
}

/// Partial admin update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyUpdate {
    pub payments_enabled: Option<bool>,
    pub mode: Option<BillingMode>,
    pub subscription_enabled: Option<bool>,
    pub job_posting_fee_enabled: Option<bool>,
    pub job_application_fee_enabled: Option<bool>,
    pub subscription_fee: Option<i64>,
    pub subscription_period: Option<BillingCycle>,
    pub job_posting_fee: Option<i64>,
    pub application_fee: Option<i64>,
    pub premium_profile_fee: Option<i64>,
    pub featured_job_fee: Option<i64>,
    pub platform_commission_percentage: Option<u8>,
}

impl PolicyUpdate {
    fn apply_to(&self, policy: &mut BillingPolicy) {
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                $(if let Some(value) = self.$field { policy.$field = value; })*
            };
        }
        merge!(
            payments_enabled,
            mode,
            subscription_enabled,
            job_posting_fee_enabled,
            job_application_fee_enabled,
            subscription_fee,
            subscription_period,
            job_posting_fee,
            application_fee,
            premium_profile_fee,
            featured_job_fee,
            platform_commission_percentage,
        );
    }
}

/// Admin-facing policy operations.
#[derive(Clone)]
pub struct PolicyService {
    store: Arc<dyn BillingStore>,
    audit: Arc<dyn BillingAuditLogger>,
}

impl PolicyService {
    #[must_use]
    pub fn new(store: Arc<dyn BillingStore>, audit: Arc<dyn BillingAuditLogger>) -> Self {
        Self { store, audit }
    }

    /// The currently committed policy.
    pub async fn current(&self) -> Result<BillingPolicy> {
        self.store.get_policy().await
    }

    /// Apply a partial update atomically.
    pub async fn update(&self, update: &PolicyUpdate, actor: &str) -> Result<BillingPolicy> {
        self.replace_with(actor, |policy| update.apply_to(policy)).await
    }

    /// Restore the defaults: payments off, free mode, stock fee schedule.
    pub async fn reset_to_defaults(&self, actor: &str) -> Result<BillingPolicy> {
        self.replace_with(actor, |policy| {
            let version = policy.version;
            *policy = BillingPolicy {
                version,
                ..BillingPolicy::default()
            };
        })
        .await
    }

    async fn replace_with<F>(&self, actor: &str, change: F) -> Result<BillingPolicy>
    where
        F: Fn(&mut BillingPolicy),
    {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = self.store.get_policy().await?;
            let mut next = current.clone();
            change(&mut next);
            next.validate()?;
            next.version = current.version + 1;
            next.updated_at = Utc::now();

            if self.store.compare_and_save_policy(&next, current.version).await? {
                self.audit.log(BillingAuditEvent::PolicyUpdated {
                    actor: actor.to_string(),
                    mode: next.mode,
                    payments_enabled: next.payments_enabled,
                    version: next.version,
                });
                return Ok(next);
            }

            tracing::debug!(
                target: "tollgate::billing::policy",
                expected_version = current.version,
                "Policy changed concurrently, retrying update"
            );
        }

        Err(BillingError::Internal {
            message: "billing policy update kept losing to concurrent writers".to_string(),
        })
    }
}
