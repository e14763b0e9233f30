//! Plan catalog.
//!
//! Plans describe what a payment buys: a free tier, a time-boxed
//! subscription, or a single pay-per-use action. Plans referenced by a
//! subscription or transaction are never deleted; they are deactivated with
//! `is_active = false` instead.
//!
//! ```rust,ignore
//! use tollgate::billing::{PaymentPlan, PlanType, BillingCycle};
//!
//! let plan = PaymentPlan::new("basic-monthly", "Basic Subscription", PlanType::Subscription)
//!     .price(5000)
//!     .billing_cycle(BillingCycle::Monthly)
//!     .features(["priority_support", "advanced_search_filters"])
//!     .unlimited("monthly_jobs");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use super::error::{BillingError, Result};
use super::policy::BillingPolicy;
use super::storage::BillingStore;

/// Kind of plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    Free,
    Subscription,
    PayPerUse,
}

impl PlanType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Subscription => "subscription",
            Self::PayPerUse => "pay_per_use",
        }
    }
}

impl std::str::FromStr for PlanType {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(Self::Free),
            "subscription" => Ok(Self::Subscription),
            "pay_per_use" => Ok(Self::PayPerUse),
            other => Err(BillingError::validation(format!("unknown plan type '{}'", other))),
        }
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How long one payment of a subscription plan lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        }
    }

    /// End of one period starting at `from`.
    ///
    /// Uses calendar months, so Jan 31 + 1 month clamps to the end of February.
    #[must_use]
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let months = match self {
            Self::Monthly => Months::new(1),
            Self::Yearly => Months::new(12),
        };
        from.checked_add_months(months).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "monthly" => Ok(Self::Monthly),
            "yearly" => Ok(Self::Yearly),
            other => Err(BillingError::validation(format!(
                "unknown billing cycle '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Usage limits keyed by resource name.
///
/// A `None` value means unlimited. Resources without an entry are also
/// unlimited.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanLimits {
    limits: HashMap<String, Option<u64>>,
}

impl PlanLimits {
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Parse limits from a JSON object.
    ///
    /// `null` values become unlimited entries; non-numeric values are skipped.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        let Some(obj) = json.as_object() else {
            return Self::default();
        };

        let limits = obj
            .iter()
            .filter_map(|(key, value)| {
                if value.is_null() {
                    Some((key.clone(), None))
                } else {
                    value
                        .as_u64()
                        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                        .map(|n| (key.clone(), Some(n)))
                }
            })
            .collect();

        Self { limits }
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.limits
                .iter()
                .map(|(k, v)| (k.clone(), v.map_or(serde_json::Value::Null, Into::into)))
                .collect(),
        )
    }

    pub fn set(&mut self, resource: impl Into<String>, max: Option<u64>) {
        self.limits.insert(resource.into(), max);
    }

    /// Get the limit for a resource (`None` = unlimited).
    #[must_use]
    pub fn get(&self, resource: &str) -> Option<u64> {
        self.limits.get(resource).copied().flatten()
    }

    /// Check if a resource usage is within limits.
    #[must_use]
    pub fn check(&self, resource: &str, current: u64) -> LimitCheckResult {
        match self.get(resource) {
            None => LimitCheckResult::Unlimited,
            Some(max) if current < max => LimitCheckResult::WithinLimit { current, max },
            Some(max) => LimitCheckResult::AtLimit { current, max },
        }
    }
}

/// Result of checking a resource limit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimitCheckResult {
    Unlimited,
    WithinLimit { current: u64, max: u64 },
    AtLimit { current: u64, max: u64 },
}

impl LimitCheckResult {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Unlimited | Self::WithinLimit { .. })
    }
}

/// A billing plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentPlan {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub plan_type: PlanType,
    /// Price in minor units of `currency` (TZS has none, so whole shillings).
    pub price: i64,
    pub currency: String,
    /// Only meaningful for subscription plans.
    pub billing_cycle: Option<BillingCycle>,
    pub features: HashSet<String>,
    pub limits: PlanLimits,
    pub is_active: bool,
    pub is_default: bool,
    pub sort_order: i32,
}

impl PaymentPlan {
    /// Start a plan definition with sensible defaults (free, active, TZS).
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, plan_type: PlanType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            plan_type,
            price: 0,
            currency: "TZS".to_string(),
            billing_cycle: None,
            features: HashSet::new(),
            limits: PlanLimits::default(),
            is_active: true,
            is_default: false,
            sort_order: 0,
        }
    }

    #[must_use]
    pub fn price(mut self, price: i64) -> Self {
        self.price = price;
        self
    }

    #[must_use]
    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    #[must_use]
    pub fn billing_cycle(mut self, cycle: BillingCycle) -> Self {
        self.billing_cycle = Some(cycle);
        self
    }

    #[must_use]
    pub fn features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features.extend(features.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn limit(mut self, resource: &str, max: u64) -> Self {
        self.limits.set(resource, Some(max));
        self
    }

    #[must_use]
    pub fn unlimited(mut self, resource: &str) -> Self {
        self.limits.set(resource, None);
        self
    }

    #[must_use]
    pub fn default_plan(mut self) -> Self {
        self.is_default = true;
        self
    }

    #[must_use]
    pub fn sort_order(mut self, order: i32) -> Self {
        self.sort_order = order;
        self
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.plan_type == PlanType::Free
    }

    #[must_use]
    pub fn is_subscription(&self) -> bool {
        self.plan_type == PlanType::Subscription
    }

    #[must_use]
    pub fn is_pay_per_use(&self) -> bool {
        self.plan_type == PlanType::PayPerUse
    }

    #[must_use]
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    #[must_use]
    pub fn check_limit(&self, resource: &str, current: u64) -> LimitCheckResult {
        self.limits.check(resource, current)
    }

    /// Validate the plan before it is stored.
    pub fn validate(&self) -> Result<()> {
        super::validation::validate_plan_id(&self.id)?;
        if self.name.trim().is_empty() {
            return Err(BillingError::validation("plan name must not be empty"));
        }
        if self.price < 0 {
            return Err(BillingError::validation("plan price must not be negative"));
        }
        if self.is_subscription() && self.billing_cycle.is_none() {
            return Err(BillingError::validation(format!(
                "subscription plan '{}' needs a billing cycle",
                self.id
            )));
        }
        if self.is_free() && self.price != 0 {
            return Err(BillingError::validation("free plans must have price 0"));
        }
        Ok(())
    }
}

/// The plans a fresh marketplace starts with.
#[must_use]
pub fn default_catalog() -> Vec<PaymentPlan> {
    let unlimited = ["monthly_jobs", "monthly_applications", "monthly_messages"];
    let with_unlimited = |mut plan: PaymentPlan| {
        for resource in unlimited {
            plan = plan.unlimited(resource);
        }
        plan
    };

    vec![
        with_unlimited(
            PaymentPlan::new("free", "Free Plan", PlanType::Free)
                .description("Unlimited access to all platform features")
                .features([
                    "unlimited_job_posting",
                    "unlimited_job_applications",
                    "unlimited_fundi_browsing",
                    "unlimited_messaging",
                    "basic_support",
                ])
                .default_plan()
                .sort_order(0),
        ),
        with_unlimited(
            PaymentPlan::new("basic-monthly", "Basic Subscription", PlanType::Subscription)
                .description("Monthly subscription with enhanced features")
                .price(5000)
                .billing_cycle(BillingCycle::Monthly)
                .features([
                    "unlimited_job_posting",
                    "unlimited_job_applications",
                    "priority_support",
                    "advanced_search_filters",
                    "priority_job_listing",
                ])
                .default_plan()
                .sort_order(1),
        ),
        with_unlimited(
            PaymentPlan::new("premium-yearly", "Premium Subscription", PlanType::Subscription)
                .description("Yearly subscription with premium features")
                .price(50000)
                .billing_cycle(BillingCycle::Yearly)
                .features([
                    "unlimited_job_posting",
                    "unlimited_job_applications",
                    "premium_support",
                    "advanced_search_filters",
                    "detailed_analytics",
                    "api_access",
                ])
                .default_plan()
                .sort_order(2),
        ),
        PaymentPlan::new("pay-per-job", "Pay Per Job", PlanType::PayPerUse)
            .description("Pay only when posting a job")
            .price(1000)
            .features(["job_posting", "fundi_browsing", "messaging"])
            .sort_order(3),
        PaymentPlan::new("pay-per-application", "Pay Per Application", PlanType::PayPerUse)
            .description("Pay only when applying to jobs")
            .price(200)
            .features(["job_applications", "fundi_browsing", "messaging"])
            .sort_order(4),
    ]
}

/// Read-mostly access to stored plans.
#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn BillingStore>,
}

impl PlanCatalog {
    #[must_use]
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Get a plan by id, active or not.
    pub async fn get(&self, plan_id: &str) -> Result<PaymentPlan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound {
                plan_id: plan_id.to_string(),
            })
    }

    pub async fn list_active(&self) -> Result<Vec<PaymentPlan>> {
        self.store.list_plans().await
    }

    /// Every plan, deactivated ones included.
    pub async fn list_all(&self) -> Result<Vec<PaymentPlan>> {
        self.store.list_all_plans().await
    }

    pub async fn list_by_type(&self, plan_type: PlanType) -> Result<Vec<PaymentPlan>> {
        Ok(self
            .store
            .list_plans()
            .await?
            .into_iter()
            .filter(|p| p.plan_type == plan_type)
            .collect())
    }

    /// The active default free plan, if one is configured.
    pub async fn default_free_plan(&self) -> Result<Option<PaymentPlan>> {
        Ok(self
            .list_by_type(PlanType::Free)
            .await?
            .into_iter()
            .find(|p| p.is_default))
    }

    /// The active subscription plan sold for `cycle`.
    ///
    /// Prefers the plan flagged default; otherwise the first by sort order.
    pub async fn subscription_plan_for(&self, cycle: BillingCycle) -> Result<Option<PaymentPlan>> {
        let candidates: Vec<PaymentPlan> = self
            .list_by_type(PlanType::Subscription)
            .await?
            .into_iter()
            .filter(|p| p.billing_cycle == Some(cycle))
            .collect();

        let default = candidates.iter().find(|p| p.is_default).cloned();
        Ok(default.or_else(|| candidates.into_iter().next()))
    }

    /// The subscription plan `policy` sells, at the policy's subscription fee.
    ///
    /// The fee is admin-controlled and overrides the catalog price of the
    /// plan it is charged for, so the amount quoted on a denial is the amount
    /// initiation accepts.
    pub async fn subscription_offer(&self, policy: &BillingPolicy) -> Result<Option<PaymentPlan>> {
        Ok(self
            .subscription_plan_for(policy.subscription_period)
            .await?
            .map(|plan| plan.price(policy.subscription_fee)))
    }

    /// Soft-activate or deactivate a plan.
    pub async fn set_active(&self, plan_id: &str, is_active: bool) -> Result<PaymentPlan> {
        let mut plan = self.get(plan_id).await?;
        self.store.set_plan_active(plan_id, is_active).await?;
        plan.is_active = is_active;
        tracing::info!(
            target: "tollgate::billing::plans",
            plan_id = %plan_id,
            is_active,
            "Plan activity changed"
        );
        Ok(plan)
    }

    /// Insert plans that do not exist yet. Existing plans are left untouched.
    pub async fn seed(&self, plans: Vec<PaymentPlan>) -> Result<usize> {
        let mut created = 0;
        for plan in plans {
            plan.validate()?;
            if self.store.get_plan(&plan.id).await?.is_none() {
                self.store.create_plan(&plan).await?;
                created += 1;
            }
        }
        Ok(created)
    }
}
