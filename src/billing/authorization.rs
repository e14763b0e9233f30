//! Authorization engine.
//!
//! Decides whether a user may perform a monetizable action under the current
//! billing policy, and what they must pay first if not. The policy is read
//! once per decision, so admin changes apply to the very next call.
//!
//! Precedence, first match wins:
//!
//! 1. Free mode (or payments switched off): allowed, no fee.
//! 2. A per-action fee applies to this action: allowed, fee required.
//! 3. A subscription is required: allowed if the user holds an active one,
//!    otherwise denied with the subscription fee.
//! 4. Allowed, no fee.
//!
//! Rule 2 ahead of rule 3 means a hybrid policy never charges both the
//! action fee and the subscription for the same action.

use serde::{Deserialize, Serialize};

use super::error::{BillingError, Result};
use super::plans::PlanCatalog;
use super::policy::{BillingMode, BillingPolicy, PolicyService};
use super::subscription::{Subscription, SubscriptionLedger};
use super::transaction::TransactionType;
use super::validation::validate_user_id;

/// A monetizable action.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BillableAction {
    PostJob,
    ApplyToJob,
    /// Anything else. Never fee-gated by the per-action rules.
    Other(String),
}

impl BillableAction {
    pub fn parse(action: &str) -> Self {
        match action.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "post_job" | "job_posting" | "create_job" => Self::PostJob,
            "apply_job" | "apply_to_job" | "job_application" | "apply" => Self::ApplyToJob,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::PostJob => "post_job",
            Self::ApplyToJob => "apply_job",
            Self::Other(name) => name,
        }
    }
}

/// The engine's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub fee_required: bool,
    pub amount: i64,
    pub currency: String,
    pub plan_id: Option<String>,
    /// Transaction type the caller should create to pay the fee.
    pub payment_type: Option<TransactionType>,
    pub reason: String,
}

impl Decision {
    fn free(policy: &BillingPolicy, reason: &str) -> Self {
        Self {
            allowed: true,
            fee_required: false,
            amount: 0,
            currency: policy.currency.clone(),
            plan_id: None,
            payment_type: None,
            reason: reason.to_string(),
        }
    }

    fn action_fee(policy: &BillingPolicy, amount: i64, payment_type: TransactionType, reason: &str) -> Self {
        Self {
            allowed: true,
            fee_required: true,
            amount,
            currency: policy.currency.clone(),
            plan_id: None,
            payment_type: Some(payment_type),
            reason: reason.to_string(),
        }
    }

    /// Turn a denial into [`BillingError::InsufficientAuthorization`].
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            return Ok(self);
        }
        Err(BillingError::InsufficientAuthorization {
            reason: self.reason,
            amount: self.amount,
            currency: self.currency,
            plan_id: self.plan_id,
        })
    }
}

/// Fee table shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub currency: String,
    pub subscription_fee: i64,
    pub subscription_period: String,
    pub job_posting_fee: i64,
    pub application_fee: i64,
    pub premium_profile_fee: i64,
    pub featured_job_fee: i64,
}

/// What a user currently has to pay for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequirements {
    pub payments_enabled: bool,
    pub mode: BillingMode,
    pub is_free_mode: bool,
    pub requires_subscription: bool,
    pub requires_job_posting_fee: bool,
    pub requires_application_fee: bool,
    pub has_active_subscription: bool,
    pub subscription: Option<Subscription>,
    pub fees: FeeSchedule,
}

/// Authorization engine.
#[derive(Clone)]
pub struct AuthorizationEngine {
    policy: PolicyService,
    subscriptions: SubscriptionLedger,
    plans: PlanCatalog,
}

impl AuthorizationEngine {
    #[must_use]
    pub fn new(policy: PolicyService, subscriptions: SubscriptionLedger, plans: PlanCatalog) -> Self {
        Self {
            policy,
            subscriptions,
            plans,
        }
    }

    /// Decide whether `user_id` may perform `action`.
    pub async fn authorize(&self, user_id: &str, action: &BillableAction) -> Result<Decision> {
        validate_user_id(user_id)?;
        let policy = self.policy.current().await?;
        let decision = self.decide(&policy, user_id, action).await?;

        tracing::debug!(
            target: "tollgate::billing::authorization",
            user_id = %user_id,
            action = %action.as_str(),
            mode = %policy.mode,
            allowed = decision.allowed,
            fee_required = decision.fee_required,
            amount = decision.amount,
            "Authorization decided"
        );

        Ok(decision)
    }

    async fn decide(
        &self,
        policy: &BillingPolicy,
        user_id: &str,
        action: &BillableAction,
    ) -> Result<Decision> {
        if policy.is_free_mode() {
            return Ok(Decision::free(policy, "Platform is in free mode"));
        }

        match action {
            BillableAction::PostJob if policy.requires_job_posting_fee() => {
                return Ok(Decision::action_fee(
                    policy,
                    policy.job_posting_fee,
                    TransactionType::JobPosting,
                    "Job posting fee required",
                ));
            }
            BillableAction::ApplyToJob if policy.requires_application_fee() => {
                return Ok(Decision::action_fee(
                    policy,
                    policy.application_fee,
                    TransactionType::FundiApplication,
                    "Job application fee required",
                ));
            }
            _ => {}
        }

        if policy.requires_subscription() {
            if self.subscriptions.has_active(user_id).await? {
                return Ok(Decision::free(policy, "Active subscription"));
            }

            let offer = self.plans.subscription_offer(policy).await?;
            let amount = offer.as_ref().map_or(policy.subscription_fee, |plan| plan.price);

            return Ok(Decision {
                allowed: false,
                fee_required: true,
                amount,
                currency: policy.currency.clone(),
                plan_id: offer.map(|plan| plan.id),
                payment_type: Some(TransactionType::Subscription),
                reason: "Active subscription required".to_string(),
            });
        }

        Ok(Decision::free(policy, "No payment required for this action"))
    }

    /// Summarize the user's payment obligations under the current policy.
    pub async fn payment_requirements(&self, user_id: &str) -> Result<PaymentRequirements> {
        validate_user_id(user_id)?;
        let policy = self.policy.current().await?;
        let subscription = self.subscriptions.get_active(user_id).await?;

        Ok(PaymentRequirements {
            payments_enabled: policy.payments_enabled,
            mode: policy.mode,
            is_free_mode: policy.is_free_mode(),
            requires_subscription: policy.requires_subscription(),
            requires_job_posting_fee: policy.requires_job_posting_fee(),
            requires_application_fee: policy.requires_application_fee(),
            has_active_subscription: subscription.is_some(),
            subscription,
            fees: FeeSchedule {
                currency: policy.currency.clone(),
                subscription_fee: policy.subscription_fee,
                subscription_period: policy.subscription_period.to_string(),
                job_posting_fee: policy.job_posting_fee,
                application_fee: policy.application_fee,
                premium_profile_fee: policy.premium_profile_fee,
                featured_job_fee: policy.featured_job_fee,
            },
        })
    }
}
