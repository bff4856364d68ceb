//! Wallet storage
//!
//! [`WalletStore`] is the seam between the billing services and persistence.
//! Every method is atomic on its own; [`WalletStore::apply_session_credit`]
//! is the single transactional unit that acquires the per-session lock and
//! performs all wallet mutations behind it.

mod postgres;

#[cfg(any(test, feature = "test-util"))]
mod in_memory;

pub use postgres::PgWalletStore;

#[cfg(any(test, feature = "test-util"))]
pub use in_memory::InMemoryWalletStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    CheckoutLogEntry, Doctor, PricingOverride, PromoCode, RawPaymentLog, WalletPayment,
};

/// Wallet credit derived from one completed payment session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCredit {
    pub session_id: String,
    pub doctor_id: Uuid,
    pub plan_id: Option<String>,
    pub months_delta: i32,
    /// Major units
    pub amount: f64,
    /// Uppercase ISO code
    pub currency: String,
}

/// Referral bonus granted while applying a credit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferralReward {
    pub referrer_id: Uuid,
    pub referrer_access_expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreditOutcome {
    /// This call won the lock and applied the credit
    Credited {
        wallet_months: i32,
        referral: Option<ReferralReward>,
    },
    /// The lock already existed; nothing was changed
    AlreadyProcessed,
}

/// Lock with no matching wallet entry
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct OrphanedLock {
    pub session_id: String,
    pub doctor_id: Uuid,
    pub created_at: OffsetDateTime,
}

/// Latched referral with no reward entry on the referrer
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UnrewardedReferral {
    pub referred_doctor_id: Uuid,
    pub referrer_id: Uuid,
    pub referral_bonus_applied_at: Option<OffsetDateTime>,
}

/// Final state of a claimed webhook delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookResult {
    Success,
    Error,
}

impl WebhookResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookResult::Success => "success",
            WebhookResult::Error => "error",
        }
    }
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn get_doctor(&self, doctor_id: Uuid) -> BillingResult<Option<Doctor>>;

    /// The singleton override, or a disabled one when none is stored
    async fn get_pricing_override(&self) -> BillingResult<PricingOverride>;

    /// Case-insensitive lookup
    async fn find_promo_code(&self, code: &str) -> BillingResult<Option<PromoCode>>;

    async fn append_checkout_log(&self, entry: &CheckoutLogEntry) -> BillingResult<()>;

    /// Create the session lock and, only if it did not exist, credit the
    /// wallet, append the ledger entry and apply any due referral bonus.
    /// Either everything is persisted or nothing is.
    async fn apply_session_credit(
        &self,
        credit: &SessionCredit,
        now: OffsetDateTime,
    ) -> BillingResult<CreditOutcome>;

    /// Newest first
    async fn list_wallet_payments(
        &self,
        doctor_id: Uuid,
        limit: usize,
    ) -> BillingResult<Vec<WalletPayment>>;

    /// Newest first
    async fn list_payment_logs_by_doctor(
        &self,
        doctor_id: Uuid,
        limit: usize,
    ) -> BillingResult<Vec<RawPaymentLog>>;

    /// Case-insensitive on email, newest first
    async fn list_payment_logs_by_email(
        &self,
        email: &str,
        limit: usize,
    ) -> BillingResult<Vec<RawPaymentLog>>;

    async fn record_payment_log(&self, log: &RawPaymentLog) -> BillingResult<()>;

    /// Atomically claim a webhook delivery. Returns `false` when the event is
    /// already processed or in flight; an event that previously ended in
    /// error may be claimed again.
    async fn claim_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    /// Locks created before `created_before` with no `stripe_payment` entry
    async fn find_orphaned_locks(
        &self,
        created_before: OffsetDateTime,
    ) -> BillingResult<Vec<OrphanedLock>>;

    async fn find_unrewarded_referrals(&self) -> BillingResult<Vec<UnrewardedReferral>>;
}

/// Ledger row for a won session credit
pub(crate) fn session_payment_row(credit: &SessionCredit, now: OffsetDateTime) -> WalletPayment {
    WalletPayment {
        id: Uuid::new_v4(),
        doctor_id: credit.doctor_id,
        entry_type: crate::models::entry_type::STRIPE_PAYMENT.to_string(),
        source: "stripe".to_string(),
        status: "confirmed".to_string(),
        months_delta: credit.months_delta,
        amount: credit.amount.abs(),
        currency: credit.currency.to_uppercase(),
        reference_id: Some(credit.session_id.clone()),
        note: credit
            .plan_id
            .as_ref()
            .map(|plan| format!("Checkout payment for plan {plan}")),
        created_at: now,
    }
}

/// Ledger row for a referral reward credited to `referrer_id`
pub(crate) fn referral_reward_row(
    referrer_id: Uuid,
    referred_id: Uuid,
    now: OffsetDateTime,
) -> WalletPayment {
    WalletPayment {
        id: Uuid::new_v4(),
        doctor_id: referrer_id,
        entry_type: crate::models::entry_type::REFERRAL_REWARD.to_string(),
        source: "referral".to_string(),
        status: "credited".to_string(),
        months_delta: crate::referral::REFERRAL_BONUS_MONTHS,
        amount: 0.0,
        currency: "USD".to_string(),
        reference_id: Some(referred_id.to_string()),
        note: Some("Referral bonus".to_string()),
        created_at: now,
    }
}
