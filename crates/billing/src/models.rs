//! Wallet domain records
//!
//! Row shapes shared by the pricing resolver, the confirmation processor and
//! the ledger merger. The Postgres store maps these 1:1 onto tables; the
//! in-memory store keeps them in maps.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// A tenant (doctor) and their prepaid wallet
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Doctor {
    pub id: Uuid,
    pub email: String,
    pub wallet_months: i32,
    pub access_expires_at: Option<OffsetDateTime>,
    /// Has this tenant ever completed a payment
    pub payment_done: bool,
    /// Admin-granted individual discount, 0..=100
    pub admin_stripe_discount_percent: i32,
    pub referred_by_doctor_id: Option<Uuid>,
    pub referral_eligible_at: Option<OffsetDateTime>,
    /// One-shot latch, flips false -> true at most once
    pub referral_bonus_applied: bool,
    pub referral_bonus_applied_at: Option<OffsetDateTime>,
}

impl Doctor {
    /// A tenant is "new" until it has banked months or paid at least once
    pub fn is_new_customer(&self) -> bool {
        self.wallet_months == 0 && !self.payment_done
    }

    /// Case-insensitive ownership check against a verified identity email
    pub fn owned_by(&self, email: &str) -> bool {
        self.email.trim().eq_ignore_ascii_case(email.trim())
    }

    /// Minimal record used by tests and seed data
    pub fn new(id: Uuid, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            wallet_months: 0,
            access_expires_at: None,
            payment_done: false,
            admin_stripe_discount_percent: 0,
            referred_by_doctor_id: None,
            referral_eligible_at: None,
            referral_bonus_applied: false,
            referral_bonus_applied_at: None,
        }
    }
}

/// Which tenants a pricing override applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingScope {
    NewCustomers,
    AllCustomers,
}

impl PricingScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingScope::NewCustomers => "new_customers",
            PricingScope::AllCustomers => "all_customers",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new_customers" => Some(PricingScope::NewCustomers),
            "all_customers" => Some(PricingScope::AllCustomers),
            _ => None,
        }
    }

    pub fn matches(&self, doctor: &Doctor) -> bool {
        match self {
            PricingScope::AllCustomers => true,
            PricingScope::NewCustomers => doctor.is_new_customer(),
        }
    }
}

/// Per-currency override amounts in minor units
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideAmounts {
    pub monthly: Option<i64>,
    pub annual: Option<i64>,
}

/// Singleton pricing override
#[derive(Debug, Clone, PartialEq)]
pub struct PricingOverride {
    pub enabled: bool,
    pub applies_to: PricingScope,
    /// Keyed by uppercase ISO currency code
    pub amounts: HashMap<String, OverrideAmounts>,
}

impl PricingOverride {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            applies_to: PricingScope::AllCustomers,
            amounts: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PromoCode {
    /// Stored uppercase
    pub code: String,
    pub percent_off: i32,
    pub is_active: bool,
    pub valid_from: Option<OffsetDateTime>,
    pub valid_until: Option<OffsetDateTime>,
    pub max_redemptions: Option<i32>,
    pub redemption_count: i32,
}

impl PromoCode {
    pub fn normalize(code: &str) -> String {
        code.trim().to_uppercase()
    }

    /// Whether the code may be redeemed at `now`. An unusable code is not an
    /// error, it just contributes no discount.
    pub fn is_usable_at(&self, now: OffsetDateTime) -> bool {
        if !self.is_active {
            return false;
        }
        if self.valid_from.is_some_and(|from| now < from) {
            return false;
        }
        if self.valid_until.is_some_and(|until| now > until) {
            return false;
        }
        match self.max_redemptions {
            Some(max) => self.redemption_count < max,
            None => true,
        }
    }
}

/// Append-only audit of a pricing decision taken at checkout
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutLogEntry {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub user_uid: String,
    pub plan_id: String,
    pub session_id: String,
    pub currency: String,
    pub original_amount: i64,
    pub discounted_amount: i64,
    pub applied_discount_source: String,
    pub promo_code: Option<String>,
    pub promo_applied: bool,
    pub promo_validated: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A wallet-native ledger row as persisted
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct WalletPayment {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub entry_type: String,
    pub source: String,
    pub status: String,
    pub months_delta: i32,
    /// Major units
    pub amount: f64,
    pub currency: String,
    pub reference_id: Option<String>,
    pub note: Option<String>,
    pub created_at: OffsetDateTime,
}

/// A processor-native raw log row as recorded from webhooks
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct RawPaymentLog {
    pub id: Uuid,
    pub doctor_id: Option<Uuid>,
    pub customer_email: Option<String>,
    pub entry_type: Option<String>,
    pub session_id: Option<String>,
    pub invoice_id: Option<String>,
    pub payment_intent_id: Option<String>,
    /// Minor units, may be negative or missing in raw data
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub billing_interval: Option<String>,
    pub status: Option<String>,
    pub stripe_event_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Ledger entry types
pub mod entry_type {
    pub const STRIPE_PAYMENT: &str = "stripe_payment";
    pub const REFERRAL_REWARD: &str = "referral_reward";
    pub const MANUAL_ADJUSTMENT: &str = "manual_adjustment";
}
