//! Pricing resolution
//!
//! Pure function of plan catalog, tenant state, pricing override and promo
//! lookup result. No I/O happens here; the checkout service does the lookups
//! and hands the results in.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::models::{Doctor, PricingOverride, PromoCode};

/// Billing interval of a plan or payment session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
    /// One-off or unrecognised interval, credits no months
    Other,
}

impl BillingInterval {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "month" | "monthly" => BillingInterval::Month,
            "year" | "yearly" | "annual" => BillingInterval::Year,
            _ => BillingInterval::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
            BillingInterval::Other => "other",
        }
    }

    /// Wallet months credited for one paid period
    pub fn months_delta(&self) -> i32 {
        match self {
            BillingInterval::Month => 1,
            BillingInterval::Year => 12,
            BillingInterval::Other => 0,
        }
    }
}

/// Built-in plan definition
#[derive(Debug, Clone, Copy)]
pub struct Plan {
    pub id: &'static str,
    pub interval: BillingInterval,
    /// (uppercase currency, minor units)
    pub prices: &'static [(&'static str, i64)],
}

impl Plan {
    pub fn price_in(&self, currency: &str) -> Option<i64> {
        self.prices
            .iter()
            .find(|(c, _)| c.eq_ignore_ascii_case(currency))
            .map(|(_, amount)| *amount)
    }
}

pub const PLANS: &[Plan] = &[
    Plan {
        id: "monthly",
        interval: BillingInterval::Month,
        prices: &[("USD", 2000), ("EUR", 1900), ("GBP", 1700)],
    },
    Plan {
        id: "annual",
        interval: BillingInterval::Year,
        prices: &[("USD", 20000), ("EUR", 19000), ("GBP", 17000)],
    },
];

pub fn find_plan(plan_id: &str) -> Option<&'static Plan> {
    PLANS.iter().find(|p| p.id == plan_id)
}

/// Which discount won
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountSource {
    None,
    Individual,
    Promo,
}

impl DiscountSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountSource::None => "none",
            DiscountSource::Individual => "individual",
            DiscountSource::Promo => "promo",
        }
    }
}

/// Everything the resolver needs, already looked up
#[derive(Debug, Clone, Copy)]
pub struct PricingRequest<'a> {
    pub plan_id: &'a str,
    pub currency: &'a str,
    pub doctor: &'a Doctor,
    pub pricing_override: &'a PricingOverride,
    /// Code as typed by the caller, if any
    pub promo_code: Option<&'a str>,
    /// Result of the case-insensitive lookup of `promo_code`
    pub promo: Option<&'a PromoCode>,
    /// Caller-declared eligibility for the tenant's individual discount
    pub individual_discount_eligible: bool,
    pub now: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub plan_id: String,
    pub currency: String,
    pub interval: BillingInterval,
    pub original_amount: i64,
    pub discounted_amount: i64,
    pub discount_percent: i32,
    pub applied_discount_source: DiscountSource,
    pub promo_applied: bool,
    pub promo_validated: bool,
    /// Normalized code, only when the promo actually won
    pub applied_promo_code: Option<String>,
    pub override_applied: bool,
}

/// Resolve the amount to charge.
///
/// Fails only for an unknown plan/currency or a promo code that does not
/// exist. A code that exists but is expired, inactive or exhausted yields 0%.
pub fn resolve_price(req: PricingRequest<'_>) -> BillingResult<PriceQuote> {
    let plan = find_plan(req.plan_id)
        .ok_or_else(|| BillingError::InvalidPlan(req.plan_id.to_string()))?;
    let currency = req.currency.trim().to_uppercase();

    let builtin = plan.price_in(&currency).ok_or_else(|| {
        BillingError::InvalidPlan(format!("{} is not sold in {}", plan.id, currency))
    })?;

    let override_amount = override_amount(req.pricing_override, req.doctor, &currency, plan.interval);
    let base_amount = override_amount.unwrap_or(builtin);

    let supplied_code = req
        .promo_code
        .map(PromoCode::normalize)
        .filter(|c| !c.is_empty());

    let (promo_percent, promo_validated) = match (&supplied_code, req.promo) {
        (None, _) => (0, false),
        (Some(code), None) => return Err(BillingError::PromoCodeNotFound(code.clone())),
        (Some(_), Some(promo)) if promo.is_usable_at(req.now) => {
            (clamp_percent(promo.percent_off), true)
        }
        (Some(_), Some(_)) => (0, false),
    };

    let individual_percent = if req.individual_discount_eligible {
        clamp_percent(req.doctor.admin_stripe_discount_percent)
    } else {
        0
    };

    // Larger wins, never stacked. A tie goes to the individual discount.
    let (discount_percent, source) = if individual_percent == 0 && promo_percent == 0 {
        (0, DiscountSource::None)
    } else if promo_percent > individual_percent {
        (promo_percent, DiscountSource::Promo)
    } else {
        (individual_percent, DiscountSource::Individual)
    };

    let promo_applied = source == DiscountSource::Promo;

    Ok(PriceQuote {
        plan_id: plan.id.to_string(),
        currency,
        interval: plan.interval,
        original_amount: base_amount,
        discounted_amount: apply_percent(base_amount, discount_percent),
        discount_percent,
        applied_discount_source: source,
        promo_applied,
        promo_validated,
        applied_promo_code: if promo_applied { supplied_code } else { None },
        override_applied: override_amount.is_some(),
    })
}

fn override_amount(
    pricing_override: &PricingOverride,
    doctor: &Doctor,
    currency: &str,
    interval: BillingInterval,
) -> Option<i64> {
    if !pricing_override.enabled || !pricing_override.applies_to.matches(doctor) {
        return None;
    }
    let amounts = pricing_override.amounts.get(currency)?;
    match interval {
        BillingInterval::Month => amounts.monthly,
        BillingInterval::Year => amounts.annual,
        BillingInterval::Other => None,
    }
    .filter(|amount| *amount >= 0)
}

fn clamp_percent(percent: i32) -> i32 {
    percent.clamp(0, 100)
}

/// round(amount * (1 - percent/100)), half away from zero
pub fn apply_percent(amount: i64, percent: i32) -> i64 {
    let keep = i64::from(100 - clamp_percent(percent));
    (amount * keep + 50).div_euclid(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OverrideAmounts, PricingScope};
    use std::collections::HashMap;
    use time::macros::datetime;
    use uuid::Uuid;

    const NOW: OffsetDateTime = datetime!(2026-06-01 12:00 UTC);

    fn doctor(discount: i32) -> Doctor {
        let mut d = Doctor::new(Uuid::new_v4(), "doc@clinic.org");
        d.admin_stripe_discount_percent = discount;
        d
    }

    fn promo(pct: i32) -> PromoCode {
        PromoCode {
            code: "SAVE".into(),
            percent_off: pct,
            is_active: true,
            valid_from: None,
            valid_until: None,
            max_redemptions: None,
            redemption_count: 0,
        }
    }

    fn request<'a>(
        doctor: &'a Doctor,
        pricing_override: &'a PricingOverride,
        promo_code: Option<&'a str>,
        promo: Option<&'a PromoCode>,
    ) -> PricingRequest<'a> {
        PricingRequest {
            plan_id: "monthly",
            currency: "usd",
            doctor,
            pricing_override,
            promo_code,
            promo,
            individual_discount_eligible: true,
            now: NOW,
        }
    }

    #[test]
    fn test_promo_25_on_20_dollar_plan() {
        let d = doctor(0);
        let o = PricingOverride::disabled();
        let p = promo(25);
        let quote = resolve_price(request(&d, &o, Some("save"), Some(&p))).unwrap();

        assert_eq!(quote.original_amount, 2000);
        assert_eq!(quote.discounted_amount, 1500);
        assert_eq!(quote.applied_discount_source, DiscountSource::Promo);
        assert!(quote.promo_applied);
        assert!(quote.promo_validated);
        assert_eq!(quote.applied_promo_code.as_deref(), Some("SAVE"));
        assert_eq!(quote.currency, "USD");
    }

    #[test]
    fn test_individual_30_beats_promo_10() {
        let d = doctor(30);
        let o = PricingOverride::disabled();
        let p = promo(10);
        let quote = resolve_price(request(&d, &o, Some("SAVE"), Some(&p))).unwrap();

        assert_eq!(quote.applied_discount_source, DiscountSource::Individual);
        assert_eq!(quote.discounted_amount, 1400);
        assert!(!quote.promo_applied);
        assert!(quote.promo_validated);
        assert_eq!(quote.applied_promo_code, None);
    }

    #[test]
    fn test_promo_25_beats_individual_10() {
        let d = doctor(10);
        let o = PricingOverride::disabled();
        let p = promo(25);
        let quote = resolve_price(request(&d, &o, Some("SAVE"), Some(&p))).unwrap();

        assert_eq!(quote.applied_discount_source, DiscountSource::Promo);
        assert_eq!(quote.discounted_amount, 1500);
    }

    #[test]
    fn test_tie_goes_to_individual() {
        let d = doctor(20);
        let o = PricingOverride::disabled();
        let p = promo(20);
        let quote = resolve_price(request(&d, &o, Some("SAVE"), Some(&p))).unwrap();
        assert_eq!(quote.applied_discount_source, DiscountSource::Individual);
        assert_eq!(quote.discounted_amount, 1600);
    }

    #[test]
    fn test_no_discounts_reports_none() {
        let d = doctor(0);
        let o = PricingOverride::disabled();
        let quote = resolve_price(request(&d, &o, None, None)).unwrap();
        assert_eq!(quote.applied_discount_source, DiscountSource::None);
        assert_eq!(quote.discounted_amount, quote.original_amount);
        assert!(!quote.promo_validated);
    }

    #[test]
    fn test_ineligible_caller_gets_no_individual_discount() {
        let d = doctor(50);
        let o = PricingOverride::disabled();
        let mut req = request(&d, &o, None, None);
        req.individual_discount_eligible = false;
        let quote = resolve_price(req).unwrap();
        assert_eq!(quote.applied_discount_source, DiscountSource::None);
        assert_eq!(quote.discounted_amount, 2000);
    }

    #[test]
    fn test_unknown_promo_fails_whole_operation() {
        let d = doctor(30);
        let o = PricingOverride::disabled();
        let err = resolve_price(request(&d, &o, Some("nope"), None)).unwrap_err();
        assert!(matches!(err, BillingError::PromoCodeNotFound(code) if code == "NOPE"));
    }

    #[test]
    fn test_blank_promo_is_treated_as_absent() {
        let d = doctor(0);
        let o = PricingOverride::disabled();
        let quote = resolve_price(request(&d, &o, Some("   "), None)).unwrap();
        assert_eq!(quote.applied_discount_source, DiscountSource::None);
    }

    #[test]
    fn test_expired_promo_contributes_zero() {
        let d = doctor(0);
        let o = PricingOverride::disabled();
        let mut p = promo(50);
        p.valid_until = Some(datetime!(2026-01-01 0:00 UTC));
        let quote = resolve_price(request(&d, &o, Some("SAVE"), Some(&p))).unwrap();
        assert_eq!(quote.discounted_amount, 2000);
        assert!(!quote.promo_validated);
        assert!(!quote.promo_applied);
    }

    fn new_customer_override() -> PricingOverride {
        let mut amounts = HashMap::new();
        amounts.insert(
            "USD".to_string(),
            OverrideAmounts {
                monthly: Some(1000),
                annual: Some(9000),
            },
        );
        PricingOverride {
            enabled: true,
            applies_to: PricingScope::NewCustomers,
            amounts,
        }
    }

    #[test]
    fn test_new_customer_override_applies_to_new_tenant_only() {
        let o = new_customer_override();

        let fresh = doctor(0);
        let quote = resolve_price(request(&fresh, &o, None, None)).unwrap();
        assert_eq!(quote.original_amount, 1000);
        assert!(quote.override_applied);

        let mut existing = doctor(0);
        existing.payment_done = true;
        let quote = resolve_price(request(&existing, &o, None, None)).unwrap();
        assert_eq!(quote.original_amount, 2000);
        assert!(!quote.override_applied);
    }

    #[test]
    fn test_override_applies_before_discount() {
        let o = new_customer_override();
        let d = doctor(0);
        let p = promo(25);
        let quote = resolve_price(request(&d, &o, Some("SAVE"), Some(&p))).unwrap();
        assert_eq!(quote.original_amount, 1000);
        assert_eq!(quote.discounted_amount, 750);
    }

    #[test]
    fn test_disabled_override_and_missing_currency_fall_back() {
        let mut o = new_customer_override();
        o.enabled = false;
        let d = doctor(0);
        assert_eq!(
            resolve_price(request(&d, &o, None, None)).unwrap().original_amount,
            2000
        );

        let o = new_customer_override();
        let mut req = request(&d, &o, None, None);
        req.currency = "EUR";
        assert_eq!(resolve_price(req).unwrap().original_amount, 1900);
    }

    #[test]
    fn test_unknown_plan_rejected() {
        let d = doctor(0);
        let o = PricingOverride::disabled();
        let mut req = request(&d, &o, None, None);
        req.plan_id = "lifetime";
        assert!(matches!(
            resolve_price(req),
            Err(BillingError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_rounding_half_up() {
        assert_eq!(apply_percent(1999, 25), 1499);
        assert_eq!(apply_percent(1, 50), 1);
        assert_eq!(apply_percent(2000, 100), 0);
        assert_eq!(apply_percent(2000, 0), 2000);
    }

    #[test]
    fn test_interval_months() {
        assert_eq!(BillingInterval::parse("month").months_delta(), 1);
        assert_eq!(BillingInterval::parse("YEAR").months_delta(), 12);
        assert_eq!(BillingInterval::parse("week").months_delta(), 0);
    }
}
