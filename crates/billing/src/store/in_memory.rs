//! In-memory wallet store for tests and local development.
//!
//! A single mutex guards all state, so every trait method is atomic. Seeding
//! and inspection helpers are inherent methods.

use async_trait::async_trait;
use std::collections::HashMap;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    referral_reward_row, session_payment_row, CreditOutcome, OrphanedLock, ReferralReward,
    SessionCredit, UnrewardedReferral, WalletStore, WebhookResult,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    entry_type, CheckoutLogEntry, Doctor, PricingOverride, PromoCode, RawPaymentLog,
    WalletPayment,
};
use crate::referral::{extend_access, referral_target, REFERRAL_BONUS_MONTHS};

#[derive(Debug)]
struct State {
    doctors: HashMap<Uuid, Doctor>,
    pricing_override: PricingOverride,
    promo_codes: HashMap<String, PromoCode>,
    checkout_logs: Vec<CheckoutLogEntry>,
    locks: HashMap<String, OrphanedLock>,
    wallet_payments: Vec<WalletPayment>,
    payment_logs: Vec<RawPaymentLog>,
    webhook_events: HashMap<String, String>,
}

#[derive(Debug)]
pub struct InMemoryWalletStore {
    state: Mutex<State>,
}

impl Default for InMemoryWalletStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWalletStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                doctors: HashMap::new(),
                pricing_override: PricingOverride::disabled(),
                promo_codes: HashMap::new(),
                checkout_logs: Vec::new(),
                locks: HashMap::new(),
                wallet_payments: Vec::new(),
                payment_logs: Vec::new(),
                webhook_events: HashMap::new(),
            }),
        }
    }

    pub async fn insert_doctor(&self, doctor: Doctor) {
        self.state.lock().await.doctors.insert(doctor.id, doctor);
    }

    pub async fn set_pricing_override(&self, pricing_override: PricingOverride) {
        self.state.lock().await.pricing_override = pricing_override;
    }

    pub async fn insert_promo_code(&self, mut promo: PromoCode) {
        promo.code = PromoCode::normalize(&promo.code);
        self.state
            .lock()
            .await
            .promo_codes
            .insert(promo.code.clone(), promo);
    }

    /// Insert a bare lock, as a crash between lock and credit would leave
    pub async fn insert_lock(&self, session_id: &str, doctor_id: Uuid, created_at: OffsetDateTime) {
        self.state.lock().await.locks.insert(
            session_id.to_string(),
            OrphanedLock {
                session_id: session_id.to_string(),
                doctor_id,
                created_at,
            },
        );
    }

    pub async fn insert_wallet_payment(&self, row: WalletPayment) {
        self.state.lock().await.wallet_payments.push(row);
    }

    pub async fn doctor(&self, doctor_id: Uuid) -> Option<Doctor> {
        self.state.lock().await.doctors.get(&doctor_id).cloned()
    }

    pub async fn checkout_logs(&self) -> Vec<CheckoutLogEntry> {
        self.state.lock().await.checkout_logs.clone()
    }

    pub async fn wallet_payments(&self) -> Vec<WalletPayment> {
        self.state.lock().await.wallet_payments.clone()
    }

    pub async fn payment_logs(&self) -> Vec<RawPaymentLog> {
        self.state.lock().await.payment_logs.clone()
    }

    pub async fn lock_count(&self) -> usize {
        self.state.lock().await.locks.len()
    }

    pub async fn webhook_event_result(&self, event_id: &str) -> Option<String> {
        self.state.lock().await.webhook_events.get(event_id).cloned()
    }
}

fn newest_first<T>(
    rows: impl Iterator<Item = T>,
    created_at: fn(&T) -> OffsetDateTime,
    limit: usize,
) -> Vec<T> {
    let mut rows: Vec<T> = rows.collect();
    rows.sort_by_key(|r| std::cmp::Reverse(created_at(r)));
    rows.truncate(limit);
    rows
}

#[async_trait]
impl WalletStore for InMemoryWalletStore {
    async fn get_doctor(&self, doctor_id: Uuid) -> BillingResult<Option<Doctor>> {
        Ok(self.doctor(doctor_id).await)
    }

    async fn get_pricing_override(&self) -> BillingResult<PricingOverride> {
        Ok(self.state.lock().await.pricing_override.clone())
    }

    async fn find_promo_code(&self, code: &str) -> BillingResult<Option<PromoCode>> {
        Ok(self
            .state
            .lock()
            .await
            .promo_codes
            .get(&PromoCode::normalize(code))
            .cloned())
    }

    async fn append_checkout_log(&self, entry: &CheckoutLogEntry) -> BillingResult<()> {
        self.state.lock().await.checkout_logs.push(entry.clone());
        Ok(())
    }

    async fn apply_session_credit(
        &self,
        credit: &SessionCredit,
        now: OffsetDateTime,
    ) -> BillingResult<CreditOutcome> {
        let mut state = self.state.lock().await;

        if state.locks.contains_key(&credit.session_id) {
            return Ok(CreditOutcome::AlreadyProcessed);
        }

        // Validate before mutating anything so a failure leaves no lock behind
        let doctor = state
            .doctors
            .get(&credit.doctor_id)
            .cloned()
            .ok_or(BillingError::DoctorNotFound(credit.doctor_id))?;

        let referral_due = referral_target(&doctor, now)
            .filter(|referrer_id| state.doctors.contains_key(referrer_id));

        state.locks.insert(
            credit.session_id.clone(),
            OrphanedLock {
                session_id: credit.session_id.clone(),
                doctor_id: credit.doctor_id,
                created_at: now,
            },
        );

        let wallet_months = match state.doctors.get_mut(&credit.doctor_id) {
            Some(d) => {
                d.wallet_months += credit.months_delta;
                d.payment_done = true;
                if referral_due.is_some() {
                    d.referral_bonus_applied = true;
                    d.referral_bonus_applied_at = Some(now);
                }
                d.wallet_months
            }
            None => return Err(BillingError::DoctorNotFound(credit.doctor_id)),
        };
        state.wallet_payments.push(session_payment_row(credit, now));

        let mut referral = None;
        if let Some(referrer_id) = referral_due {
            if let Some(referrer) = state.doctors.get_mut(&referrer_id) {
                let expires_at =
                    extend_access(referrer.access_expires_at, REFERRAL_BONUS_MONTHS, now);
                referrer.wallet_months += REFERRAL_BONUS_MONTHS;
                referrer.access_expires_at = Some(expires_at);
                referral = Some(ReferralReward {
                    referrer_id,
                    referrer_access_expires_at: expires_at,
                });
            }
            state
                .wallet_payments
                .push(referral_reward_row(referrer_id, doctor.id, now));
        }

        Ok(CreditOutcome::Credited {
            wallet_months,
            referral,
        })
    }

    async fn list_wallet_payments(
        &self,
        doctor_id: Uuid,
        limit: usize,
    ) -> BillingResult<Vec<WalletPayment>> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .wallet_payments
                .iter()
                .filter(|p| p.doctor_id == doctor_id)
                .cloned(),
            |p| p.created_at,
            limit,
        ))
    }

    async fn list_payment_logs_by_doctor(
        &self,
        doctor_id: Uuid,
        limit: usize,
    ) -> BillingResult<Vec<RawPaymentLog>> {
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .payment_logs
                .iter()
                .filter(|l| l.doctor_id == Some(doctor_id))
                .cloned(),
            |l| l.created_at,
            limit,
        ))
    }

    async fn list_payment_logs_by_email(
        &self,
        email: &str,
        limit: usize,
    ) -> BillingResult<Vec<RawPaymentLog>> {
        let email = email.trim();
        let state = self.state.lock().await;
        Ok(newest_first(
            state
                .payment_logs
                .iter()
                .filter(|l| {
                    l.customer_email
                        .as_deref()
                        .is_some_and(|e| e.eq_ignore_ascii_case(email))
                })
                .cloned(),
            |l| l.created_at,
            limit,
        ))
    }

    async fn record_payment_log(&self, log: &RawPaymentLog) -> BillingResult<()> {
        self.state.lock().await.payment_logs.push(log.clone());
        Ok(())
    }

    async fn claim_webhook_event(&self, event_id: &str, _event_type: &str) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        match state.webhook_events.get(event_id).map(String::as_str) {
            None | Some("error") => {
                state
                    .webhook_events
                    .insert(event_id.to_string(), "processing".to_string());
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookResult,
        _error_message: Option<&str>,
    ) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .webhook_events
            .insert(event_id.to_string(), result.as_str().to_string());
        Ok(())
    }

    async fn find_orphaned_locks(
        &self,
        created_before: OffsetDateTime,
    ) -> BillingResult<Vec<OrphanedLock>> {
        let state = self.state.lock().await;
        let mut orphans: Vec<OrphanedLock> = state
            .locks
            .values()
            .filter(|lock| lock.created_at < created_before)
            .filter(|lock| {
                !state.wallet_payments.iter().any(|p| {
                    p.entry_type == entry_type::STRIPE_PAYMENT
                        && p.reference_id.as_deref() == Some(lock.session_id.as_str())
                })
            })
            .cloned()
            .collect();
        orphans.sort_by_key(|lock| lock.created_at);
        Ok(orphans)
    }

    async fn find_unrewarded_referrals(&self) -> BillingResult<Vec<UnrewardedReferral>> {
        let state = self.state.lock().await;
        Ok(state
            .doctors
            .values()
            .filter(|d| d.referral_bonus_applied)
            .filter_map(|d| {
                let referrer_id = d.referred_by_doctor_id?;
                let reference = d.id.to_string();
                let rewarded = state.wallet_payments.iter().any(|p| {
                    p.doctor_id == referrer_id
                        && p.entry_type == entry_type::REFERRAL_REWARD
                        && p.reference_id.as_deref() == Some(reference.as_str())
                });
                (!rewarded).then_some(UnrewardedReferral {
                    referred_doctor_id: d.id,
                    referrer_id,
                    referral_bonus_applied_at: d.referral_bonus_applied_at,
                })
            })
            .collect())
    }
}
