//! Postgres-backed wallet store

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    referral_reward_row, session_payment_row, CreditOutcome, OrphanedLock, ReferralReward,
    SessionCredit, UnrewardedReferral, WalletStore, WebhookResult,
};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    CheckoutLogEntry, Doctor, OverrideAmounts, PricingOverride, PricingScope, PromoCode,
    RawPaymentLog, WalletPayment,
};
use crate::referral::{extend_access, referral_target, REFERRAL_BONUS_MONTHS};

const DOCTOR_COLUMNS: &str = "id, email, wallet_months, access_expires_at, payment_done, \
     admin_stripe_discount_percent, referred_by_doctor_id, referral_eligible_at, \
     referral_bonus_applied, referral_bonus_applied_at";

const PAYMENT_LOG_COLUMNS: &str = "id, doctor_id, customer_email, entry_type, session_id, \
     invoice_id, payment_intent_id, amount_total, currency, billing_interval, status, \
     stripe_event_id, created_at";

#[derive(Clone)]
pub struct PgWalletStore {
    pool: PgPool,
}

impl PgWalletStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn insert_wallet_payment(
    conn: &mut sqlx::PgConnection,
    row: &WalletPayment,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO wallet_payments
            (id, doctor_id, entry_type, source, status, months_delta, amount, currency, reference_id, note, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(row.id)
    .bind(row.doctor_id)
    .bind(&row.entry_type)
    .bind(&row.source)
    .bind(&row.status)
    .bind(row.months_delta)
    .bind(row.amount)
    .bind(&row.currency)
    .bind(&row.reference_id)
    .bind(&row.note)
    .bind(row.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl WalletStore for PgWalletStore {
    async fn get_doctor(&self, doctor_id: Uuid) -> BillingResult<Option<Doctor>> {
        let doctor = sqlx::query_as::<_, Doctor>(&format!(
            "SELECT {DOCTOR_COLUMNS} FROM doctors WHERE id = $1"
        ))
        .bind(doctor_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doctor)
    }

    async fn get_pricing_override(&self) -> BillingResult<PricingOverride> {
        let row: Option<(bool, String, Json<HashMap<String, OverrideAmounts>>)> = sqlx::query_as(
            "SELECT enabled, applies_to, amounts FROM pricing_overrides WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some((enabled, applies_to, Json(amounts))) = row else {
            return Ok(PricingOverride::disabled());
        };

        let applies_to = PricingScope::parse(&applies_to).ok_or_else(|| {
            BillingError::Internal(format!("Unknown pricing scope: {applies_to}"))
        })?;

        let amounts = amounts
            .into_iter()
            .map(|(currency, amounts)| (currency.to_uppercase(), amounts))
            .collect();

        Ok(PricingOverride {
            enabled,
            applies_to,
            amounts,
        })
    }

    async fn find_promo_code(&self, code: &str) -> BillingResult<Option<PromoCode>> {
        let promo = sqlx::query_as::<_, PromoCode>(
            r#"
            SELECT code, percent_off, is_active, valid_from, valid_until, max_redemptions, redemption_count
            FROM promo_codes
            WHERE code = $1
            "#,
        )
        .bind(PromoCode::normalize(code))
        .fetch_optional(&self.pool)
        .await?;
        Ok(promo)
    }

    async fn append_checkout_log(&self, entry: &CheckoutLogEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO checkout_logs
                (id, doctor_id, user_uid, plan_id, session_id, currency, original_amount,
                 discounted_amount, applied_discount_source, promo_code, promo_applied,
                 promo_validated, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(entry.doctor_id)
        .bind(&entry.user_uid)
        .bind(&entry.plan_id)
        .bind(&entry.session_id)
        .bind(&entry.currency)
        .bind(entry.original_amount)
        .bind(entry.discounted_amount)
        .bind(&entry.applied_discount_source)
        .bind(&entry.promo_code)
        .bind(entry.promo_applied)
        .bind(entry.promo_validated)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_session_credit(
        &self,
        credit: &SessionCredit,
        now: OffsetDateTime,
    ) -> BillingResult<CreditOutcome> {
        let mut tx = self.pool.begin().await?;

        // Insert-unique is the only synchronization point. The row lock taken
        // here is held until commit, so a concurrent duplicate blocks and then
        // sees the conflict.
        let won: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO payment_session_locks (session_id, doctor_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (session_id) DO NOTHING
            RETURNING session_id
            "#,
        )
        .bind(&credit.session_id)
        .bind(credit.doctor_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if won.is_none() {
            tx.rollback().await?;
            return Ok(CreditOutcome::AlreadyProcessed);
        }

        let doctor = sqlx::query_as::<_, Doctor>(&format!(
            "SELECT {DOCTOR_COLUMNS} FROM doctors WHERE id = $1 FOR UPDATE"
        ))
        .bind(credit.doctor_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(BillingError::DoctorNotFound(credit.doctor_id))?;

        let (wallet_months,): (i32,) = sqlx::query_as(
            r#"
            UPDATE doctors
            SET wallet_months = wallet_months + $2,
                payment_done = TRUE,
                updated_at = NOW()
            WHERE id = $1
            RETURNING wallet_months
            "#,
        )
        .bind(credit.doctor_id)
        .bind(credit.months_delta)
        .fetch_one(&mut *tx)
        .await?;

        insert_wallet_payment(&mut *tx, &session_payment_row(credit, now)).await?;

        let mut referral = None;
        if let Some(referrer_id) = referral_target(&doctor, now) {
            let referrer: Option<(Option<OffsetDateTime>,)> = sqlx::query_as(
                "SELECT access_expires_at FROM doctors WHERE id = $1 FOR UPDATE",
            )
            .bind(referrer_id)
            .fetch_optional(&mut *tx)
            .await?;

            match referrer {
                Some((current_expiry,)) => {
                    let latched = sqlx::query(
                        r#"
                        UPDATE doctors
                        SET referral_bonus_applied = TRUE,
                            referral_bonus_applied_at = $2,
                            updated_at = NOW()
                        WHERE id = $1 AND referral_bonus_applied = FALSE
                        "#,
                    )
                    .bind(doctor.id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected()
                        == 1;

                    if latched {
                        let expires_at = extend_access(current_expiry, REFERRAL_BONUS_MONTHS, now);
                        sqlx::query(
                            r#"
                            UPDATE doctors
                            SET wallet_months = wallet_months + $2,
                                access_expires_at = $3,
                                updated_at = NOW()
                            WHERE id = $1
                            "#,
                        )
                        .bind(referrer_id)
                        .bind(REFERRAL_BONUS_MONTHS)
                        .bind(expires_at)
                        .execute(&mut *tx)
                        .await?;

                        insert_wallet_payment(
                            &mut *tx,
                            &referral_reward_row(referrer_id, doctor.id, now),
                        )
                        .await?;

                        referral = Some(ReferralReward {
                            referrer_id,
                            referrer_access_expires_at: expires_at,
                        });
                    }
                }
                None => {
                    tracing::warn!(
                        doctor_id = %doctor.id,
                        referrer_id = %referrer_id,
                        "Referrer no longer exists, referral bonus skipped"
                    );
                }
            }
        }

        tx.commit().await?;

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
        let rows = sqlx::query_as::<_, WalletPayment>(
            r#"
            SELECT id, doctor_id, entry_type, source, status, months_delta, amount, currency,
                   reference_id, note, created_at
            FROM wallet_payments
            WHERE doctor_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(doctor_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_payment_logs_by_doctor(
        &self,
        doctor_id: Uuid,
        limit: usize,
    ) -> BillingResult<Vec<RawPaymentLog>> {
        let rows = sqlx::query_as::<_, RawPaymentLog>(&format!(
            "SELECT {PAYMENT_LOG_COLUMNS} FROM stripe_payment_logs \
             WHERE doctor_id = $1 ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(doctor_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_payment_logs_by_email(
        &self,
        email: &str,
        limit: usize,
    ) -> BillingResult<Vec<RawPaymentLog>> {
        let rows = sqlx::query_as::<_, RawPaymentLog>(&format!(
            "SELECT {PAYMENT_LOG_COLUMNS} FROM stripe_payment_logs \
             WHERE LOWER(customer_email) = LOWER($1) ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(email.trim())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn record_payment_log(&self, log: &RawPaymentLog) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stripe_payment_logs
                (id, doctor_id, customer_email, entry_type, session_id, invoice_id,
                 payment_intent_id, amount_total, currency, billing_interval, status,
                 stripe_event_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(log.id)
        .bind(log.doctor_id)
        .bind(&log.customer_email)
        .bind(&log.entry_type)
        .bind(&log.session_id)
        .bind(&log.invoice_id)
        .bind(&log.payment_intent_id)
        .bind(log.amount_total)
        .bind(&log.currency)
        .bind(&log.billing_interval)
        .bind(&log.status)
        .bind(&log.stripe_event_id)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_webhook_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (stripe_event_id, event_type, processing_result)
            VALUES ($1, $2, 'processing')
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                error_message = NULL,
                updated_at = NOW()
            WHERE webhook_events.processing_result = 'error'
            RETURNING stripe_event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn complete_webhook_event(
        &self,
        event_id: &str,
        result: WebhookResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $1, error_message = $2, updated_at = NOW()
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_orphaned_locks(
        &self,
        created_before: OffsetDateTime,
    ) -> BillingResult<Vec<OrphanedLock>> {
        let rows = sqlx::query_as::<_, OrphanedLock>(
            r#"
            SELECT l.session_id, l.doctor_id, l.created_at
            FROM payment_session_locks l
            WHERE l.created_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM wallet_payments w
                  WHERE w.reference_id = l.session_id
                    AND w.entry_type = 'stripe_payment'
              )
            ORDER BY l.created_at
            LIMIT 500
            "#,
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_unrewarded_referrals(&self) -> BillingResult<Vec<UnrewardedReferral>> {
        let rows = sqlx::query_as::<_, UnrewardedReferral>(
            r#"
            SELECT d.id AS referred_doctor_id,
                   d.referred_by_doctor_id AS referrer_id,
                   d.referral_bonus_applied_at
            FROM doctors d
            WHERE d.referral_bonus_applied = TRUE
              AND d.referred_by_doctor_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM wallet_payments w
                  WHERE w.doctor_id = d.referred_by_doctor_id
                    AND w.entry_type = 'referral_reward'
                    AND w.reference_id = d.id::text
              )
            LIMIT 500
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
