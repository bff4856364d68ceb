//! Idempotent payment confirmation
//!
//! A session id moves `unseen -> locked -> credited` exactly once. The lock
//! and all wallet effects are applied by [`WalletStore::apply_session_credit`]
//! as one unit; this service only decides whether a session may reach it.

use std::sync::Arc;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::processor::{PaymentProcessor, PaymentSession, META_PLAN_ID};
use crate::store::{CreditOutcome, SessionCredit, WalletStore};

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationOutcome {
    Credited {
        months_delta: i32,
        wallet_months: i32,
        referral_bonus_applied: bool,
    },
    /// Another call already won the lock for this session
    AlreadyProcessed,
}

impl ConfirmationOutcome {
    pub fn was_credited(&self) -> bool {
        matches!(self, ConfirmationOutcome::Credited { .. })
    }
}

/// Confirmation service
pub struct ConfirmationService {
    store: Arc<dyn WalletStore>,
    processor: Option<Arc<dyn PaymentProcessor>>,
}

impl ConfirmationService {
    pub fn new(store: Arc<dyn WalletStore>, processor: Option<Arc<dyn PaymentProcessor>>) -> Self {
        Self { store, processor }
    }

    /// Client-initiated confirmation. The session's customer email must match
    /// the caller's verified email.
    pub async fn confirm_session(
        &self,
        session_id: &str,
        caller_email: &str,
    ) -> BillingResult<ConfirmationOutcome> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(BillingError::InvalidInput("sessionId is required".into()));
        }

        let processor = self
            .processor
            .as_ref()
            .ok_or_else(|| BillingError::Config("payment processor is not configured".into()))?;

        let session = processor.retrieve_session(session_id).await?;

        let owned = session
            .customer_email
            .as_deref()
            .is_some_and(|email| email.trim().eq_ignore_ascii_case(caller_email.trim()));
        if !owned {
            tracing::warn!(
                session_id = %session_id,
                "Confirmation refused: session email does not match caller"
            );
            return Err(BillingError::SessionOwnershipMismatch);
        }

        self.confirm_verified_session(&session).await
    }

    /// Confirmation for a session whose authenticity is already established
    /// (signed webhook or the ownership check above). Still requires the
    /// session to be complete.
    pub async fn confirm_verified_session(
        &self,
        session: &PaymentSession,
    ) -> BillingResult<ConfirmationOutcome> {
        if !session.is_complete() {
            tracing::info!(
                session_id = %session.id,
                status = session.effective_status(),
                "Session not complete, nothing credited"
            );
            return Err(BillingError::SessionNotComplete {
                session_id: session.id.clone(),
                status: session.effective_status().to_string(),
            });
        }

        let credit = session_credit(session)?;
        let now = OffsetDateTime::now_utc();

        let outcome = self
            .store
            .apply_session_credit(&credit, now)
            .await
            .map_err(|e| {
                tracing::error!(
                    session_id = %credit.session_id,
                    doctor_id = %credit.doctor_id,
                    error = %e,
                    "Session credit failed and was rolled back"
                );
                e
            })?;

        match outcome {
            CreditOutcome::AlreadyProcessed => {
                tracing::info!(
                    session_id = %credit.session_id,
                    doctor_id = %credit.doctor_id,
                    "Session lock already held - duplicate confirmation ignored"
                );
                Ok(ConfirmationOutcome::AlreadyProcessed)
            }
            CreditOutcome::Credited {
                wallet_months,
                referral,
            } => {
                tracing::info!(
                    session_id = %credit.session_id,
                    doctor_id = %credit.doctor_id,
                    months_delta = credit.months_delta,
                    wallet_months = wallet_months,
                    amount = credit.amount,
                    currency = %credit.currency,
                    "Wallet credited for payment session"
                );
                if let Some(reward) = &referral {
                    tracing::info!(
                        doctor_id = %credit.doctor_id,
                        referrer_id = %reward.referrer_id,
                        referrer_access_expires_at = %reward.referrer_access_expires_at,
                        "Referral bonus applied"
                    );
                }
                Ok(ConfirmationOutcome::Credited {
                    months_delta: credit.months_delta,
                    wallet_months,
                    referral_bonus_applied: referral.is_some(),
                })
            }
        }
    }
}

fn session_credit(session: &PaymentSession) -> BillingResult<SessionCredit> {
    let doctor_id = session.doctor_id()?;
    let amount = session.amount_total.unwrap_or(0).unsigned_abs() as f64 / 100.0;
    let currency = session
        .currency
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or("usd")
        .to_uppercase();

    Ok(SessionCredit {
        session_id: session.id.clone(),
        doctor_id,
        plan_id: session.metadata_value(META_PLAN_ID).map(String::from),
        months_delta: session.billing_interval().months_delta(),
        amount,
        currency,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Doctor;
    use crate::pricing::BillingInterval;
    use crate::processor::mock::{completed_session, MockPaymentProcessor};
    use crate::processor::SessionStatus;
    use crate::store::InMemoryWalletStore;
    use uuid::Uuid;

    const EMAIL: &str = "doc@clinic.org";

    async fn setup(
        interval: BillingInterval,
    ) -> (ConfirmationService, Arc<InMemoryWalletStore>, Arc<MockPaymentProcessor>, Uuid) {
        let store = Arc::new(InMemoryWalletStore::new());
        let processor = Arc::new(MockPaymentProcessor::new());
        let doctor_id = Uuid::new_v4();
        store.insert_doctor(Doctor::new(doctor_id, EMAIL)).await;
        let amount = match interval {
            BillingInterval::Year => 20000,
            _ => 2000,
        };
        processor
            .insert_session(completed_session("cs_test_a", doctor_id, EMAIL, amount, interval))
            .await;
        let service = ConfirmationService::new(store.clone(), Some(processor.clone()));
        (service, store, processor, doctor_id)
    }

    #[tokio::test]
    async fn test_monthly_confirmation_credits_one_month() {
        let (service, store, _, doctor_id) = setup(BillingInterval::Month).await;

        let outcome = service.confirm_session("cs_test_a", EMAIL).await.unwrap();
        assert_eq!(
            outcome,
            ConfirmationOutcome::Credited {
                months_delta: 1,
                wallet_months: 1,
                referral_bonus_applied: false
            }
        );

        let doctor = store.doctor(doctor_id).await.unwrap();
        assert_eq!(doctor.wallet_months, 1);
        assert!(doctor.payment_done);

        let payments = store.wallet_payments().await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].entry_type, "stripe_payment");
        assert_eq!(payments[0].status, "confirmed");
        assert_eq!(payments[0].amount, 20.0);
        assert_eq!(payments[0].currency, "USD");
        assert_eq!(payments[0].reference_id.as_deref(), Some("cs_test_a"));
    }

    #[tokio::test]
    async fn test_annual_confirmation_credits_twelve_months() {
        let (service, store, _, doctor_id) = setup(BillingInterval::Year).await;
        service.confirm_session("cs_test_a", EMAIL).await.unwrap();
        assert_eq!(store.doctor(doctor_id).await.unwrap().wallet_months, 12);
    }

    #[tokio::test]
    async fn test_email_match_is_case_insensitive() {
        let (service, _, _, _) = setup(BillingInterval::Month).await;
        let outcome = service
            .confirm_session("cs_test_a", "  DOC@Clinic.ORG ")
            .await
            .unwrap();
        assert!(outcome.was_credited());
    }

    #[tokio::test]
    async fn test_second_confirmation_is_noop_success() {
        let (service, store, _, doctor_id) = setup(BillingInterval::Month).await;
        service.confirm_session("cs_test_a", EMAIL).await.unwrap();
        let second = service.confirm_session("cs_test_a", EMAIL).await.unwrap();

        assert_eq!(second, ConfirmationOutcome::AlreadyProcessed);
        assert_eq!(store.doctor(doctor_id).await.unwrap().wallet_months, 1);
        assert_eq!(store.wallet_payments().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_metadata_rolls_back() {
        let (service, store, processor, _) = setup(BillingInterval::Month).await;
        let mut session = completed_session("cs_test_b", Uuid::new_v4(), EMAIL, 2000, BillingInterval::Month);
        session.metadata.clear();
        processor.insert_session(session).await;

        let err = service.confirm_session("cs_test_b", EMAIL).await.unwrap_err();
        assert!(matches!(err, BillingError::SessionMetadataMissing(_)));
        assert_eq!(store.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_tenant_leaves_no_lock() {
        let (service, store, processor, _) = setup(BillingInterval::Month).await;
        processor
            .insert_session(completed_session("cs_test_c", Uuid::new_v4(), EMAIL, 2000, BillingInterval::Month))
            .await;

        let err = service.confirm_session("cs_test_c", EMAIL).await.unwrap_err();
        assert!(matches!(err, BillingError::DoctorNotFound(_)));
        assert_eq!(store.lock_count().await, 0);
    }

    #[tokio::test]
    async fn test_open_session_is_conflict() {
        let (service, store, processor, doctor_id) = setup(BillingInterval::Month).await;
        let mut session = completed_session("cs_test_open", doctor_id, EMAIL, 2000, BillingInterval::Month);
        session.status = SessionStatus::Open;
        processor.insert_session(session).await;

        let err = service.confirm_session("cs_test_open", EMAIL).await.unwrap_err();
        assert!(matches!(err, BillingError::SessionNotComplete { .. }));
        assert_eq!(store.lock_count().await, 0);

        // Once paid, the same session can still be confirmed
        processor.complete_session("cs_test_open").await;
        assert!(service
            .confirm_session("cs_test_open", EMAIL)
            .await
            .unwrap()
            .was_credited());
    }

    #[tokio::test]
    async fn test_blank_session_id_rejected() {
        let (service, _, processor, _) = setup(BillingInterval::Month).await;
        let err = service.confirm_session("  ", EMAIL).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert_eq!(processor.retrieve_calls(), 0);
    }
}
