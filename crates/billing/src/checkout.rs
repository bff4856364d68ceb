//! Checkout session initiation

use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{CheckoutLogEntry, PromoCode};
use crate::pricing::{resolve_price, DiscountSource, PricingRequest};
use crate::processor::{CreateSessionRequest, PaymentProcessor, SessionMetadata};
use crate::store::WalletStore;

/// A verified caller asking to pay for a plan
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub doctor_id: Uuid,
    pub user_uid: String,
    pub caller_email: String,
    pub plan_id: String,
    /// Defaults to USD
    pub currency: Option<String>,
    pub promo_code: Option<String>,
    /// Caller-declared eligibility for the tenant's individual discount
    pub apply_individual_discount: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    pub success: bool,
    pub promo_applied: bool,
    pub promo_validated: bool,
    pub applied_discount_source: DiscountSource,
    pub original_amount: i64,
    pub discounted_amount: i64,
    pub currency: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Checkout service
pub struct CheckoutService {
    store: Arc<dyn WalletStore>,
    processor: Option<Arc<dyn PaymentProcessor>>,
}

impl CheckoutService {
    pub fn new(store: Arc<dyn WalletStore>, processor: Option<Arc<dyn PaymentProcessor>>) -> Self {
        Self { store, processor }
    }

    /// Price the plan, open a processor session and record the decision.
    ///
    /// Nothing is created or logged when the processor is not configured or
    /// the promo code does not exist.
    pub async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutResponse> {
        let processor = self.processor.as_ref().ok_or_else(|| {
            tracing::error!(
                doctor_id = %request.doctor_id,
                "Checkout refused: payment processor is not configured"
            );
            BillingError::Config("payment processor is not configured".into())
        })?;

        let doctor = self
            .store
            .get_doctor(request.doctor_id)
            .await?
            .ok_or(BillingError::DoctorNotFound(request.doctor_id))?;

        if !doctor.owned_by(&request.caller_email) {
            tracing::warn!(
                doctor_id = %request.doctor_id,
                user_uid = %request.user_uid,
                "Checkout refused: caller does not own tenant"
            );
            return Err(BillingError::Forbidden("tenant belongs to another account".into()));
        }

        let pricing_override = self.store.get_pricing_override().await?;

        let promo_code = request
            .promo_code
            .as_deref()
            .map(PromoCode::normalize)
            .filter(|c| !c.is_empty());
        let promo = match &promo_code {
            Some(code) => self.store.find_promo_code(code).await?,
            None => None,
        };

        let currency = request.currency.as_deref().unwrap_or("USD");
        let now = OffsetDateTime::now_utc();

        let quote = resolve_price(PricingRequest {
            plan_id: &request.plan_id,
            currency,
            doctor: &doctor,
            pricing_override: &pricing_override,
            promo_code: promo_code.as_deref(),
            promo: promo.as_ref(),
            individual_discount_eligible: request.apply_individual_discount,
            now,
        })
        .map_err(|e| {
            tracing::warn!(
                doctor_id = %request.doctor_id,
                plan_id = %request.plan_id,
                error = %e,
                "Checkout pricing rejected"
            );
            e
        })?;

        let metadata = SessionMetadata {
            plan_id: quote.plan_id.clone(),
            doctor_id: doctor.id,
            user_uid: request.user_uid.clone(),
            promo_code: quote.applied_promo_code.clone().unwrap_or_default(),
            interval: quote.interval,
        };

        let session = processor
            .create_session(&CreateSessionRequest {
                customer_email: doctor.email.clone(),
                amount: quote.discounted_amount,
                currency: quote.currency.clone(),
                product_name: format!("DocWallet {} plan", quote.plan_id),
                metadata,
            })
            .await?;

        let log_entry = CheckoutLogEntry {
            id: Uuid::new_v4(),
            doctor_id: doctor.id,
            user_uid: request.user_uid,
            plan_id: quote.plan_id.clone(),
            session_id: session.id.clone(),
            currency: quote.currency.clone(),
            original_amount: quote.original_amount,
            discounted_amount: quote.discounted_amount,
            applied_discount_source: quote.applied_discount_source.as_str().to_string(),
            promo_code,
            promo_applied: quote.promo_applied,
            promo_validated: quote.promo_validated,
            created_at: now,
        };

        if let Err(e) = self.store.append_checkout_log(&log_entry).await {
            // The session is never handed out, so it simply expires unpaid
            tracing::error!(
                doctor_id = %doctor.id,
                session_id = %session.id,
                error = %e,
                "Failed to record checkout log, withholding session"
            );
            return Err(e);
        }

        tracing::info!(
            doctor_id = %doctor.id,
            session_id = %session.id,
            plan_id = %quote.plan_id,
            original_amount = quote.original_amount,
            discounted_amount = quote.discounted_amount,
            discount_source = quote.applied_discount_source.as_str(),
            "Checkout session created"
        );

        Ok(CheckoutResponse {
            success: true,
            promo_applied: quote.promo_applied,
            promo_validated: quote.promo_validated,
            applied_discount_source: quote.applied_discount_source,
            original_amount: quote.original_amount,
            discounted_amount: quote.discounted_amount,
            currency: quote.currency,
            session_id: session.id,
            url: session.url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Doctor;
    use crate::processor::mock::MockPaymentProcessor;
    use crate::processor::META_PROMO_CODE;
    use crate::store::InMemoryWalletStore;

    const EMAIL: &str = "doc@clinic.org";

    async fn setup() -> (CheckoutService, Arc<InMemoryWalletStore>, Arc<MockPaymentProcessor>, Uuid) {
        let store = Arc::new(InMemoryWalletStore::new());
        let processor = Arc::new(MockPaymentProcessor::new());
        let doctor_id = Uuid::new_v4();
        store.insert_doctor(Doctor::new(doctor_id, EMAIL)).await;
        store
            .insert_promo_code(PromoCode {
                code: "spring25".into(),
                percent_off: 25,
                is_active: true,
                valid_from: None,
                valid_until: None,
                max_redemptions: None,
                redemption_count: 0,
            })
            .await;
        let service = CheckoutService::new(store.clone(), Some(processor.clone()));
        (service, store, processor, doctor_id)
    }

    fn request(doctor_id: Uuid, promo: Option<&str>) -> CheckoutRequest {
        CheckoutRequest {
            doctor_id,
            user_uid: "uid-1".into(),
            caller_email: EMAIL.into(),
            plan_id: "monthly".into(),
            currency: None,
            promo_code: promo.map(String::from),
            apply_individual_discount: true,
        }
    }

    #[tokio::test]
    async fn test_checkout_with_promo_creates_session_and_log() {
        let (service, store, processor, doctor_id) = setup().await;

        let response = service
            .create_checkout_session(request(doctor_id, Some("Spring25")))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.original_amount, 2000);
        assert_eq!(response.discounted_amount, 1500);
        assert_eq!(response.applied_discount_source, DiscountSource::Promo);
        assert!(response.url.is_some());

        let created = processor.created_sessions().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].amount, 1500);
        assert_eq!(created[0].metadata.promo_code, "SPRING25");
        assert_eq!(created[0].metadata.doctor_id, doctor_id);
        assert_eq!(created[0].metadata.user_uid, "uid-1");

        let logs = store.checkout_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].session_id, response.session_id);
        assert_eq!(logs[0].applied_discount_source, "promo");
        assert_eq!(logs[0].discounted_amount, 1500);
    }

    #[tokio::test]
    async fn test_losing_promo_is_not_echoed_in_metadata() {
        let (service, store, processor, doctor_id) = setup().await;
        let mut doctor = store.doctor(doctor_id).await.unwrap();
        doctor.admin_stripe_discount_percent = 40;
        store.insert_doctor(doctor).await;

        let response = service
            .create_checkout_session(request(doctor_id, Some("SPRING25")))
            .await
            .unwrap();
        assert_eq!(response.applied_discount_source, DiscountSource::Individual);

        let created = processor.created_sessions().await;
        assert_eq!(created[0].metadata.promo_code, "");
        assert_eq!(
            created[0].metadata.to_map().get(META_PROMO_CODE).map(String::as_str),
            Some("")
        );
    }

    #[tokio::test]
    async fn test_invalid_promo_creates_nothing() {
        let (service, store, processor, doctor_id) = setup().await;

        let err = service
            .create_checkout_session(request(doctor_id, Some("BOGUS")))
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::PromoCodeNotFound(_)));
        assert!(processor.created_sessions().await.is_empty());
        assert!(store.checkout_logs().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_processor_fails_closed() {
        let store = Arc::new(InMemoryWalletStore::new());
        let doctor_id = Uuid::new_v4();
        store.insert_doctor(Doctor::new(doctor_id, EMAIL)).await;
        let service = CheckoutService::new(store.clone(), None);

        let err = service
            .create_checkout_session(request(doctor_id, None))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
        assert!(store.checkout_logs().await.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_tenant_rejected() {
        let (service, store, processor, doctor_id) = setup().await;
        let mut req = request(doctor_id, None);
        req.caller_email = "intruder@else.org".into();

        let err = service.create_checkout_session(req).await.unwrap_err();
        assert!(matches!(err, BillingError::Forbidden(_)));
        assert!(processor.created_sessions().await.is_empty());
        assert!(store.checkout_logs().await.is_empty());
    }

    #[tokio::test]
    async fn test_processor_outage_writes_no_log() {
        let (service, store, processor, doctor_id) = setup().await;
        processor.set_unavailable(true);

        let err = service
            .create_checkout_session(request(doctor_id, None))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.checkout_logs().await.is_empty());
    }
}
