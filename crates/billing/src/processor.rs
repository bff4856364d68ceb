//! Payment processor seam
//!
//! [`PaymentProcessor`] is what checkout and confirmation talk to. The live
//! implementation is [`StripeProcessor`]; tests use `mock::MockPaymentProcessor`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::pricing::BillingInterval;

pub const META_PLAN_ID: &str = "planId";
pub const META_DOCTOR_ID: &str = "doctorId";
pub const META_USER_UID: &str = "userUid";
pub const META_PROMO_CODE: &str = "promoCode";
pub const META_INTERVAL: &str = "interval";

/// Remote session status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Complete,
    Expired,
    Other(String),
}

impl SessionStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "open" => SessionStatus::Open,
            "complete" => SessionStatus::Complete,
            "expired" => SessionStatus::Expired,
            other => SessionStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Complete => "complete",
            SessionStatus::Expired => "expired",
            SessionStatus::Other(s) => s,
        }
    }
}

/// Metadata echoed on every session this service creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMetadata {
    pub plan_id: String,
    pub doctor_id: Uuid,
    pub user_uid: String,
    /// Applied promo code, empty when none won
    pub promo_code: String,
    pub interval: BillingInterval,
}

impl SessionMetadata {
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (META_PLAN_ID.to_string(), self.plan_id.clone()),
            (META_DOCTOR_ID.to_string(), self.doctor_id.to_string()),
            (META_USER_UID.to_string(), self.user_uid.clone()),
            (META_PROMO_CODE.to_string(), self.promo_code.clone()),
            (META_INTERVAL.to_string(), self.interval.as_str().to_string()),
        ])
    }
}

/// Read-only view of a processor session
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSession {
    pub id: String,
    pub status: SessionStatus,
    /// `paid`, `unpaid` or `no_payment_required`
    pub payment_status: Option<String>,
    pub customer_email: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Minor units
    pub amount_total: Option<i64>,
    /// Lowercase as reported by the processor
    pub currency: Option<String>,
    pub interval: BillingInterval,
    pub url: Option<String>,
}

impl PaymentSession {
    /// Complete and not waiting on a delayed payment method
    pub fn is_complete(&self) -> bool {
        self.status == SessionStatus::Complete && self.payment_status.as_deref() != Some("unpaid")
    }

    /// Status reported to callers when the session cannot be credited yet
    pub fn effective_status(&self) -> &str {
        match (&self.status, self.payment_status.as_deref()) {
            (SessionStatus::Complete, Some("unpaid")) => "unpaid",
            (status, _) => status.as_str(),
        }
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Tenant named in metadata
    pub fn doctor_id(&self) -> BillingResult<Uuid> {
        let raw = self
            .metadata_value(META_DOCTOR_ID)
            .ok_or_else(|| BillingError::SessionMetadataMissing(META_DOCTOR_ID.into()))?;
        Uuid::parse_str(raw)
            .map_err(|_| BillingError::SessionMetadataMissing(format!("{META_DOCTOR_ID} is not a UUID")))
    }

    /// Interval reported by the processor, falling back to metadata
    pub fn billing_interval(&self) -> BillingInterval {
        match self.interval {
            BillingInterval::Other => self
                .metadata_value(META_INTERVAL)
                .map(BillingInterval::parse)
                .unwrap_or(BillingInterval::Other),
            known => known,
        }
    }
}

/// Parameters for a new hosted checkout session
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionRequest {
    pub customer_email: String,
    /// Minor units, after discount
    pub amount: i64,
    /// Uppercase ISO code
    pub currency: String,
    pub product_name: String,
    pub metadata: SessionMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub id: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_session(&self, request: &CreateSessionRequest) -> BillingResult<CreatedSession>;

    async fn retrieve_session(&self, session_id: &str) -> BillingResult<PaymentSession>;
}

/// Bound a processor call. Expiry is reported as [`BillingError::ProcessorUnavailable`],
/// never as success.
pub async fn with_timeout<T, F>(timeout: Duration, operation: &str, fut: F) -> BillingResult<T>
where
    F: Future<Output = BillingResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                operation = operation,
                timeout_ms = timeout.as_millis() as u64,
                "Payment processor call timed out"
            );
            Err(BillingError::ProcessorUnavailable(format!(
                "{operation} timed out after {}s",
                timeout.as_secs()
            )))
        }
    }
}

/// Stripe-backed processor
#[derive(Clone)]
pub struct StripeProcessor {
    stripe: StripeClient,
}

impl StripeProcessor {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn to_payment_session(session: stripe::CheckoutSession) -> PaymentSession {
        let status = match session.status {
            Some(stripe::CheckoutSessionStatus::Complete) => SessionStatus::Complete,
            Some(stripe::CheckoutSessionStatus::Open) => SessionStatus::Open,
            Some(stripe::CheckoutSessionStatus::Expired) => SessionStatus::Expired,
            None => SessionStatus::Other("unknown".into()),
        };

        let payment_status = match session.payment_status {
            stripe::CheckoutSessionPaymentStatus::Paid => "paid",
            stripe::CheckoutSessionPaymentStatus::Unpaid => "unpaid",
            stripe::CheckoutSessionPaymentStatus::NoPaymentRequired => "no_payment_required",
        };

        let customer_email = session
            .customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .or_else(|| session.customer_email.clone());

        let metadata = session.metadata.clone().unwrap_or_default();
        let interval = metadata
            .get(META_INTERVAL)
            .map(|i| BillingInterval::parse(i))
            .unwrap_or(BillingInterval::Other);

        PaymentSession {
            id: session.id.to_string(),
            status,
            payment_status: Some(payment_status.to_string()),
            customer_email,
            metadata,
            amount_total: session.amount_total,
            currency: session.currency.map(|c| c.to_string()),
            interval,
            url: session.url,
        }
    }
}

fn parse_currency(code: &str) -> BillingResult<stripe::Currency> {
    serde_json::from_value(serde_json::Value::String(code.to_lowercase()))
        .map_err(|_| BillingError::InvalidInput(format!("Unsupported currency: {code}")))
}

#[async_trait]
impl PaymentProcessor for StripeProcessor {
    async fn create_session(&self, request: &CreateSessionRequest) -> BillingResult<CreatedSession> {
        let config = self.stripe.config();
        let currency = parse_currency(&request.currency)?;

        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(stripe::CheckoutSessionMode::Payment);
        params.success_url = Some(&config.success_url);
        params.cancel_url = Some(&config.cancel_url);
        params.customer_email = Some(&request.customer_email);
        params.client_reference_id = Some(&request.metadata.user_uid);
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price_data: Some(stripe::CreateCheckoutSessionLineItemsPriceData {
                currency,
                unit_amount: Some(request.amount),
                product_data: Some(stripe::CreateCheckoutSessionLineItemsPriceDataProductData {
                    name: request.product_name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(request.metadata.to_map());

        // Creation is not retried: a lost response could leave a second
        // live session behind.
        let session = with_timeout(config.timeout, "create_checkout_session", async {
            stripe::CheckoutSession::create(self.stripe.inner(), params)
                .await
                .map_err(BillingError::from)
        })
        .await?;

        Ok(CreatedSession {
            id: session.id.to_string(),
            url: session.url,
        })
    }

    async fn retrieve_session(&self, session_id: &str) -> BillingResult<PaymentSession> {
        let config = self.stripe.config();
        let id = session_id
            .parse::<stripe::CheckoutSessionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid session ID: {e}")))?;

        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(config.max_retries);

        let session = RetryIf::spawn(
            strategy,
            || {
                let id = id.clone();
                async move {
                    let result = with_timeout(config.timeout, "retrieve_checkout_session", async {
                        stripe::CheckoutSession::retrieve(self.stripe.inner(), &id, &[])
                            .await
                            .map_err(BillingError::from)
                    })
                    .await;
                    if let Err(e) = &result {
                        tracing::debug!(session_id = %id, error = %e, "Session retrieve attempt failed");
                    }
                    result
                }
            },
            |e: &BillingError| e.is_retryable(),
        )
        .await?;

        Ok(Self::to_payment_session(session))
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod mock {
    //! In-process processor double

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MockPaymentProcessor {
        sessions: Mutex<HashMap<String, PaymentSession>>,
        created: Mutex<Vec<CreateSessionRequest>>,
        unavailable: AtomicBool,
        next_id: AtomicUsize,
        retrieve_calls: AtomicUsize,
    }

    impl MockPaymentProcessor {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn insert_session(&self, session: PaymentSession) {
            self.sessions
                .lock()
                .await
                .insert(session.id.clone(), session);
        }

        /// Mark a created session as paid
        pub async fn complete_session(&self, session_id: &str) {
            if let Some(session) = self.sessions.lock().await.get_mut(session_id) {
                session.status = SessionStatus::Complete;
                session.payment_status = Some("paid".into());
            }
        }

        /// Make every call fail as if the processor timed out
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        pub async fn created_sessions(&self) -> Vec<CreateSessionRequest> {
            self.created.lock().await.clone()
        }

        pub fn retrieve_calls(&self) -> usize {
            self.retrieve_calls.load(Ordering::SeqCst)
        }

        fn check_available(&self) -> BillingResult<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                Err(BillingError::ProcessorUnavailable("mock processor timed out".into()))
            } else {
                Ok(())
            }
        }
    }

    /// A completed session as the processor would report it
    pub fn completed_session(
        session_id: &str,
        doctor_id: Uuid,
        email: &str,
        amount_total: i64,
        interval: BillingInterval,
    ) -> PaymentSession {
        let metadata = SessionMetadata {
            plan_id: match interval {
                BillingInterval::Year => "annual".into(),
                _ => "monthly".into(),
            },
            doctor_id,
            user_uid: format!("uid-{doctor_id}"),
            promo_code: String::new(),
            interval,
        };
        PaymentSession {
            id: session_id.to_string(),
            status: SessionStatus::Complete,
            payment_status: Some("paid".into()),
            customer_email: Some(email.to_string()),
            metadata: metadata.to_map(),
            amount_total: Some(amount_total),
            currency: Some("usd".into()),
            interval,
            url: None,
        }
    }

    #[async_trait]
    impl PaymentProcessor for MockPaymentProcessor {
        async fn create_session(
            &self,
            request: &CreateSessionRequest,
        ) -> BillingResult<CreatedSession> {
            self.check_available()?;

            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("cs_test_{n:04}");
            let url = format!("https://checkout.stripe.test/pay/{id}");

            self.created.lock().await.push(request.clone());
            self.sessions.lock().await.insert(
                id.clone(),
                PaymentSession {
                    id: id.clone(),
                    status: SessionStatus::Open,
                    payment_status: Some("unpaid".into()),
                    customer_email: Some(request.customer_email.clone()),
                    metadata: request.metadata.to_map(),
                    amount_total: Some(request.amount),
                    currency: Some(request.currency.to_lowercase()),
                    interval: request.metadata.interval,
                    url: Some(url.clone()),
                },
            );

            Ok(CreatedSession { id, url: Some(url) })
        }

        async fn retrieve_session(&self, session_id: &str) -> BillingResult<PaymentSession> {
            self.retrieve_calls.fetch_add(1, Ordering::SeqCst);
            self.check_available()?;
            self.sessions
                .lock()
                .await
                .get(session_id)
                .cloned()
                .ok_or_else(|| BillingError::NotFound(format!("session {session_id}")))
        }
    }
}
