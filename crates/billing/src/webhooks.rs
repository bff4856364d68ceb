//! Stripe webhook handling
//!
//! Verifies signed deliveries, claims each event id exactly once, records the
//! raw processor object as a payment log and routes completed checkout
//! sessions into the confirmation processor.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::confirmation::{ConfirmationOutcome, ConfirmationService};
use crate::error::{BillingError, BillingResult};
use crate::models::{entry_type, RawPaymentLog};
use crate::pricing::BillingInterval;
use crate::processor::{PaymentSession, SessionStatus, META_DOCTOR_ID, META_INTERVAL};
use crate::store::{WalletStore, WebhookResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub const CHECKOUT_SESSION_COMPLETED: &str = "checkout.session.completed";
pub const CHECKOUT_SESSION_ASYNC_SUCCEEDED: &str = "checkout.session.async_payment_succeeded";
pub const CHECKOUT_SESSION_ASYNC_FAILED: &str = "checkout.session.async_payment_failed";
pub const CHECKOUT_SESSION_EXPIRED: &str = "checkout.session.expired";
pub const PAYMENT_INTENT_FAILED: &str = "payment_intent.payment_failed";

/// Minimal event envelope. Only the fields this service reads are decoded,
/// so newer API versions keep parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CustomerDetails {
    email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    status: Option<String>,
    payment_status: Option<String>,
    customer_email: Option<String>,
    customer_details: Option<CustomerDetails>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    amount_total: Option<i64>,
    currency: Option<String>,
    invoice: Option<serde_json::Value>,
    payment_intent: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct PaymentIntentObject {
    id: String,
    amount: Option<i64>,
    currency: Option<String>,
    receipt_email: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Expandable reference: either an id string or an object carrying `id`
fn expandable_id(value: &Option<serde_json::Value>) -> Option<String> {
    match value.as_ref()? {
        serde_json::Value::String(id) => Some(id.clone()),
        serde_json::Value::Object(map) => map.get("id")?.as_str().map(String::from),
        _ => None,
    }
}

impl CheckoutSessionObject {
    fn email(&self) -> Option<String> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .or_else(|| self.customer_email.clone())
    }

    fn into_payment_session(self) -> PaymentSession {
        let interval = self
            .metadata
            .get(META_INTERVAL)
            .map(|i| BillingInterval::parse(i))
            .unwrap_or(BillingInterval::Other);
        PaymentSession {
            customer_email: self.email(),
            status: SessionStatus::parse(self.status.as_deref().unwrap_or("")),
            id: self.id,
            payment_status: self.payment_status,
            metadata: self.metadata,
            amount_total: self.amount_total,
            currency: self.currency,
            interval,
            url: None,
        }
    }
}

fn doctor_from_metadata(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get(META_DOCTOR_ID)
        .and_then(|raw| Uuid::parse_str(raw).ok())
}

/// What happened to a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    Processed,
    /// Event id already claimed by an earlier or concurrent delivery
    Duplicate,
    /// Event type is not handled
    Ignored,
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    store: Arc<dyn WalletStore>,
    confirmation: Arc<ConfirmationService>,
    webhook_secret: Option<String>,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn WalletStore>,
        confirmation: Arc<ConfirmationService>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            store,
            confirmation,
            webhook_secret,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.webhook_secret.is_some()
    }

    /// Verify the `Stripe-Signature` header against the raw body and parse it
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        let secret = self
            .webhook_secret
            .as_deref()
            .ok_or_else(|| BillingError::Config("STRIPE_WEBHOOK_SECRET is not configured".into()))?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(secret, payload, signature, now)?;

        serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::InvalidInput("malformed webhook payload".into())
        })
    }

    /// Handle a verified event. Each event id is processed at most once unless
    /// an earlier attempt ended in error.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookDisposition> {
        let claimed = self
            .store
            .claim_webhook_event(&event.id, &event.event_type)
            .await
            .map_err(|e| {
                tracing::error!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to claim webhook event for processing"
                );
                e
            })?;

        if !claimed {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event - already claimed"
            );
            return Ok(WebhookDisposition::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let result = self.process_event(&event).await;

        let (outcome, error_message) = match &result {
            Ok(_) => (WebhookResult::Success, None),
            Err(e) => (WebhookResult::Error, Some(e.to_string())),
        };

        if let Err(e) = self
            .store
            .complete_webhook_event(&event.id, outcome, error_message.as_deref())
            .await
        {
            tracing::error!(
                event_id = %event.id,
                processing_result = outcome.as_str(),
                error = %e,
                "Failed to update webhook audit record, event may appear stuck in processing"
            );
        }

        result
    }

    async fn process_event(&self, event: &WebhookEvent) -> BillingResult<WebhookDisposition> {
        let created_at = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        match event.event_type.as_str() {
            CHECKOUT_SESSION_COMPLETED | CHECKOUT_SESSION_ASYNC_SUCCEEDED => {
                let session = parse_object::<CheckoutSessionObject>(event)?;
                self.record_session_log(event, &session, created_at).await?;
                self.credit_session(event, session.into_payment_session())
                    .await?;
            }
            CHECKOUT_SESSION_EXPIRED | CHECKOUT_SESSION_ASYNC_FAILED => {
                let session = parse_object::<CheckoutSessionObject>(event)?;
                self.record_session_log(event, &session, created_at).await?;
            }
            PAYMENT_INTENT_FAILED => {
                let intent = parse_object::<PaymentIntentObject>(event)?;
                self.store
                    .record_payment_log(&RawPaymentLog {
                        id: Uuid::new_v4(),
                        doctor_id: doctor_from_metadata(&intent.metadata),
                        customer_email: intent.receipt_email,
                        entry_type: Some(entry_type::STRIPE_PAYMENT.to_string()),
                        session_id: None,
                        invoice_id: None,
                        payment_intent_id: Some(intent.id),
                        amount_total: intent.amount,
                        currency: intent.currency,
                        billing_interval: intent.metadata.get(META_INTERVAL).cloned(),
                        status: Some("failed".to_string()),
                        stripe_event_id: Some(event.id.clone()),
                        created_at,
                    })
                    .await?;
                tracing::warn!(event_id = %event.id, "Payment failed, nothing credited");
            }
            _ => {
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                return Ok(WebhookDisposition::Ignored);
            }
        }

        Ok(WebhookDisposition::Processed)
    }

    async fn record_session_log(
        &self,
        event: &WebhookEvent,
        session: &CheckoutSessionObject,
        created_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let status = match event.event_type.as_str() {
            CHECKOUT_SESSION_ASYNC_FAILED => "failed".to_string(),
            CHECKOUT_SESSION_EXPIRED => "expired".to_string(),
            _ => session
                .payment_status
                .clone()
                .or_else(|| session.status.clone())
                .unwrap_or_default(),
        };

        self.store
            .record_payment_log(&RawPaymentLog {
                id: Uuid::new_v4(),
                doctor_id: doctor_from_metadata(&session.metadata),
                customer_email: session.email(),
                entry_type: Some(entry_type::STRIPE_PAYMENT.to_string()),
                session_id: Some(session.id.clone()),
                invoice_id: expandable_id(&session.invoice),
                payment_intent_id: expandable_id(&session.payment_intent),
                amount_total: session.amount_total,
                currency: session.currency.clone(),
                billing_interval: session.metadata.get(META_INTERVAL).cloned(),
                status: Some(status),
                stripe_event_id: Some(event.id.clone()),
                created_at,
            })
            .await
    }

    /// Trusted confirmation path: the signature is the authority, so no
    /// caller email check happens here
    async fn credit_session(&self, event: &WebhookEvent, session: PaymentSession) -> BillingResult<()> {
        match self.confirmation.confirm_verified_session(&session).await {
            Ok(ConfirmationOutcome::Credited { months_delta, .. }) => {
                tracing::info!(
                    event_id = %event.id,
                    session_id = %session.id,
                    months_delta = months_delta,
                    "Wallet credited from webhook"
                );
                Ok(())
            }
            Ok(ConfirmationOutcome::AlreadyProcessed) => Ok(()),
            Err(BillingError::SessionNotComplete { status, .. }) => {
                // Delayed payment methods complete later via async_payment_succeeded
                tracing::info!(
                    event_id = %event.id,
                    session_id = %session.id,
                    status = %status,
                    "Checkout session awaiting payment, not credited yet"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn parse_object<T: serde::de::DeserializeOwned>(event: &WebhookEvent) -> BillingResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        tracing::error!(
            event_id = %event.id,
            event_type = %event.event_type,
            parse_error = %e,
            "Webhook object does not have the expected shape"
        );
        BillingError::InvalidInput(format!("unexpected {} payload", event.event_type))
    })
}

/// Check a `t=<unix>,v1=<hex>[,v1=...]` header. Any matching `v1` passes.
pub fn verify_signature(
    secret: &str,
    payload: &str,
    header: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    candidates.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".into()))?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    let expected = mac.finalize().into_bytes();

    let matched = candidates
        .iter()
        .any(|candidate| bool::from(candidate.as_slice().ct_eq(expected.as_slice())));

    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Build a valid signature header. Used by tests and local tooling.
pub fn sign_payload(secret: &str, payload: &str, timestamp: i64) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}
