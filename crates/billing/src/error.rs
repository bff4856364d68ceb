//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Processor credential, webhook secret or similar is not configured
    #[error("Billing configuration error: {0}")]
    Config(String),

    /// A caller-supplied promo code does not exist
    #[error("Promo code not found: {0}")]
    PromoCodeNotFound(String),

    #[error("Unknown plan: {0}")]
    InvalidPlan(String),

    /// Session customer email does not match the authenticated caller
    #[error("Payment session does not belong to the caller")]
    SessionOwnershipMismatch,

    /// Session has not reached the `complete` status yet
    #[error("Payment session {session_id} is not complete (status: {status})")]
    SessionNotComplete { session_id: String, status: String },

    #[error("Payment session metadata missing: {0}")]
    SessionMetadataMissing(String),

    /// Processor timed out or could not be reached. Safe to retry.
    #[error("Payment processor unavailable: {0}")]
    ProcessorUnavailable(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    /// Caller may not act on this tenant
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Doctor not found: {0}")]
    DoctorNotFound(uuid::Uuid),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable machine-readable reason code surfaced to API callers
    pub fn reason(&self) -> &'static str {
        match self {
            BillingError::Config(_) => "billing_not_configured",
            BillingError::PromoCodeNotFound(_) => "invalid_promo_code",
            BillingError::InvalidPlan(_) => "invalid_plan",
            BillingError::SessionOwnershipMismatch => "session_ownership_mismatch",
            BillingError::SessionNotComplete { .. } => "session_not_complete",
            BillingError::SessionMetadataMissing(_) => "session_metadata_missing",
            BillingError::ProcessorUnavailable(_) => "payment_processor_unavailable",
            BillingError::StripeApi(_) => "payment_processor_error",
            BillingError::WebhookSignatureInvalid => "invalid_signature",
            BillingError::WebhookEventNotSupported(_) => "unsupported_event",
            BillingError::Forbidden(_) => "forbidden",
            BillingError::DoctorNotFound(_) | BillingError::NotFound(_) => "not_found",
            BillingError::InvalidInput(_) => "invalid_request",
            BillingError::Database(_) | BillingError::Internal(_) => "internal_error",
        }
    }

    /// Whether the same request may succeed if retried unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::ProcessorUnavailable(_)
                | BillingError::SessionNotComplete { .. }
                | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        match e {
            stripe::StripeError::Timeout => BillingError::ProcessorUnavailable(e.to_string()),
            stripe::StripeError::ClientError(_) => BillingError::ProcessorUnavailable(e.to_string()),
            other => BillingError::StripeApi(other.to_string()),
        }
    }
}
