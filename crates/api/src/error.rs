//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use docwallet_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Webhook secret is not configured")]
    WebhookNotConfigured,

    #[error("Missing Stripe-Signature header")]
    MissingSignature,

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    /// Stable machine-readable reason returned to clients
    pub fn reason(&self) -> &'static str {
        match self {
            ApiError::Unauthenticated => "unauthenticated",
            ApiError::WebhookNotConfigured => "webhook_not_configured",
            ApiError::MissingSignature => "missing_signature",
            ApiError::BadRequest(_) => "invalid_request",
            ApiError::Billing(e) => e.reason(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::WebhookNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::MissingSignature | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Billing(e) => billing_status(e),
        }
    }
}

fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        BillingError::PromoCodeNotFound(_) => StatusCode::INTERNAL_SERVER_ERROR,
        BillingError::InvalidPlan(_) | BillingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        BillingError::SessionOwnershipMismatch | BillingError::Forbidden(_) => {
            StatusCode::FORBIDDEN
        }
        BillingError::SessionNotComplete { .. } | BillingError::SessionMetadataMissing(_) => {
            StatusCode::CONFLICT
        }
        BillingError::ProcessorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        BillingError::StripeApi(_) => StatusCode::BAD_GATEWAY,
        BillingError::WebhookSignatureInvalid | BillingError::WebhookEventNotSupported(_) => {
            StatusCode::BAD_REQUEST
        }
        BillingError::DoctorNotFound(_) | BillingError::NotFound(_) => StatusCode::NOT_FOUND,
        BillingError::Database(_) | BillingError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        } else {
            tracing::warn!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let body = Json(json!({
            "success": false,
            "error": self.reason(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classes() {
        let cases = [
            (ApiError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (ApiError::MissingSignature, StatusCode::BAD_REQUEST),
            (ApiError::WebhookNotConfigured, StatusCode::INTERNAL_SERVER_ERROR),
            (
                BillingError::SessionOwnershipMismatch.into(),
                StatusCode::FORBIDDEN,
            ),
            (
                BillingError::SessionNotComplete {
                    session_id: "cs_1".into(),
                    status: "open".into(),
                }
                .into(),
                StatusCode::CONFLICT,
            ),
            (
                BillingError::Config("no key".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                BillingError::ProcessorUnavailable("timeout".into()).into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }

    #[test]
    fn test_reason_never_leaks_details() {
        let err: ApiError = BillingError::Database("relation wallet_payments missing".into()).into();
        assert_eq!(err.reason(), "internal_error");

        let err: ApiError = BillingError::Config("STRIPE_SECRET_KEY".into()).into();
        assert_eq!(err.reason(), "billing_not_configured");
    }
}
