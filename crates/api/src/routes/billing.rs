//! Billing routes: checkout, confirmation, Stripe webhook and ledger

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::HeaderMap,
    Extension, Json,
};
use docwallet_billing::{
    ledger::clamp_limit, CheckoutRequest, CheckoutResponse, LedgerEntry,
    LedgerQuery, WebhookDisposition,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutBody {
    pub doctor_id: Uuid,
    pub plan_id: String,
    pub currency: Option<String>,
    pub promo_code: Option<String>,
    /// Caller asks for the tenant's individual discount to be considered
    #[serde(default)]
    pub apply_individual_discount: bool,
}

/// POST /api/billing/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    payload: Result<Json<CheckoutBody>, JsonRejection>,
) -> ApiResult<Json<CheckoutResponse>> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let response = state
        .billing
        .checkout
        .create_checkout_session(CheckoutRequest {
            doctor_id: body.doctor_id,
            user_uid: auth_user.user_uid,
            caller_email: auth_user.email,
            plan_id: body.plan_id,
            currency: body.currency,
            promo_code: body.promo_code,
            apply_individual_discount: body.apply_individual_discount,
        })
        .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmBody {
    pub session_id: String,
}

/// Same body whether this call credited the wallet or an earlier one did
#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub success: bool,
}

/// POST /api/billing/confirm
pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    payload: Result<Json<ConfirmBody>, JsonRejection>,
) -> ApiResult<Json<ConfirmResponse>> {
    let Json(body) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let outcome = state
        .billing
        .confirmation
        .confirm_session(&body.session_id, &auth_user.email)
        .await?;
    tracing::debug!(
        session_id = %body.session_id,
        credited = outcome.was_credited(),
        "Confirmation handled"
    );

    Ok(Json(ConfirmResponse { success: true }))
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub duplicate: bool,
}

/// POST /api/billing/webhook
///
/// Unauthenticated; the Stripe signature over the raw body is the authority.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let webhooks = &state.billing.webhooks;
    if !webhooks.is_configured() {
        tracing::error!("Webhook received but STRIPE_WEBHOOK_SECRET is not configured");
        return Err(ApiError::WebhookNotConfigured);
    }

    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::MissingSignature)?;

    let event = webhooks.verify_event(&body, signature)?;
    let event_id = event.id.clone();

    let disposition = webhooks.handle_event(event).await?;
    tracing::debug!(event_id = %event_id, disposition = ?disposition, "Webhook acknowledged");

    Ok(Json(WebhookAck {
        received: true,
        duplicate: disposition == WebhookDisposition::Duplicate,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerParams {
    pub doctor_id: Uuid,
    pub email: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    pub success: bool,
    pub entries: Vec<LedgerEntry>,
}

/// GET /api/billing/ledger?doctorId=..&email=..&limit=..
pub async fn get_ledger(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    params: Result<Query<LedgerParams>, axum::extract::rejection::QueryRejection>,
) -> ApiResult<Json<LedgerResponse>> {
    let Query(params) = params.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let entries = state
        .billing
        .ledger
        .ledger_for_owner(
            &auth_user.email,
            LedgerQuery {
                doctor_id: params.doctor_id,
                email: params.email.filter(|e| !e.trim().is_empty()),
                limit: clamp_limit(params.limit),
            },
        )
        .await?;

    Ok(Json(LedgerResponse {
        success: true,
        entries,
    }))
}
