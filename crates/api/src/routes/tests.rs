//! Router tests against the in-memory store and mock processor

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use docwallet_billing::{
    models::{Doctor, PromoCode},
    pricing::BillingInterval,
    processor::{
        mock::{completed_session, MockPaymentProcessor},
        PaymentProcessor, SessionStatus,
    },
    store::InMemoryWalletStore,
    webhooks::sign_payload,
    BillingService,
};
use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::auth::identity::test_tokens::{token, SECRET};
use crate::state::AppState;

const EMAIL: &str = "doc@clinic.org";
const WEBHOOK_SECRET: &str = "whsec_router_test";

struct Harness {
    app: Router,
    store: Arc<InMemoryWalletStore>,
    processor: Arc<MockPaymentProcessor>,
    doctor_id: Uuid,
}

async fn harness_with(processor: bool, webhook_secret: Option<&str>) -> Harness {
    let store = Arc::new(InMemoryWalletStore::new());
    let mock = Arc::new(MockPaymentProcessor::new());
    let doctor_id = Uuid::new_v4();
    store.insert_doctor(Doctor::new(doctor_id, EMAIL)).await;
    store
        .insert_promo_code(PromoCode {
            code: "SAVE25".into(),
            percent_off: 25,
            is_active: true,
            valid_from: None,
            valid_until: None,
            max_redemptions: Some(100),
            redemption_count: 3,
        })
        .await;

    let processor: Option<Arc<dyn PaymentProcessor>> = if processor {
        Some(mock.clone() as Arc<dyn PaymentProcessor>)
    } else {
        None
    };
    let billing = BillingService::new(store.clone(), processor, webhook_secret.map(String::from));
    let app = create_router(AppState::new(billing, SECRET.as_bytes()));

    Harness {
        app,
        store,
        processor: mock,
        doctor_id,
    }
}

async fn harness() -> Harness {
    harness_with(true, Some(WEBHOOK_SECRET)).await
}

fn authed_json(method: Method, uri: &str, email: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token("uid-1", email)))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed_get(uri: &str, email: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token("uid-1", email)))
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn completed_event(event_id: &str, session_id: &str, doctor_id: Uuid) -> String {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": OffsetDateTime::now_utc().unix_timestamp(),
        "data": { "object": {
            "id": session_id,
            "status": "complete",
            "payment_status": "paid",
            "customer_details": { "email": EMAIL },
            "metadata": {
                "doctorId": doctor_id.to_string(),
                "planId": "annual",
                "interval": "year"
            },
            "amount_total": 20000,
            "currency": "usd"
        }}
    })
    .to_string()
}

fn webhook_request(payload: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/billing/webhook");
    if let Some(signature) = signature {
        builder = builder.header("stripe-signature", signature);
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = harness().await;
    let (status, body) = send(
        &h.app,
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn test_checkout_requires_identity() {
    let h = harness().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/billing/checkout")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "doctorId": h.doctor_id, "planId": "monthly" }).to_string()))
        .unwrap();

    let (status, body) = send(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "success": false, "error": "unauthenticated" }));
}

#[tokio::test]
async fn test_checkout_with_promo() {
    let h = harness().await;
    let (status, body) = send(
        &h.app,
        authed_json(
            Method::POST,
            "/api/billing/checkout",
            EMAIL,
            json!({ "doctorId": h.doctor_id, "planId": "monthly", "promoCode": "save25" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["originalAmount"], 2000);
    assert_eq!(body["discountedAmount"], 1500);
    assert_eq!(body["appliedDiscountSource"], "promo");
    assert_eq!(body["promoApplied"], true);
    assert_eq!(body["promoValidated"], true);
    assert!(body["sessionId"].as_str().unwrap().starts_with("cs_test_"));
    assert!(body["url"].is_string());
    assert_eq!(h.store.checkout_logs().await.len(), 1);
}

#[tokio::test]
async fn test_checkout_unknown_promo_is_500_without_side_effects() {
    let h = harness().await;
    let (status, body) = send(
        &h.app,
        authed_json(
            Method::POST,
            "/api/billing/checkout",
            EMAIL,
            json!({ "doctorId": h.doctor_id, "planId": "monthly", "promoCode": "NOPE" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "success": false, "error": "invalid_promo_code" }));
    assert!(h.processor.created_sessions().await.is_empty());
    assert!(h.store.checkout_logs().await.is_empty());
}

#[tokio::test]
async fn test_checkout_without_processor_fails_closed() {
    let h = harness_with(false, Some(WEBHOOK_SECRET)).await;
    let (status, body) = send(
        &h.app,
        authed_json(
            Method::POST,
            "/api/billing/checkout",
            EMAIL,
            json!({ "doctorId": h.doctor_id, "planId": "monthly" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "billing_not_configured");
}

#[tokio::test]
async fn test_checkout_for_foreign_tenant_forbidden() {
    let h = harness().await;
    let (status, body) = send(
        &h.app,
        authed_json(
            Method::POST,
            "/api/billing/checkout",
            "intruder@else.org",
            json!({ "doctorId": h.doctor_id, "planId": "monthly" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn test_checkout_malformed_body_is_400() {
    let h = harness().await;
    let (status, body) = send(
        &h.app,
        authed_json(
            Method::POST,
            "/api/billing/checkout",
            EMAIL,
            json!({ "planId": "monthly" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_request");
}

#[tokio::test]
async fn test_confirm_then_duplicate() {
    let h = harness().await;
    h.processor
        .insert_session(completed_session(
            "cs_confirm",
            h.doctor_id,
            EMAIL,
            20000,
            BillingInterval::Year,
        ))
        .await;

    let request = || {
        authed_json(
            Method::POST,
            "/api/billing/confirm",
            EMAIL,
            json!({ "sessionId": "cs_confirm" }),
        )
    };

    let (status, first) = send(&h.app, request()).await;
    assert_eq!(status, StatusCode::OK, "{first}");
    assert_eq!(first, json!({ "success": true }));

    // A repeat must be indistinguishable from the crediting call
    let (status, second) = send(&h.app, request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second, first);

    assert_eq!(h.store.doctor(h.doctor_id).await.unwrap().wallet_months, 12);
}

#[tokio::test]
async fn test_confirm_other_callers_session_is_403() {
    let h = harness().await;
    h.processor
        .insert_session(completed_session(
            "cs_theirs",
            h.doctor_id,
            EMAIL,
            2000,
            BillingInterval::Month,
        ))
        .await;

    let (status, body) = send(
        &h.app,
        authed_json(
            Method::POST,
            "/api/billing/confirm",
            "intruder@else.org",
            json!({ "sessionId": "cs_theirs" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "session_ownership_mismatch");
    assert_eq!(h.store.lock_count().await, 0);
}

#[tokio::test]
async fn test_confirm_open_session_is_409() {
    let h = harness().await;
    let mut session = completed_session(
        "cs_open",
        h.doctor_id,
        EMAIL,
        2000,
        BillingInterval::Month,
    );
    session.status = SessionStatus::Open;
    session.payment_status = Some("unpaid".into());
    h.processor.insert_session(session).await;

    let (status, body) = send(
        &h.app,
        authed_json(
            Method::POST,
            "/api/billing/confirm",
            EMAIL,
            json!({ "sessionId": "cs_open" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "session_not_complete");
}

#[tokio::test]
async fn test_webhook_is_post_only() {
    let h = harness().await;
    let (status, _) = send(
        &h.app,
        Request::get("/api/billing/webhook").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_webhook_without_secret_is_500() {
    let h = harness_with(true, None).await;
    let payload = completed_event("evt_1", "cs_hook", h.doctor_id);
    let signature = sign_payload("whatever", &payload, OffsetDateTime::now_utc().unix_timestamp());

    let (status, body) = send(&h.app, webhook_request(&payload, Some(signature))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "webhook_not_configured");
}

#[tokio::test]
async fn test_webhook_signature_checks() {
    let h = harness().await;
    let payload = completed_event("evt_1", "cs_hook", h.doctor_id);

    let (status, body) = send(&h.app, webhook_request(&payload, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "missing_signature");

    let forged = sign_payload("whsec_wrong", &payload, OffsetDateTime::now_utc().unix_timestamp());
    let (status, body) = send(&h.app, webhook_request(&payload, Some(forged))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_signature");

    assert!(h.store.payment_logs().await.is_empty());
    assert_eq!(h.store.doctor(h.doctor_id).await.unwrap().wallet_months, 0);
}

#[tokio::test]
async fn test_webhook_credits_once_across_redelivery() {
    let h = harness().await;
    let payload = completed_event("evt_paid", "cs_hook", h.doctor_id);

    for duplicate in [false, true] {
        let signature =
            sign_payload(WEBHOOK_SECRET, &payload, OffsetDateTime::now_utc().unix_timestamp());
        let (status, body) = send(&h.app, webhook_request(&payload, Some(signature))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body, json!({ "received": true, "duplicate": duplicate }));
    }

    assert_eq!(h.store.doctor(h.doctor_id).await.unwrap().wallet_months, 12);
    assert_eq!(h.store.payment_logs().await.len(), 1);
}

#[tokio::test]
async fn test_ledger_after_webhook_shows_single_entry() {
    let h = harness().await;
    let payload = completed_event("evt_ledger", "cs_ledger", h.doctor_id);
    let signature =
        sign_payload(WEBHOOK_SECRET, &payload, OffsetDateTime::now_utc().unix_timestamp());
    let (status, _) = send(&h.app, webhook_request(&payload, Some(signature))).await;
    assert_eq!(status, StatusCode::OK);

    let uri = format!(
        "/api/billing/ledger?doctorId={}&email={}&limit=10",
        h.doctor_id, EMAIL
    );
    let (status, body) = send(&h.app, authed_get(&uri, EMAIL)).await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let entries = body["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["sourceCollection"], "wallet_payments");
    assert_eq!(entries[0]["referenceId"], "cs_ledger");
    assert_eq!(entries[0]["amount"], 200.0);
    assert_eq!(entries[0]["currency"], "USD");
    assert_eq!(entries[0]["monthsDelta"], 12);
}

#[tokio::test]
async fn test_ledger_of_foreign_tenant_forbidden() {
    let h = harness().await;
    let uri = format!("/api/billing/ledger?doctorId={}", h.doctor_id);
    let (status, body) = send(&h.app, authed_get(&uri, "intruder@else.org")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "forbidden");
}
