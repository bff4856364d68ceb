//! HTTP routes

pub mod billing;
pub mod health;

#[cfg(test)]
mod tests;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::auth::require_auth;
use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    // Identity token required
    let protected = Router::new()
        .route("/api/billing/checkout", post(billing::create_checkout))
        .route("/api/billing/confirm", post(billing::confirm_payment))
        .route("/api/billing/ledger", get(billing::get_ledger))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health::health))
        // Signed by Stripe, no identity token
        .route("/api/billing/webhook", post(billing::stripe_webhook))
        .merge(protected)
        .with_state(state)
}
