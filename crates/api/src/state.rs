//! Application state

use axum::extract::FromRef;
use docwallet_billing::BillingService;
use std::sync::Arc;

use crate::auth::{AuthState, IdentityVerifier};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
    pub auth: AuthState,
}

impl AppState {
    pub fn new(billing: BillingService, identity_secret: &[u8]) -> Self {
        Self {
            billing: Arc::new(billing),
            auth: AuthState {
                verifier: IdentityVerifier::from_secret(identity_secret),
            },
        }
    }
}

impl FromRef<AppState> for AuthState {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}
