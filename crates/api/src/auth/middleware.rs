//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::{AUTHORIZATION, COOKIE},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::identity::IdentityVerifier;
use crate::error::ApiError;

/// Cookie set by the web client when it cannot send an Authorization header
const AUTH_COOKIE: &str = "docwallet_auth_token=";

/// Verified caller, inserted into request extensions by [`require_auth`]
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_uid: String,
    /// Verified email; the ownership authority for billing calls
    pub email: String,
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub verifier: IdentityVerifier,
}

fn extract_token_from_cookie(request: &Request) -> Option<String> {
    request
        .headers()
        .get(COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|cookie| cookie.strip_prefix(AUTH_COOKIE))
                .map(String::from)
        })
}

/// Extract bearer token from Authorization header or cookie.
/// Prefers the header.
pub(crate) fn extract_bearer_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = header.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    extract_token_from_cookie(request)
}

/// Middleware that requires a verified identity
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::warn!(path = %path, "require_auth: no bearer token (header or cookie)");
        return ApiError::Unauthenticated.into_response();
    };

    match auth_state.verifier.verify(&token) {
        Ok((user_uid, email)) => {
            tracing::debug!(path = %path, user_uid = %user_uid, "require_auth: authentication successful");
            request.extensions_mut().insert(AuthUser { user_uid, email });
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "require_auth: authentication failed");
            ApiError::Unauthenticated.into_response()
        }
    }
}
