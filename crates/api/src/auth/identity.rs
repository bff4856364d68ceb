//! Bearer identity token verification
//!
//! Tokens are issued by the external identity provider and signed with a
//! shared HS256 secret. The verified email is the ownership authority for
//! every billing call.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by an identity token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaims {
    /// Identity provider user id
    pub sub: String,
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Token has no verified email")]
    MissingEmail,
}

/// Verifies identity tokens against a static secret
#[derive(Clone)]
pub struct IdentityVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl IdentityVerifier {
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Decode and validate a token, returning `(user_uid, email)`
    pub fn verify(&self, token: &str) -> Result<(String, String), IdentityError> {
        let data = decode::<IdentityClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Identity token rejected");
                IdentityError::InvalidToken
            })?;
        let claims = data.claims;

        if claims.email_verified == Some(false) {
            return Err(IdentityError::MissingEmail);
        }
        let email = claims
            .email
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .ok_or(IdentityError::MissingEmail)?;

        Ok((claims.sub, email))
    }
}
