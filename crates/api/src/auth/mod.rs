//! Authentication module for DocWallet

pub mod identity;
pub mod middleware;

pub use identity::{IdentityClaims, IdentityError, IdentityVerifier};
pub use middleware::{require_auth, AuthState, AuthUser};
