// API crate clippy configuration
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! DocWallet API Library
//!
//! HTTP surface of the wallet billing engine: identity middleware, billing
//! routes and the error-to-HTTP mapping.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
