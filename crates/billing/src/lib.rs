// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::SessionNotComplete carries session data
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! DocWallet Billing Module
//!
//! Prepaid-months wallet for doctor accounts, funded through Stripe Checkout.
//!
//! ## Features
//!
//! - **Pricing**: Plan catalog, admin price overrides, promo codes and
//!   per-tenant discounts resolved into one quote
//! - **Checkout**: Create processor sessions carrying the tenant's metadata
//! - **Confirmation**: Credit a paid session to the wallet exactly once, with
//!   the one-time referral bonus applied in the same unit of work
//! - **Webhooks**: Signed processor events feeding the same confirmation path
//! - **Ledger**: Unified, de-duplicated view of wallet entries and raw
//!   processor logs
//! - **Reconciliation**: Out-of-band checks for locks and referral latches
//!   that never produced ledger entries

pub mod checkout;
pub mod client;
pub mod confirmation;
pub mod error;
pub mod ledger;
pub mod models;
pub mod pricing;
pub mod processor;
pub mod reconciliation;
pub mod referral;
pub mod store;
pub mod webhooks;


// Checkout
pub use checkout::{CheckoutRequest, CheckoutResponse, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Confirmation
pub use confirmation::{ConfirmationOutcome, ConfirmationService};

// Error
pub use error::{BillingError, BillingResult};

// Ledger
pub use ledger::{LedgerEntry, LedgerQuery, LedgerService};

// Models
pub use models::{Doctor, PricingOverride, PricingScope, PromoCode};

// Pricing
pub use pricing::{resolve_price, BillingInterval, DiscountSource, PriceQuote, PricingRequest};

// Processor
pub use processor::{PaymentProcessor, PaymentSession, StripeProcessor};

// Reconciliation
pub use reconciliation::{
    InvariantCheckSummary, InvariantViolation, ReconciliationChecker, ViolationSeverity,
};

// Store
pub use store::{PgWalletStore, WalletStore};

// Webhooks
pub use webhooks::{WebhookDisposition, WebhookEvent, WebhookHandler};

use std::sync::Arc;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub confirmation: Arc<ConfirmationService>,
    pub ledger: LedgerService,
    pub webhooks: WebhookHandler,
    pub reconciliation: ReconciliationChecker,
}

impl BillingService {
    /// Create a billing service from Stripe settings.
    ///
    /// A missing secret key is not an error here: the service is built
    /// without a processor and payment operations fail closed.
    pub fn from_config(config: StripeConfig, store: Arc<dyn WalletStore>) -> BillingResult<Self> {
        let processor: Option<Arc<dyn PaymentProcessor>> = match config.secret_key {
            Some(_) => {
                let stripe = StripeClient::new(config.clone())?;
                Some(Arc::new(StripeProcessor::new(stripe)) as Arc<dyn PaymentProcessor>)
            }
            None => {
                tracing::warn!("STRIPE_SECRET_KEY not set - checkout and confirmation disabled");
                None
            }
        };

        Ok(Self::new(store, processor, config.webhook_secret))
    }

    /// Create a billing service with an explicit processor
    pub fn new(
        store: Arc<dyn WalletStore>,
        processor: Option<Arc<dyn PaymentProcessor>>,
        webhook_secret: Option<String>,
    ) -> Self {
        let confirmation = Arc::new(ConfirmationService::new(store.clone(), processor.clone()));

        Self {
            checkout: CheckoutService::new(store.clone(), processor),
            webhooks: WebhookHandler::new(store.clone(), confirmation.clone(), webhook_secret),
            confirmation,
            ledger: LedgerService::new(store.clone()),
            reconciliation: ReconciliationChecker::new(store),
        }
    }
}
