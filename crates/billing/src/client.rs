//! Stripe client configuration

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_RETRIES: usize = 2;

/// Stripe settings, read once at startup.
///
/// Both secrets are optional: without a secret key checkout and confirmation
/// fail closed, without a webhook secret the webhook endpoint refuses events.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: Option<String>,
    pub webhook_secret: Option<String>,
    pub success_url: String,
    pub cancel_url: String,
    /// Upper bound for a single processor call
    pub timeout: Duration,
    /// Extra attempts for idempotent reads
    pub max_retries: usize,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            webhook_secret: None,
            success_url: "http://localhost:3000/billing/success?session_id={CHECKOUT_SESSION_ID}"
                .to_string(),
            cancel_url: "http://localhost:3000/billing/cancel".to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match non_empty_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{name} must be a number, got {raw:?}"))),
        None => Ok(default),
    }
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let secret_key = non_empty_var("STRIPE_SECRET_KEY");
        if secret_key.is_none() {
            tracing::warn!("STRIPE_SECRET_KEY not set - checkout and confirmation are disabled");
        }
        let webhook_secret = non_empty_var("STRIPE_WEBHOOK_SECRET");
        if webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set - webhook events will be rejected");
        }

        Ok(Self {
            secret_key,
            webhook_secret,
            success_url: non_empty_var("CHECKOUT_SUCCESS_URL").unwrap_or(defaults.success_url),
            cancel_url: non_empty_var("CHECKOUT_CANCEL_URL").unwrap_or(defaults.cancel_url),
            timeout: Duration::from_secs(parse_var("STRIPE_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?),
            max_retries: parse_var("STRIPE_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
        })
    }
}

/// Authenticated Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Fails with [`BillingError::Config`] when no secret key is configured
    pub fn new(config: StripeConfig) -> BillingResult<Self> {
        let secret_key = config
            .secret_key
            .as_deref()
            .ok_or_else(|| BillingError::Config("STRIPE_SECRET_KEY is not configured".into()))?;

        if !(secret_key.starts_with("sk_") || secret_key.starts_with("rk_")) {
            return Err(BillingError::Config(
                "STRIPE_SECRET_KEY must start with sk_ or rk_".into(),
            ));
        }

        let client = stripe::Client::new(secret_key);
        Ok(Self { client, config })
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
