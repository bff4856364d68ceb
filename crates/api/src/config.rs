//! API server configuration

use docwallet_billing::StripeConfig;

/// Server settings read from the environment once at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    /// Direct connection for migrations when `database_url` goes through a pooler
    pub database_direct_url: Option<String>,
    pub run_migrations: bool,
    /// HS256 secret for bearer identity tokens
    pub identity_jwt_secret: String,
    pub allowed_origins: Vec<String>,
    pub stripe: StripeConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = required_var("DATABASE_URL")?;
        let identity_jwt_secret = required_var("IDENTITY_JWT_SECRET")?;
        if identity_jwt_secret.len() < 32 {
            anyhow::bail!("IDENTITY_JWT_SECRET must be at least 32 characters");
        }

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            run_migrations: std::env::var("RUN_MIGRATIONS")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes"))
                .unwrap_or(false),
            identity_jwt_secret,
            allowed_origins,
            stripe: StripeConfig::from_env()?,
        })
    }
}

fn required_var(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("{name} must be set"))
}
