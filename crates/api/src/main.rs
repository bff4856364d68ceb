//! DocWallet API Server
//!
//! Serves checkout, payment confirmation, the Stripe webhook and the
//! wallet ledger.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use docwallet_api::{create_router, AppState, Config};
use docwallet_billing::{BillingService, PgWalletStore};
use docwallet_shared::{create_migration_pool, create_pool, run_migrations};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,docwallet_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting DocWallet API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(
        stripe_configured = config.stripe.secret_key.is_some(),
        webhook_configured = config.stripe.webhook_secret.is_some(),
        "Configuration loaded"
    );

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        // Direct URL bypasses a transaction-mode pooler
        let migration_url = config
            .database_direct_url
            .as_ref()
            .unwrap_or(&config.database_url);
        let migration_pool = create_migration_pool(migration_url).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS not set)");
    }

    let store = Arc::new(PgWalletStore::new(pool));
    let billing = BillingService::from_config(config.stripe.clone(), store)?;
    let state = AppState::new(billing, config.identity_jwt_secret.as_bytes());

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ])
        .expose_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
