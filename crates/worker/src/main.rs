//! DocWallet Background Worker
//!
//! Handles scheduled jobs:
//! - Wallet reconciliation audit (every 15 minutes by default)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use docwallet_billing::{InvariantCheckSummary, PgWalletStore, ReconciliationChecker};
use docwallet_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_RECONCILE_CRON: &str = "0 */15 * * * *";
const DEFAULT_ORPHAN_GRACE_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
struct WorkerConfig {
    database_url: String,
    reconcile_cron: String,
    orphan_grace: time::Duration,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let reconcile_cron = std::env::var("RECONCILE_CRON")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_RECONCILE_CRON.to_string());

        Ok(Self {
            database_url,
            reconcile_cron,
            orphan_grace: parse_grace(std::env::var("ORPHAN_GRACE_MINUTES").ok().as_deref())?,
        })
    }
}

fn parse_grace(raw: Option<&str>) -> anyhow::Result<time::Duration> {
    let minutes = match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(value) => value
            .parse::<i64>()
            .ok()
            .filter(|m| *m >= 0)
            .ok_or_else(|| anyhow::anyhow!("ORPHAN_GRACE_MINUTES must be a non-negative integer"))?,
        None => DEFAULT_ORPHAN_GRACE_MINUTES,
    };
    Ok(time::Duration::minutes(minutes))
}

/// Log results of a reconciliation run
fn log_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Reconciliation audit complete - wallet state consistent"
        );
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Reconciliation audit found violations"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting DocWallet Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;

    let checker = Arc::new(
        ReconciliationChecker::new(Arc::new(PgWalletStore::new(pool)))
            .with_orphan_grace(config.orphan_grace),
    );

    let scheduler = JobScheduler::new().await?;

    // Job 1: Reconciliation audit
    let audit_checker = checker.clone();
    scheduler
        .add(Job::new_async(config.reconcile_cron.as_str(), move |_uuid, _l| {
            let checker = audit_checker.clone();
            Box::pin(async move {
                info!("Running wallet reconciliation audit");
                match checker.run_all_checks().await {
                    Ok(summary) => log_summary(&summary),
                    Err(e) => error!(error = %e, "Reconciliation audit failed"),
                }
            })
        })?)
        .await?;
    info!(
        cron = %config.reconcile_cron,
        orphan_grace_minutes = config.orphan_grace.whole_minutes(),
        "Scheduled: Wallet reconciliation audit"
    );

    // Job 2: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("DocWallet Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
