//! Wallet reconciliation checks
//!
//! Read-only consistency checks run out of band by the worker. They surface
//! state the confirmation processor should never leave behind, so that an
//! operator can repair it instead of the system retrying blindly.

use serde::Serialize;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::WalletStore;

pub const CHECK_ORPHANED_LOCKS: &str = "orphaned_session_locks";
pub const CHECK_UNREWARDED_REFERRALS: &str = "unrewarded_referrals";

/// Default age before a lock without a ledger entry counts as orphaned
pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::minutes(10);

/// Result of running a single check
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: String,
    /// Tenants affected
    pub doctor_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Money taken, wallet not credited
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub struct ReconciliationChecker {
    store: Arc<dyn WalletStore>,
    orphan_grace: Duration,
}

impl ReconciliationChecker {
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self {
            store,
            orphan_grace: DEFAULT_ORPHAN_GRACE,
        }
    }

    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_orphaned_locks(now).await?);
        violations.extend(self.check_unrewarded_referrals().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        for violation in &violations {
            tracing::error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                doctor_ids = ?violation.doctor_ids,
                context = %violation.context,
                "RECONCILIATION NEEDED: {}",
                violation.description
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// A lock exists but the wallet was never credited for that session
    async fn check_orphaned_locks(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let locks = self.store.find_orphaned_locks(now - self.orphan_grace).await?;

        Ok(locks
            .into_iter()
            .map(|lock| InvariantViolation {
                invariant: CHECK_ORPHANED_LOCKS.to_string(),
                doctor_ids: vec![lock.doctor_id],
                description: format!(
                    "Session {} is locked but has no stripe_payment ledger entry",
                    lock.session_id
                ),
                context: serde_json::json!({
                    "session_id": lock.session_id,
                    "locked_at": lock.created_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Referral latch is set but the referrer has no matching reward entry
    async fn check_unrewarded_referrals(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self.store.find_unrewarded_referrals().await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: CHECK_UNREWARDED_REFERRALS.to_string(),
                doctor_ids: vec![row.referrer_id, row.referred_doctor_id],
                description: "Referral bonus latched without a referral_reward entry".to_string(),
                context: serde_json::json!({
                    "referred_doctor_id": row.referred_doctor_id,
                    "referrer_id": row.referrer_id,
                    "latched_at": row.referral_bonus_applied_at.map(|t| t.unix_timestamp()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            CHECK_ORPHANED_LOCKS => self.check_orphaned_locks(OffsetDateTime::now_utc()).await,
            CHECK_UNREWARDED_REFERRALS => self.check_unrewarded_referrals().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![CHECK_ORPHANED_LOCKS, CHECK_UNREWARDED_REFERRALS]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{entry_type, Doctor, WalletPayment};
    use crate::store::InMemoryWalletStore;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = ReconciliationChecker::available_checks();
        assert_eq!(checks.len(), 2);
        assert!(checks.contains(&CHECK_ORPHANED_LOCKS));
    }

    #[tokio::test]
    async fn test_clean_store_is_healthy() {
        let store = Arc::new(InMemoryWalletStore::new());
        let summary = ReconciliationChecker::new(store).run_all_checks().await.unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.checks_passed, 2);
    }

    #[tokio::test]
    async fn test_old_orphaned_lock_reported() {
        let store = Arc::new(InMemoryWalletStore::new());
        let doctor_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();
        store.insert_lock("cs_orphan", doctor_id, now - Duration::hours(1)).await;
        store.insert_lock("cs_fresh", doctor_id, now).await;

        let summary = ReconciliationChecker::new(store).run_all_checks().await.unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 1);
        assert_eq!(summary.violations.len(), 1);
        assert_eq!(summary.violations[0].invariant, CHECK_ORPHANED_LOCKS);
        assert_eq!(summary.violations[0].severity, ViolationSeverity::Critical);
        assert_eq!(summary.violations[0].context["session_id"], "cs_orphan");
    }

    #[tokio::test]
    async fn test_credited_lock_is_not_orphaned() {
        let store = Arc::new(InMemoryWalletStore::new());
        let doctor_id = Uuid::new_v4();
        let then = OffsetDateTime::now_utc() - Duration::hours(1);
        store.insert_lock("cs_ok", doctor_id, then).await;
        store
            .insert_wallet_payment(WalletPayment {
                id: Uuid::new_v4(),
                doctor_id,
                entry_type: entry_type::STRIPE_PAYMENT.into(),
                source: "stripe".into(),
                status: "confirmed".into(),
                months_delta: 1,
                amount: 20.0,
                currency: "USD".into(),
                reference_id: Some("cs_ok".into()),
                note: None,
                created_at: then,
            })
            .await;

        let violations = ReconciliationChecker::new(store)
            .run_check(CHECK_ORPHANED_LOCKS)
            .await
            .unwrap();
        assert!(violations.is_empty());
    }

    #[tokio::test]
    async fn test_latched_referral_without_reward_reported() {
        let store = Arc::new(InMemoryWalletStore::new());
        let referrer = Uuid::new_v4();
        let mut referred = Doctor::new(Uuid::new_v4(), "new@clinic.org");
        referred.referred_by_doctor_id = Some(referrer);
        referred.referral_bonus_applied = true;
        store.insert_doctor(referred.clone()).await;

        let violations = ReconciliationChecker::new(store)
            .run_check(CHECK_UNREWARDED_REFERRALS)
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].doctor_ids, vec![referrer, referred.id]);
    }
}
