//! Payment ledger merge
//!
//! Reads wallet-native rows (written by the confirmation processor) and
//! processor-native raw logs (written by webhook ingestion), normalizes both
//! into [`LedgerEntry`] and removes entries that describe the same real-world
//! transaction. The merge is a pure function of the *set* of input rows: it
//! is idempotent and does not depend on input order.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{entry_type, RawPaymentLog, WalletPayment};
use crate::pricing::BillingInterval;
use crate::store::WalletStore;

/// Two success-class entries closer than this may be the same payment
pub const DUPLICATE_WINDOW: Duration = Duration::minutes(10);

/// Each source is over-fetched by this factor so dedup still fills `limit`
pub const FETCH_MULTIPLIER: usize = 3;

pub const DEFAULT_LEDGER_LIMIT: usize = 50;
pub const MAX_LEDGER_LIMIT: usize = 200;

pub const WALLET_COLLECTION: &str = "wallet_payments";
pub const PROCESSOR_COLLECTION: &str = "stripe_payment_logs";

const SUCCESS_STATUSES: &[&str] = &[
    "confirmed",
    "paid",
    "complete",
    "completed",
    "succeeded",
    "credited",
];

pub fn is_success_status(status: &str) -> bool {
    SUCCESS_STATUSES.contains(&status)
}

/// Canonical, read-only ledger row
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: String,
    pub doctor_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub source: String,
    pub source_collection: String,
    pub status: String,
    pub months_delta: i32,
    /// Major units, never negative
    pub amount: f64,
    /// Uppercase ISO code
    pub currency: String,
    pub reference_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub note: Option<String>,
}

impl LedgerEntry {
    pub fn is_wallet_native(&self) -> bool {
        self.source_collection == WALLET_COLLECTION
    }

    pub fn is_success(&self) -> bool {
        is_success_status(&self.status)
    }

    fn is_zero_amount(&self) -> bool {
        self.amount == 0.0
    }

    fn is_checkout_reference(&self) -> bool {
        self.reference_id
            .as_deref()
            .is_some_and(|r| r.starts_with("cs_"))
    }

    /// Invoice, payment intent or any other non-session reference
    fn is_invoice_style_reference(&self) -> bool {
        self.reference_id
            .as_deref()
            .is_some_and(|r| !r.is_empty() && !r.starts_with("cs_"))
    }

    /// Total preference order used whenever two entries compete:
    /// wallet-native, then success status, then non-zero amount, then
    /// checkout-session reference, then earlier timestamp, then id.
    fn preference(&self, other: &Self) -> Ordering {
        other
            .is_wallet_native()
            .cmp(&self.is_wallet_native())
            .then_with(|| other.is_success().cmp(&self.is_success()))
            .then_with(|| self.is_zero_amount().cmp(&other.is_zero_amount()))
            .then_with(|| other.is_checkout_reference().cmp(&self.is_checkout_reference()))
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.source_collection.cmp(&other.source_collection))
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// A row from either source, before normalization
#[derive(Debug, Clone)]
pub enum LedgerRecord {
    Wallet(WalletPayment),
    Processor(RawPaymentLog),
}

impl LedgerRecord {
    pub fn normalize(self) -> LedgerEntry {
        match self {
            LedgerRecord::Wallet(row) => LedgerEntry {
                id: row.id.to_string(),
                doctor_id: Some(row.doctor_id),
                entry_type: non_empty_or(row.entry_type, entry_type::STRIPE_PAYMENT),
                source: non_empty_or(row.source, "stripe"),
                source_collection: WALLET_COLLECTION.to_string(),
                status: non_empty_or(row.status.to_lowercase(), "created"),
                months_delta: row.months_delta,
                amount: sanitize_amount(row.amount),
                currency: normalize_currency(Some(row.currency.as_str())),
                reference_id: row.reference_id.filter(|r| !r.is_empty()),
                created_at: row.created_at,
                note: row.note,
            },
            LedgerRecord::Processor(raw) => {
                let months_delta = raw
                    .billing_interval
                    .as_deref()
                    .map(|i| BillingInterval::parse(i).months_delta())
                    .unwrap_or(0);
                let reference_id = [&raw.session_id, &raw.invoice_id, &raw.payment_intent_id]
                    .into_iter()
                    .flatten()
                    .find(|r| !r.is_empty())
                    .cloned();
                LedgerEntry {
                    id: raw.id.to_string(),
                    doctor_id: raw.doctor_id,
                    entry_type: non_empty_or(
                        raw.entry_type.unwrap_or_default(),
                        entry_type::STRIPE_PAYMENT,
                    ),
                    source: "stripe".to_string(),
                    source_collection: PROCESSOR_COLLECTION.to_string(),
                    status: non_empty_or(
                        raw.status.unwrap_or_default().to_lowercase(),
                        "created",
                    ),
                    months_delta,
                    amount: sanitize_amount(raw.amount_total.unwrap_or(0) as f64 / 100.0),
                    currency: normalize_currency(raw.currency.as_deref()),
                    reference_id,
                    created_at: raw.created_at,
                    note: None,
                }
            }
        }
    }
}

fn non_empty_or(value: String, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn sanitize_amount(amount: f64) -> f64 {
    if amount.is_finite() {
        amount.abs()
    } else {
        0.0
    }
}

fn normalize_currency(currency: Option<&str>) -> String {
    match currency.map(str::trim) {
        Some(c) if !c.is_empty() => c.to_uppercase(),
        _ => "USD".to_string(),
    }
}

/// Clamp a caller-supplied limit into `1..=MAX_LEDGER_LIMIT`
pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_LEDGER_LIMIT)
        .clamp(1, MAX_LEDGER_LIMIT)
}

/// Merge, deduplicate, sort newest first and truncate to `limit`
pub fn merge_ledger(records: Vec<LedgerRecord>, limit: usize) -> Vec<LedgerEntry> {
    let mut entries: Vec<LedgerEntry> = records.into_iter().map(LedgerRecord::normalize).collect();

    // Same physical row returned by more than one query
    entries.sort_by(|a, b| a.preference(b));
    let mut seen_rows = std::collections::HashSet::new();
    entries.retain(|e| seen_rows.insert((e.source_collection.clone(), e.id.clone())));

    let entries = dedup_by_reference(entries);
    let mut entries = collapse_near_duplicates(entries);

    entries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.preference(b))
    });
    entries.truncate(limit);
    entries
}

/// Key identifying one real-world transaction. Success-class statuses share
/// a key so `confirmed` and `complete` for one session meet; any other status
/// keeps its own key.
fn reference_key(entry: &LedgerEntry) -> Option<(String, String, String)> {
    let reference = entry.reference_id.clone()?;
    let status_class = if entry.is_success() {
        "success".to_string()
    } else {
        entry.status.clone()
    };
    Some((entry.entry_type.clone(), reference, status_class))
}

fn dedup_by_reference(entries: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
    let mut best: HashMap<(String, String, String), LedgerEntry> = HashMap::new();
    let mut unkeyed = Vec::new();

    for entry in entries {
        match reference_key(&entry) {
            Some(key) => match best.get(&key) {
                Some(current) if current.preference(&entry) != Ordering::Greater => {}
                _ => {
                    best.insert(key, entry);
                }
            },
            None => unkeyed.push(entry),
        }
    }

    unkeyed.extend(best.into_values());
    unkeyed
}

/// Whether `winner` makes `other` redundant. Only a higher-ranked entry can
/// drop a lower-ranked one, so the top entry of any cluster always survives.
fn supersedes(winner: &LedgerEntry, other: &LedgerEntry) -> bool {
    if winner.entry_type != other.entry_type || !winner.is_success() || !other.is_success() {
        return false;
    }
    if (winner.created_at - other.created_at).abs() > DUPLICATE_WINDOW {
        return false;
    }
    if winner.preference(other) != Ordering::Less {
        return false;
    }
    // Every wallet-native row was written under its own lock
    if winner.is_wallet_native() && other.is_wallet_native() {
        return false;
    }

    if other.is_zero_amount() && !winner.is_zero_amount() {
        return true;
    }
    if other.is_invoice_style_reference() && winner.is_checkout_reference() {
        return true;
    }

    // Two raw logs with distinct references are distinct payments
    let distinct_references = match (&winner.reference_id, &other.reference_id) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    };
    if winner.source_collection == other.source_collection && distinct_references {
        return false;
    }

    !other.is_zero_amount() && winner.amount == other.amount && winner.currency == other.currency
}

fn collapse_near_duplicates(entries: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
    let keep: Vec<bool> = entries
        .iter()
        .enumerate()
        .map(|(i, candidate)| {
            !entries
                .iter()
                .enumerate()
                .any(|(j, other)| i != j && supersedes(other, candidate))
        })
        .collect();

    entries
        .into_iter()
        .zip(keep)
        .filter_map(|(entry, keep)| keep.then_some(entry))
        .collect()
}

/// Ledger read request
#[derive(Debug, Clone)]
pub struct LedgerQuery {
    pub doctor_id: Uuid,
    /// Also match processor logs recorded only with this email
    pub email: Option<String>,
    pub limit: usize,
}

/// Read path over both sources
pub struct LedgerService {
    store: Arc<dyn WalletStore>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self { store }
    }

    /// Merged ledger for a tenant the caller owns
    pub async fn ledger_for_owner(
        &self,
        caller_email: &str,
        query: LedgerQuery,
    ) -> BillingResult<Vec<LedgerEntry>> {
        let doctor = self
            .store
            .get_doctor(query.doctor_id)
            .await?
            .ok_or(BillingError::DoctorNotFound(query.doctor_id))?;

        if !doctor.owned_by(caller_email) {
            tracing::warn!(
                doctor_id = %query.doctor_id,
                "Ledger read denied: caller does not own tenant"
            );
            return Err(BillingError::Forbidden("ledger belongs to another tenant".into()));
        }
        if let Some(email) = &query.email {
            if !doctor.owned_by(email) {
                return Err(BillingError::Forbidden(
                    "email fallback must be the tenant's own email".into(),
                ));
            }
        }

        self.ledger(query).await
    }

    /// Merged ledger without ownership checks (admin and worker use)
    pub async fn ledger(&self, query: LedgerQuery) -> BillingResult<Vec<LedgerEntry>> {
        let limit = query.limit.clamp(1, MAX_LEDGER_LIMIT);
        let fetch = limit * FETCH_MULTIPLIER;

        let mut records: Vec<LedgerRecord> = self
            .store
            .list_wallet_payments(query.doctor_id, fetch)
            .await?
            .into_iter()
            .map(LedgerRecord::Wallet)
            .collect();

        records.extend(
            self.store
                .list_payment_logs_by_doctor(query.doctor_id, fetch)
                .await?
                .into_iter()
                .map(LedgerRecord::Processor),
        );

        if let Some(email) = query.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
            records.extend(
                self.store
                    .list_payment_logs_by_email(email, fetch)
                    .await?
                    .into_iter()
                    .map(LedgerRecord::Processor),
            );
        }

        let fetched = records.len();
        let merged = merge_ledger(records, limit);

        tracing::debug!(
            doctor_id = %query.doctor_id,
            fetched = fetched,
            returned = merged.len(),
            "Ledger merged"
        );

        Ok(merged)
    }
}
