use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{CartKind, VendorKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReconciliationStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOrder {
    pub vendor: VendorKey,
    pub reason: String,
}

/// A captured payment whose vendor orders are not all placed. Worked by
/// support; nothing is refunded automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub kind: CartKind,
    pub transaction_reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub failed: Vec<FailedOrder>,
    /// Placement rounds that ended with at least one failure.
    pub attempts: u32,
    pub status: ReconciliationStatus,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub resolution: Option<String>,
}

impl ReconciliationRecord {
    pub fn open(
        booking_id: Uuid,
        user_id: Uuid,
        kind: CartKind,
        transaction_reference: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
        failed: Vec<FailedOrder>,
    ) -> Self {
        let now = Utc::now();
        Self {
            booking_id,
            user_id,
            kind,
            transaction_reference: transaction_reference.into(),
            amount,
            currency: currency.into(),
            failed,
            attempts: 1,
            status: ReconciliationStatus::Open,
            opened_at: now,
            updated_at: now,
            resolution: None,
        }
    }
}

/// Manual queue of paid-but-unbooked bookings, one record per booking.
#[derive(Default)]
pub struct ReconciliationQueue {
    records: DashMap<Uuid, ReconciliationRecord>,
}

impl ReconciliationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a record, or refreshes the failure list of an existing one and
    /// reopens it.
    pub fn enqueue(&self, record: ReconciliationRecord) -> ReconciliationRecord {
        let booking_id = record.booking_id;
        let stored = self
            .records
            .entry(booking_id)
            .and_modify(|existing| {
                existing.failed = record.failed.clone();
                existing.attempts += 1;
                existing.status = ReconciliationStatus::Open;
                existing.resolution = None;
                existing.updated_at = Utc::now();
            })
            .or_insert(record)
            .clone();
        warn!(
            %booking_id,
            transaction = %stored.transaction_reference,
            attempts = stored.attempts,
            "booking queued for manual reconciliation"
        );
        stored
    }

    /// Records, oldest first, optionally restricted to one status.
    pub fn list(&self, status: Option<ReconciliationStatus>) -> Vec<ReconciliationRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| r.opened_at);
        records
    }

    pub fn get(&self, booking_id: Uuid) -> Option<ReconciliationRecord> {
        self.records.get(&booking_id).map(|r| r.clone())
    }

    pub fn open_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == ReconciliationStatus::Open)
            .count()
    }

    pub fn resolve(&self, booking_id: Uuid, note: impl Into<String>) -> Result<ReconciliationRecord, ServiceError> {
        let mut record = self.records.get_mut(&booking_id).ok_or_else(|| {
            ServiceError::NotFound(format!("no reconciliation record for booking {}", booking_id))
        })?;
        record.status = ReconciliationStatus::Resolved;
        record.resolution = Some(note.into());
        record.updated_at = Utc::now();
        info!(%booking_id, "reconciliation resolved");
        Ok(record.clone())
    }

    /// Resolves the record for `booking_id` if one is open; used after a
    /// successful retry.
    pub fn resolve_if_open(&self, booking_id: Uuid, note: &str) -> bool {
        let open = self
            .records
            .get(&booking_id)
            .map_or(false, |r| r.status == ReconciliationStatus::Open);
        open && self.resolve(booking_id, note).is_ok()
    }
}
