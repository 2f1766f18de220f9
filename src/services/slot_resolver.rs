use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::errors::ServiceError;
use crate::models::slot::filter_by_period;
use crate::models::{RawSlot, SlotKey, SlotQuery, TimeSlot, VendorKey};
use crate::retry::RetryPolicy;

/// Anything that can list raw slots for a query: the clinic service, a
/// partner clinic's own API.
#[async_trait]
pub trait SlotSource: Send + Sync {
    async fn fetch_slots(&self, query: &SlotQuery) -> Result<Vec<RawSlot>, ServiceError>;
}

/// Turns a date and period into bookable, normalised slots for one vendor.
pub struct SlotResolver {
    sources: HashMap<VendorKey, Arc<dyn SlotSource>>,
    retry: RetryPolicy,
    offset: FixedOffset,
}

impl SlotResolver {
    pub fn new(retry: RetryPolicy, offset: FixedOffset) -> Self {
        Self {
            sources: HashMap::new(),
            retry,
            offset,
        }
    }

    pub fn with_source(mut self, vendor: VendorKey, source: Arc<dyn SlotSource>) -> Self {
        self.sources.insert(vendor, source);
        self
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub async fn list_slots(&self, query: &SlotQuery) -> Result<Vec<TimeSlot>, ServiceError> {
        self.list_slots_at(query, Utc::now()).await
    }

    /// Lists slots as of `now`: normalised to 24-hour times, restricted to the
    /// requested period, strictly in the future, unique by (vendor, slot id)
    /// and ordered by start time.
    #[instrument(skip(self), fields(vendor = %query.vendor, date = %query.date, period = %query.period))]
    pub async fn list_slots_at(
        &self,
        query: &SlotQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimeSlot>, ServiceError> {
        if query.provider_ref.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "a doctor or center must be selected".to_string(),
            ));
        }
        if query.vendor.requires_branch()
            && query.branch_id.as_deref().map_or(true, |b| b.trim().is_empty())
        {
            return Err(ServiceError::ValidationError(format!(
                "{} requires a branch to be selected",
                query.vendor
            )));
        }
        let source = self.sources.get(&query.vendor).ok_or_else(|| {
            ServiceError::ValidationError(format!("slot listing unavailable for {}", query.vendor))
        })?;

        let fetched = self
            .retry
            .run(
                "slots.fetch",
                |_| source.fetch_slots(query),
                |result| matches!(result, Err(e) if e.is_retryable()),
            )
            .await;

        let raw = match fetched {
            Ok(raw) => raw,
            Err(ServiceError::NotFound(reason)) => {
                debug!(%reason, "no slot listing for query");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        Ok(self.normalise(query, raw, now))
    }

    fn normalise(&self, query: &SlotQuery, raw: Vec<RawSlot>, now: DateTime<Utc>) -> Vec<TimeSlot> {
        let received = raw.len();
        let mut seen: HashSet<SlotKey> = HashSet::new();
        let parsed = raw.into_iter().filter_map(|raw| normalise_one(query, raw));
        let mut slots: Vec<TimeSlot> = filter_by_period(parsed, query.period)
            .into_iter()
            .filter(|slot| slot.is_bookable_at(now, self.offset))
            .filter(|slot| seen.insert(slot.key()))
            .collect();
        slots.sort_by(|a, b| (a.date, a.start).cmp(&(b.date, b.start)));
        debug!(received, kept = slots.len(), "slots normalised");
        slots
    }

    pub fn ensure_bookable(&self, slot: &TimeSlot) -> Result<(), ServiceError> {
        self.ensure_bookable_at(slot, Utc::now())
    }

    /// Selection-time check; an expired slot is refused, not just hidden.
    pub fn ensure_bookable_at(&self, slot: &TimeSlot, now: DateTime<Utc>) -> Result<(), ServiceError> {
        ensure_bookable_at(slot, now, self.offset)
    }
}

pub fn ensure_bookable_at(
    slot: &TimeSlot,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<(), ServiceError> {
    if slot.is_bookable_at(now, offset) {
        Ok(())
    } else {
        Err(ServiceError::ValidationError(format!(
            "slot {} on {} has already started",
            slot.canonical_time(),
            slot.date
        )))
    }
}

fn normalise_one(query: &SlotQuery, raw: RawSlot) -> Option<TimeSlot> {
    let date = raw.date.unwrap_or(query.date);
    let text = match raw.end.as_deref().map(str::trim) {
        Some(end) if !end.is_empty() => format!("{} - {}", raw.start.trim(), end),
        _ => raw.start.trim().to_string(),
    };
    let slot_id = raw
        .slot_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| format!("{}@{}", date, text));

    match TimeSlot::from_raw(query.vendor, slot_id, date, &text) {
        Ok(slot) => Some(slot),
        Err(e) => {
            warn!(vendor = %query.vendor, raw_time = %text, error = %e, "dropping unparseable slot");
            None
        }
    }
}
