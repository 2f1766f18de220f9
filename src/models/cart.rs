use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use super::slot::TimeSlot;
use super::vendor::VendorKey;

/// Cart partition. Consultations and diagnostics are booked through separate
/// sagas and never clobber each other's entries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CartKind {
    Appointment,
    Diagnostic,
}

/// Who the service is for: the account holder or exactly one dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Beneficiary {
    AccountHolder,
    Dependent { dependent_id: Uuid },
}

/// Set on an entry whose payment was captured but whose vendor order could not
/// be confirmed. The entry stays in the cart until support or a retry clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BookingMarker {
    PaymentReceivedBookingPending {
        booking_id: Uuid,
        transaction_id: String,
        vendor: VendorKey,
        reason: String,
        marked_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppointmentEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub beneficiary: Beneficiary,
    pub vendor: VendorKey,
    pub doctor_id: String,
    pub service_id: String,
    pub unit_price: Decimal,
    #[serde(default)]
    pub slot: Option<TimeSlot>,
    #[serde(default)]
    pub remote_item_id: Option<String>,
    #[serde(default)]
    pub marker: Option<BookingMarker>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub beneficiary: Beneficiary,
    pub vendor: VendorKey,
    pub test_id: String,
    pub test_name: String,
    pub center_id: String,
    #[serde(default)]
    pub branch_id: Option<String>,
    /// Free-text product code some vendors want instead of the test id.
    #[serde(default)]
    pub product_code: Option<String>,
    pub unit_price: Decimal,
    pub quantity: u32,
    #[serde(default)]
    pub slot: Option<TimeSlot>,
    #[serde(default)]
    pub remote_item_id: Option<String>,
    #[serde(default)]
    pub marker: Option<BookingMarker>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CartEntry {
    Appointment(AppointmentEntry),
    Diagnostic(DiagnosticEntry),
}

/// De-duplication key: one pending appointment per user, diagnostics unique by
/// (test, vendor).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Appointment,
    Diagnostic { test_id: String, vendor: VendorKey },
}

impl CartEntry {
    pub fn id(&self) -> Uuid {
        match self {
            CartEntry::Appointment(e) => e.id,
            CartEntry::Diagnostic(e) => e.id,
        }
    }

    fn set_id(&mut self, id: Uuid) {
        match self {
            CartEntry::Appointment(e) => e.id = id,
            CartEntry::Diagnostic(e) => e.id = id,
        }
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            CartEntry::Appointment(e) => e.user_id,
            CartEntry::Diagnostic(e) => e.user_id,
        }
    }

    pub fn beneficiary(&self) -> Beneficiary {
        match self {
            CartEntry::Appointment(e) => e.beneficiary,
            CartEntry::Diagnostic(e) => e.beneficiary,
        }
    }

    pub fn vendor(&self) -> VendorKey {
        match self {
            CartEntry::Appointment(e) => e.vendor,
            CartEntry::Diagnostic(e) => e.vendor,
        }
    }

    pub fn kind(&self) -> CartKind {
        match self {
            CartEntry::Appointment(_) => CartKind::Appointment,
            CartEntry::Diagnostic(_) => CartKind::Diagnostic,
        }
    }

    /// Doctor id for consultations, test id for diagnostics.
    pub fn service_ref(&self) -> &str {
        match self {
            CartEntry::Appointment(e) => &e.service_id,
            CartEntry::Diagnostic(e) => &e.test_id,
        }
    }

    pub fn unit_price(&self) -> Decimal {
        match self {
            CartEntry::Appointment(e) => e.unit_price,
            CartEntry::Diagnostic(e) => e.unit_price,
        }
    }

    /// Appointments are always quantity 1.
    pub fn quantity(&self) -> u32 {
        match self {
            CartEntry::Appointment(_) => 1,
            CartEntry::Diagnostic(e) => e.quantity.max(1),
        }
    }

    pub fn line_total(&self) -> Decimal {
        self.unit_price() * Decimal::from(self.quantity())
    }

    pub fn slot(&self) -> Option<&TimeSlot> {
        match self {
            CartEntry::Appointment(e) => e.slot.as_ref(),
            CartEntry::Diagnostic(e) => e.slot.as_ref(),
        }
    }

    pub fn set_slot(&mut self, slot: Option<TimeSlot>) {
        match self {
            CartEntry::Appointment(e) => e.slot = slot,
            CartEntry::Diagnostic(e) => e.slot = slot,
        }
    }

    pub fn remote_item_id(&self) -> Option<&str> {
        match self {
            CartEntry::Appointment(e) => e.remote_item_id.as_deref(),
            CartEntry::Diagnostic(e) => e.remote_item_id.as_deref(),
        }
    }

    pub fn set_remote_item_id(&mut self, item_id: Option<String>) {
        match self {
            CartEntry::Appointment(e) => e.remote_item_id = item_id,
            CartEntry::Diagnostic(e) => e.remote_item_id = item_id,
        }
    }

    pub fn marker(&self) -> Option<&BookingMarker> {
        match self {
            CartEntry::Appointment(e) => e.marker.as_ref(),
            CartEntry::Diagnostic(e) => e.marker.as_ref(),
        }
    }

    pub fn set_marker(&mut self, marker: Option<BookingMarker>) {
        match self {
            CartEntry::Appointment(e) => e.marker = marker,
            CartEntry::Diagnostic(e) => e.marker = marker,
        }
    }

    pub fn dedup_key(&self) -> EntryKey {
        match self {
            CartEntry::Appointment(_) => EntryKey::Appointment,
            CartEntry::Diagnostic(e) => EntryKey::Diagnostic {
                test_id: e.test_id.clone(),
                vendor: e.vendor,
            },
        }
    }
}

/// Ordered per-user cart as cached locally and mirrored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub user_id: Uuid,
    pub entries: Vec<CartEntry>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn empty(user_id: Uuid) -> Self {
        Self {
            user_id,
            entries: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Inserts `entry`, or replaces the entry sharing its de-duplication key in
    /// place. The replaced entry keeps its id, position, remote item id and
    /// booking marker. Returns the id the entry is stored under.
    pub fn upsert(&mut self, mut entry: CartEntry) -> Uuid {
        let key = entry.dedup_key();
        let id = match self.entries.iter_mut().find(|e| e.dedup_key() == key) {
            Some(existing) => {
                let id = existing.id();
                entry.set_id(id);
                if let Some(item_id) = existing.remote_item_id() {
                    entry.set_remote_item_id(Some(item_id.to_string()));
                }
                entry.set_marker(existing.marker().cloned());
                *existing = entry;
                id
            }
            None => {
                let id = entry.id();
                self.entries.push(entry);
                id
            }
        };
        self.touch();
        id
    }

    pub fn remove(&mut self, entry_id: Uuid) -> Option<CartEntry> {
        let idx = self.entries.iter().position(|e| e.id() == entry_id)?;
        self.touch();
        Some(self.entries.remove(idx))
    }

    /// Removes entries of `kind` only. Returns how many were removed.
    pub fn clear_kind(&mut self, kind: CartKind) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.kind() != kind);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.touch();
        }
        removed
    }

    /// Entries whose payment was taken but whose booking is not confirmed.
    pub fn marked(&self) -> impl Iterator<Item = &CartEntry> {
        self.entries.iter().filter(|e| e.marker().is_some())
    }

    pub fn get(&self, entry_id: Uuid) -> Option<&CartEntry> {
        self.entries.iter().find(|e| e.id() == entry_id)
    }

    pub fn get_mut(&mut self, entry_id: Uuid) -> Option<&mut CartEntry> {
        self.entries.iter_mut().find(|e| e.id() == entry_id)
    }

    pub fn entries_of(&self, kind: CartKind) -> impl Iterator<Item = &CartEntry> {
        self.entries.iter().filter(move |e| e.kind() == kind)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
