use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::cart::{Beneficiary, CartEntry, CartKind};
use super::slot::TimeSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactAddress {
    pub line1: String,
    #[serde(default)]
    pub city: Option<String>,
    pub pincode: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

/// Demographics of the person being booked for, as held by the dependents service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeneficiaryProfile {
    pub reference: Beneficiary,
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub gender: Gender,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    /// Used when no date of birth is on record.
    #[serde(default)]
    pub age_years: Option<u32>,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<ContactAddress>,
}

impl BeneficiaryProfile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Age in whole years on `on`, from the date of birth when known.
    pub fn age_on(&self, on: NaiveDate) -> Option<u32> {
        match self.date_of_birth {
            Some(dob) => {
                let mut years = on.year() - dob.year();
                if (on.month(), on.day()) < (dob.month(), dob.day()) {
                    years -= 1;
                }
                u32::try_from(years).ok()
            }
            None => self.age_years,
        }
    }

    /// Date of birth, or 1 January of the year implied by `age_years`.
    pub fn birth_date_or_estimate(&self, on: NaiveDate) -> Option<NaiveDate> {
        self.date_of_birth.or_else(|| {
            let age = i32::try_from(self.age_years?).ok()?;
            NaiveDate::from_ymd_opt(on.year() - age, 1, 1)
        })
    }
}

/// Immutable snapshot assembled when a booking saga starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub booking_id: Uuid,
    /// Locally generated order id; replays with the same key are refused.
    pub idempotency_key: String,
    pub user_id: Uuid,
    pub kind: CartKind,
    pub beneficiary: BeneficiaryProfile,
    pub entries: Vec<CartEntry>,
    pub slot: TimeSlot,
    #[serde(default)]
    pub notes: Option<String>,
    /// Gross total before sponsorship.
    pub amount: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl BookingRequest {
    pub fn new_idempotency_key(booking_id: Uuid) -> String {
        format!(
            "ORD-{}",
            booking_id.simple().to_string()[..12].to_uppercase()
        )
    }
}

/// Normalised outcome of one vendor order call. Vendor-specific messages never
/// cross the adapter boundary in any other form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VendorOrderResult {
    Placed { vendor_order_id: String },
    Rejected { reason: String },
    TransientFailure { reason: String },
}

impl VendorOrderResult {
    pub fn placed(vendor_order_id: impl Into<String>) -> Self {
        Self::Placed {
            vendor_order_id: vendor_order_id.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::TransientFailure {
            reason: reason.into(),
        }
    }

    pub fn is_placed(&self) -> bool {
        matches!(self, Self::Placed { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientFailure { .. })
    }

    pub fn vendor_order_id(&self) -> Option<&str> {
        match self {
            Self::Placed { vendor_order_id } => Some(vendor_order_id),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Placed { .. } => None,
            Self::Rejected { reason } | Self::TransientFailure { reason } => Some(reason),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Placed { .. } => "placed",
            Self::Rejected { .. } => "rejected",
            Self::TransientFailure { .. } => "transient_failure",
        }
    }
}
