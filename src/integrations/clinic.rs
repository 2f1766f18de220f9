use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use strum::Display;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::envelope::{decode_items, decode_single};
use super::{checked_body, http_client, join_url};
use crate::errors::ServiceError;
use crate::models::{Beneficiary, Cart, CartEntry, RawSlot, SlotQuery, TimeSlot};
use crate::services::slot_resolver::SlotSource;

#[derive(Debug, Clone, Serialize)]
pub struct AppointmentRequest {
    pub user_id: Uuid,
    pub doctor_id: String,
    pub beneficiary: Beneficiary,
    pub notes: Option<String>,
}

/// Clinic-side confirmation of a paid consultation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppointmentConfirmation {
    #[serde(alias = "appointmentId", alias = "appointment_id", alias = "id")]
    pub booking_id: String,
    #[serde(default)]
    pub confirmed: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LookupKind {
    Specializations,
    Languages,
    Pincodes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupOption {
    #[serde(alias = "value")]
    pub id: String,
    #[serde(alias = "label", alias = "title")]
    pub name: String,
}

/// Consultation side of the clinic service.
#[async_trait]
pub trait ClinicApi: Send + Sync {
    /// Opens a case for a consultation ahead of payment; returns the case id.
    async fn create_appointment(&self, request: &AppointmentRequest) -> Result<String, ServiceError>;

    /// Books the paid slot against an existing case.
    async fn confirm_appointment(
        &self,
        case_id: &str,
        slot: &TimeSlot,
        payment_reference: &str,
        amount: Decimal,
    ) -> Result<AppointmentConfirmation, ServiceError>;

    /// Read-only option lists. Any failure yields an empty list.
    async fn lookup(&self, kind: LookupKind) -> Vec<LookupOption>;
}

/// Backend cart record mirrored from the local cache.
#[async_trait]
pub trait RemoteCart: Send + Sync {
    /// Current remote entries; an unknown user has an empty cart.
    async fn fetch(&self, user_id: Uuid) -> Result<Vec<CartEntry>, ServiceError>;

    /// Replaces the remote cart with `cart`.
    async fn push(&self, cart: &Cart) -> Result<(), ServiceError>;

    /// Commits one line item with its sponsorship discount; returns the remote item id.
    async fn commit_item(
        &self,
        user_id: Uuid,
        entry: &CartEntry,
        discount_percent: Decimal,
    ) -> Result<String, ServiceError>;

    /// Writes the final appointment date/time onto a committed item.
    async fn update_schedule(
        &self,
        user_id: Uuid,
        item_id: &str,
        slot: &TimeSlot,
    ) -> Result<(), ServiceError>;
}

#[derive(Debug, Deserialize)]
struct ClinicSlot {
    #[serde(default, alias = "slot_id", alias = "slotId")]
    id: Option<serde_json::Value>,
    #[serde(default)]
    date: Option<NaiveDate>,
    #[serde(alias = "startTime", alias = "time")]
    start_time: String,
    #[serde(default, alias = "endTime")]
    end_time: Option<String>,
}

impl From<ClinicSlot> for RawSlot {
    fn from(slot: ClinicSlot) -> Self {
        let slot_id = slot.id.and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        RawSlot {
            slot_id,
            date: slot.date,
            start: slot.start_time,
            end: slot.end_time,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CaseCreated {
    #[serde(alias = "caseId", alias = "id")]
    case_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CartItemCreated {
    #[serde(alias = "cartItemId", alias = "item_id", alias = "id")]
    cart_item_id: serde_json::Value,
}

fn id_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// reqwest client for the clinic slot/booking/cart service.
#[derive(Clone)]
pub struct HttpClinicClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClinicClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }
}

#[async_trait]
impl SlotSource for HttpClinicClient {
    #[instrument(skip(self), fields(vendor = %query.vendor))]
    async fn fetch_slots(&self, query: &SlotQuery) -> Result<Vec<RawSlot>, ServiceError> {
        let date = query.date.format("%Y-%m-%d").to_string();
        let period = query.period.to_string();
        let vendor = query.vendor.to_string();
        let response = self
            .client
            .get(self.url("/slots"))
            .query(&[
                ("provider_id", query.provider_ref.as_str()),
                ("date", date.as_str()),
                ("period", period.as_str()),
                ("vendor", vendor.as_str()),
            ])
            .send()
            .await?;
        let body = checked_body("clinic.slots", response).await?;
        let slots: Vec<ClinicSlot> = decode_items("clinic.slots", &body);
        Ok(slots.into_iter().map(RawSlot::from).collect())
    }
}

#[async_trait]
impl ClinicApi for HttpClinicClient {
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    async fn create_appointment(&self, request: &AppointmentRequest) -> Result<String, ServiceError> {
        let response = self
            .client
            .post(self.url("/appointments"))
            .json(request)
            .send()
            .await?;
        let body = checked_body("clinic.appointments", response).await?;
        let created: CaseCreated = decode_single(&body)?;
        id_string(created.case_id).ok_or_else(|| {
            ServiceError::AppointmentFailed("clinic returned no case id".to_string())
        })
    }

    #[instrument(skip(self, slot, amount))]
    async fn confirm_appointment(
        &self,
        case_id: &str,
        slot: &TimeSlot,
        payment_reference: &str,
        amount: Decimal,
    ) -> Result<AppointmentConfirmation, ServiceError> {
        let response = self
            .client
            .post(self.url(&format!("/appointments/{}/confirm", case_id)))
            .json(&json!({
                "slot_id": slot.slot_id,
                "date": slot.date.format("%Y-%m-%d").to_string(),
                "start_time": slot.start.format("%H:%M").to_string(),
                "payment_reference": payment_reference,
                "amount": amount,
            }))
            .send()
            .await?;
        let body = checked_body("clinic.confirm", response).await?;
        debug!(body = %String::from_utf8_lossy(&body), "clinic confirmation");
        Ok(decode_single(&body)?)
    }

    async fn lookup(&self, kind: LookupKind) -> Vec<LookupOption> {
        let source = format!("clinic.lookup.{}", kind);
        let response = match self
            .client
            .get(self.url(&format!("/lookups/{}", kind)))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, %kind, "lookup failed; returning no options");
                return Vec::new();
            }
        };
        match checked_body(&source, response).await {
            Ok(body) => decode_items(&source, &body),
            Err(e) => {
                warn!(error = %e, %kind, "lookup failed; returning no options");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl RemoteCart for HttpClinicClient {
    #[instrument(skip(self))]
    async fn fetch(&self, user_id: Uuid) -> Result<Vec<CartEntry>, ServiceError> {
        let response = self
            .client
            .get(self.url(&format!("/carts/{}", user_id)))
            .send()
            .await?;
        match checked_body("clinic.cart", response).await {
            Ok(body) => Ok(decode_items("clinic.cart", &body)),
            Err(ServiceError::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, cart), fields(user_id = %cart.user_id))]
    async fn push(&self, cart: &Cart) -> Result<(), ServiceError> {
        let response = self
            .client
            .put(self.url(&format!("/carts/{}", cart.user_id)))
            .json(&json!({ "data": cart.entries }))
            .send()
            .await?;
        checked_body("clinic.cart", response).await?;
        Ok(())
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.id()))]
    async fn commit_item(
        &self,
        user_id: Uuid,
        entry: &CartEntry,
        discount_percent: Decimal,
    ) -> Result<String, ServiceError> {
        let gross = entry.line_total();
        let net = gross - (gross * discount_percent / Decimal::from(100));
        let response = self
            .client
            .post(self.url(&format!("/carts/{}/items", user_id)))
            .json(&json!({
                "entry": entry,
                "discount_percent": discount_percent,
                "net_price": net.round_dp(2),
            }))
            .send()
            .await?;
        let body = checked_body("clinic.cart_items", response).await?;
        let created: CartItemCreated = decode_single(&body)?;
        id_string(created.cart_item_id).ok_or_else(|| {
            ServiceError::CartCommitFailed("cart service returned no item id".to_string())
        })
    }

    #[instrument(skip(self, slot))]
    async fn update_schedule(
        &self,
        user_id: Uuid,
        item_id: &str,
        slot: &TimeSlot,
    ) -> Result<(), ServiceError> {
        let response = self
            .client
            .patch(self.url(&format!("/carts/{}/items/{}/schedule", user_id, item_id)))
            .json(&json!({
                "vendor": slot.vendor,
                "slot_id": slot.slot_id,
                "date": slot.date.format("%Y-%m-%d").to_string(),
                "start_time": slot.start.format("%H:%M").to_string(),
                "end_time": slot.end.map(|t| t.format("%H:%M").to_string()),
            }))
            .send()
            .await?;
        checked_body("clinic.schedule", response).await?;
        Ok(())
    }
}
