use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{diagnostic_entries, gender_code, read_response, remember, PlacementContext, VendorAdapter};
use crate::config::VendorEndpoint;
use crate::errors::ServiceError;
use crate::integrations::envelope::{decode_items, decode_single};
use crate::integrations::{checked_body, http_client, join_url};
use crate::models::{BookingRequest, RawSlot, SlotQuery, VendorKey, VendorOrderResult};
use crate::repositories::{VendorReference, VendorReferenceRepository};
use crate::services::slot_resolver::SlotSource;

/// Slot-based clinic partner. Every call is scoped to a branch, and slots come
/// back as `{slotId, time: "10:00 AM - 10:30 AM"}`.
pub struct PartnerClinicAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    references: Arc<dyn VendorReferenceRepository>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartnerSlot {
    slot_id: serde_json::Value,
    time: String,
    #[serde(default)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartnerBookingResponse {
    success: bool,
    #[serde(default)]
    booking_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl PartnerClinicAdapter {
    pub fn new(
        endpoint: &VendorEndpoint,
        timeout: Duration,
        references: Arc<dyn VendorReferenceRepository>,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: endpoint.base_url.clone(),
            api_key: endpoint.api_key.clone(),
            references,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, join_url(&self.base_url, path));
        match &self.api_key {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    fn interpret(body: &[u8]) -> Result<PartnerBookingResponse, VendorOrderResult> {
        decode_single::<PartnerBookingResponse>(body).map_err(|e| {
            warn!(vendor = %VendorKey::PartnerClinic, error = %e, "unreadable booking response");
            // The order may exist; a blind retry could book it twice.
            VendorOrderResult::rejected("unreadable confirmation from partner clinic")
        })
    }
}

#[async_trait]
impl SlotSource for PartnerClinicAdapter {
    #[instrument(skip(self), fields(vendor = %VendorKey::PartnerClinic))]
    async fn fetch_slots(&self, query: &SlotQuery) -> Result<Vec<RawSlot>, ServiceError> {
        let branch = query.branch_id.clone().unwrap_or_default();
        let date = query.date.format("%Y-%m-%d").to_string();
        let response = self
            .request(reqwest::Method::GET, "/api/v1/slots")
            .query(&[
                ("branchId", branch.as_str()),
                ("doctorId", query.provider_ref.as_str()),
                ("date", date.as_str()),
            ])
            .send()
            .await?;
        let body = checked_body("partner_clinic.slots", response).await?;
        let slots: Vec<PartnerSlot> = decode_items("partner_clinic.slots", &body);
        Ok(slots
            .into_iter()
            .filter_map(|s| {
                let slot_id = match s.slot_id {
                    serde_json::Value::String(id) => id,
                    serde_json::Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some(RawSlot {
                    slot_id: Some(slot_id),
                    date: s.date,
                    start: s.time,
                    end: None,
                })
            })
            .collect())
    }
}

#[async_trait]
impl VendorAdapter for PartnerClinicAdapter {
    fn vendor(&self) -> VendorKey {
        VendorKey::PartnerClinic
    }

    #[instrument(skip(self, request, ctx), fields(booking_id = %ctx.booking_id))]
    async fn place_order(&self, request: &BookingRequest, ctx: &PlacementContext) -> VendorOrderResult {
        let entries = diagnostic_entries(request);
        let Some(first) = entries.first() else {
            return VendorOrderResult::rejected("nothing to book with the partner clinic");
        };
        let Some(branch_id) = first.branch_id.as_deref() else {
            return VendorOrderResult::rejected("no branch selected for the partner clinic");
        };
        let slot = first.slot.as_ref().unwrap_or(&request.slot);
        let patient = &request.beneficiary;

        let body = json!({
            "branchId": branch_id,
            "doctorId": first.center_id,
            "slotId": slot.slot_id,
            "date": slot.date.format("%Y-%m-%d").to_string(),
            "patient": {
                "name": patient.full_name(),
                "age": patient.age_on(Utc::now().date_naive()),
                "gender": gender_code(patient.gender),
                "phone": patient.phone,
                "email": patient.email,
            },
            "tests": entries.iter().map(|e| e.test_id.as_str()).collect::<Vec<_>>(),
            "referenceId": request.idempotency_key,
            "amountPaid": ctx.amount_paid,
            "paymentRef": ctx.payment_reference,
        });

        let sent = self
            .request(reqwest::Method::POST, "/api/v1/bookings")
            .json(&body)
            .send()
            .await;
        let raw = match read_response(VendorKey::PartnerClinic, sent).await {
            Ok(raw) => raw,
            Err(result) => return result,
        };
        let response = match Self::interpret(&raw) {
            Ok(response) => response,
            Err(result) => return result,
        };

        match (response.success, response.booking_id) {
            (true, Some(booking_id)) if !booking_id.is_empty() => {
                info!(%booking_id, "partner clinic booking placed");
                remember(
                    &self.references,
                    VendorReference::new(ctx.booking_id, VendorKey::PartnerClinic, &booking_id)
                        .with_attribute("branch_id", branch_id),
                )
                .await;
                VendorOrderResult::placed(booking_id)
            }
            (true, _) => VendorOrderResult::rejected("partner clinic confirmed without a booking id"),
            (false, _) => VendorOrderResult::rejected(
                response
                    .message
                    .unwrap_or_else(|| "partner clinic declined the booking".to_string()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_wrapped_booking_response() {
        let parsed = PartnerClinicAdapter::interpret(
            br#"{"data":{"success":false,"message":"Slot no longer available"}}"#,
        )
        .unwrap();
        assert!(!parsed.success);
        assert_eq!(parsed.message.as_deref(), Some("Slot no longer available"));
    }

    #[test]
    fn garbage_body_is_not_retried() {
        let result = PartnerClinicAdapter::interpret(b"<html>").unwrap_err();
        assert!(matches!(result, VendorOrderResult::Rejected { .. }));
    }
}
