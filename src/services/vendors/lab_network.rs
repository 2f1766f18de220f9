use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{diagnostic_entries, gender_code, read_response, remember, PlacementContext, VendorAdapter};
use crate::config::VendorEndpoint;
use crate::errors::ServiceError;
use crate::integrations::envelope::decode_single;
use crate::integrations::{http_client, join_url};
use crate::models::{BeneficiaryProfile, BookingRequest, Gender, VendorKey, VendorOrderResult};
use crate::repositories::{VendorReference, VendorReferenceRepository};

const SUCCESS_CODE: i64 = 200;

#[derive(Debug, Deserialize)]
struct LabResponse {
    #[serde(alias = "responseCode", alias = "ResponseCode")]
    response_code: Value,
    #[serde(default, alias = "responseDescription", alias = "ResponseDescription")]
    response_description: String,
    #[serde(default, alias = "bookingId", alias = "BookingId")]
    booking_id: Option<Value>,
}

fn numeric_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Code and description are checked together: the vendor has been seen to
/// send code 200 with a failure description.
fn interpret(response: LabResponse) -> VendorOrderResult {
    let code = numeric_code(&response.response_code);
    let description = response.response_description.trim().to_string();
    let says_success = description.to_ascii_lowercase().contains("success");
    let booking_id = response.booking_id.and_then(|v| match v {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    match (code, says_success, booking_id) {
        (Some(SUCCESS_CODE), true, Some(id)) => VendorOrderResult::placed(id),
        (Some(SUCCESS_CODE), true, None) => {
            VendorOrderResult::rejected("lab network confirmed without a booking id")
        }
        (Some(c), _, _) if (500..600).contains(&c) => {
            VendorOrderResult::transient(format!("lab network error {}", c))
        }
        _ if description.is_empty() => {
            VendorOrderResult::rejected("lab network declined the booking")
        }
        _ => VendorOrderResult::rejected(description),
    }
}

fn title(profile: &BeneficiaryProfile) -> &'static str {
    match profile.gender {
        Gender::Male => "Mr",
        Gender::Female => "Ms",
        Gender::Other => "Mx",
    }
}

/// Traditional lab network with structured patient demographics and a
/// collection window.
pub struct LabNetworkAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    references: Arc<dyn VendorReferenceRepository>,
}

impl LabNetworkAdapter {
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
}

#[async_trait]
impl VendorAdapter for LabNetworkAdapter {
    fn vendor(&self) -> VendorKey {
        VendorKey::LabNetwork
    }

    #[instrument(skip(self, request, ctx), fields(booking_id = %ctx.booking_id))]
    async fn place_order(&self, request: &BookingRequest, ctx: &PlacementContext) -> VendorOrderResult {
        let entries = diagnostic_entries(request);
        if entries.is_empty() {
            return VendorOrderResult::rejected("nothing to book with the lab network");
        }
        let profile = &request.beneficiary;
        let today = Utc::now().date_naive();
        let Some(dob) = profile.birth_date_or_estimate(today) else {
            return VendorOrderResult::rejected("date of birth or age is required by the lab network");
        };
        let slot = entries
            .first()
            .and_then(|e| e.slot.as_ref())
            .unwrap_or(&request.slot);
        let window_end = slot.end.unwrap_or(slot.start);
        let address = profile.address.as_ref();

        let body = json!({
            "title": title(profile),
            "first_name": profile.first_name,
            "last_name": profile.last_name,
            "dob": dob.format("%Y-%m-%d").to_string(),
            "gender": gender_code(profile.gender),
            "mobile": profile.phone,
            "email": profile.email,
            "address": address.map(|a| a.line1.clone()),
            "pincode": address.map(|a| a.pincode.clone()),
            "collection_date": slot.date.format("%Y-%m-%d").to_string(),
            "collection_window": {
                "from": slot.start.format("%H:%M").to_string(),
                "to": window_end.format("%H:%M").to_string(),
            },
            "tests": entries.iter().map(|e| json!({
                "code": e.product_code.as_deref().unwrap_or(&e.test_id),
                "center_id": e.center_id,
            })).collect::<Vec<_>>(),
            "reference": request.idempotency_key,
            "amount_paid": ctx.amount_paid,
        });

        let mut builder = self
            .client
            .post(join_url(&self.base_url, "/api/booking"))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key);
        }
        let raw = match read_response(VendorKey::LabNetwork, builder.send().await).await {
            Ok(raw) => raw,
            Err(result) => return result,
        };
        let response: LabResponse = match decode_single(&raw) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, body = %String::from_utf8_lossy(&raw), "unreadable booking response");
                return VendorOrderResult::rejected("unreadable confirmation from lab network");
            }
        };

        let result = interpret(response);
        if let Some(id) = result.vendor_order_id() {
            info!(booking = %id, "lab network booking placed");
            remember(
                &self.references,
                VendorReference::new(ctx.booking_id, VendorKey::LabNetwork, id),
            )
            .await;
        } else {
            warn!(outcome = result.label(), reason = ?result.reason(), "lab network booking not placed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(json: &str) -> VendorOrderResult {
        interpret(serde_json::from_str(json).unwrap())
    }

    #[rstest]
    #[case(r#"{"responseCode":200,"responseDescription":"Booking Successful","bookingId":"LN-1"}"#)]
    #[case(r#"{"response_code":"200","response_description":"success","booking_id":"LN-1"}"#)]
    fn code_and_description_confirm(#[case] body: &str) {
        assert_eq!(parse(body), VendorOrderResult::placed("LN-1"));
    }

    #[test]
    fn success_code_alone_is_not_enough() {
        let result = parse(r#"{"responseCode":200,"responseDescription":"Slot Full","bookingId":"LN-1"}"#);
        assert_eq!(result, VendorOrderResult::rejected("Slot Full"));
    }

    #[test]
    fn success_text_with_error_code_is_rejected() {
        let result = parse(r#"{"responseCode":409,"responseDescription":"Success pending review"}"#);
        assert!(matches!(result, VendorOrderResult::Rejected { .. }));
    }

    #[test]
    fn server_side_codes_are_transient() {
        assert!(parse(r#"{"responseCode":503,"responseDescription":"Down"}"#).is_transient());
    }
}
