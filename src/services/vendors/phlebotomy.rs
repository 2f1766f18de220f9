use async_trait::async_trait;
use chrono::{FixedOffset, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{diagnostic_entries, gender_code, read_response, remember, PlacementContext, VendorAdapter};
use crate::config::VendorEndpoint;
use crate::errors::ServiceError;
use crate::integrations::envelope::decode_single;
use crate::integrations::{http_client, join_url};
use crate::models::{BookingRequest, VendorKey, VendorOrderResult};
use crate::repositories::{VendorReference, VendorReferenceRepository};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhlebotomyResponse {
    #[serde(default, alias = "order_link")]
    order_link: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn interpret(response: PhlebotomyResponse) -> Result<(String, String), String> {
    if let Some(error) = response.error.filter(|e| !e.trim().is_empty()) {
        return Err(error);
    }
    match (response.order_link, response.token) {
        (Some(link), Some(token)) if !link.trim().is_empty() && !token.trim().is_empty() => {
            Ok((link, token))
        }
        _ => Err("phlebotomy vendor returned an incomplete confirmation".to_string()),
    }
}

/// On-demand phlebotomy vendor. Wants the exact slot instant with offset and
/// the collection address as coordinates; confirms with an order link and a
/// token, both of which must be present.
pub struct PhlebotomyAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    offset: FixedOffset,
    references: Arc<dyn VendorReferenceRepository>,
}

impl PhlebotomyAdapter {
    pub fn new(
        endpoint: &VendorEndpoint,
        timeout: Duration,
        offset: FixedOffset,
        references: Arc<dyn VendorReferenceRepository>,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: endpoint.base_url.clone(),
            api_key: endpoint.api_key.clone(),
            offset,
            references,
        })
    }
}

#[async_trait]
impl VendorAdapter for PhlebotomyAdapter {
    fn vendor(&self) -> VendorKey {
        VendorKey::Phlebotomy
    }

    #[instrument(skip(self, request, ctx), fields(booking_id = %ctx.booking_id))]
    async fn place_order(&self, request: &BookingRequest, ctx: &PlacementContext) -> VendorOrderResult {
        let entries = diagnostic_entries(request);
        if entries.is_empty() {
            return VendorOrderResult::rejected("nothing to book with the phlebotomy vendor");
        }
        let profile = &request.beneficiary;
        let Some(address) = profile.address.as_ref() else {
            return VendorOrderResult::rejected("a collection address is required");
        };
        let (Some(lat), Some(lng)) = (address.latitude, address.longitude) else {
            return VendorOrderResult::rejected("collection address has no coordinates");
        };
        let slot = entries
            .first()
            .and_then(|e| e.slot.as_ref())
            .unwrap_or(&request.slot);
        let Some(starts_at) = slot.starts_at(self.offset) else {
            return VendorOrderResult::rejected("slot time does not exist in the vendor time zone");
        };

        let body = json!({
            "reference": request.idempotency_key,
            "slotDatetime": starts_at.to_rfc3339_opts(SecondsFormat::Secs, false),
            "customer": {
                "name": profile.full_name(),
                "phone": profile.phone,
                "email": profile.email,
                "gender": gender_code(profile.gender),
                "age": profile.age_on(Utc::now().date_naive()),
            },
            "address": {
                "line1": address.line1,
                "city": address.city,
                "pincode": address.pincode,
                "lat": lat,
                "lng": lng,
            },
            "tests": entries.iter().map(|e| json!({
                "code": e.product_code.as_deref().unwrap_or(&e.test_id),
                "name": e.test_name,
                "quantity": e.quantity,
            })).collect::<Vec<_>>(),
            "amount": ctx.amount_paid,
            "notes": request.notes,
        });

        let mut builder = self
            .client
            .post(join_url(&self.base_url, "/v1/orders"))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let raw = match read_response(VendorKey::Phlebotomy, builder.send().await).await {
            Ok(raw) => raw,
            Err(result) => return result,
        };
        let response: PhlebotomyResponse = match decode_single(&raw) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, body = %String::from_utf8_lossy(&raw), "unreadable order response");
                return VendorOrderResult::rejected("unreadable confirmation from phlebotomy vendor");
            }
        };

        match interpret(response) {
            Ok((order_link, token)) => {
                info!(%token, "phlebotomy order placed");
                remember(
                    &self.references,
                    VendorReference::new(ctx.booking_id, VendorKey::Phlebotomy, &token)
                        .with_attribute("order_link", order_link),
                )
                .await;
                VendorOrderResult::placed(token)
            }
            Err(reason) => {
                warn!(%reason, "phlebotomy order not confirmed");
                VendorOrderResult::rejected(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Result<(String, String), String> {
        interpret(serde_json::from_str(json).unwrap())
    }

    #[test]
    fn link_and_token_together_confirm() {
        assert_eq!(
            parse(r#"{"orderLink":"https://p.example/o/1","token":"tok-1"}"#),
            Ok(("https://p.example/o/1".to_string(), "tok-1".to_string()))
        );
    }

    #[test]
    fn token_alone_is_not_a_confirmation() {
        assert!(parse(r#"{"token":"tok-1"}"#).is_err());
        assert!(parse(r#"{"orderLink":"","token":"tok-1"}"#).is_err());
    }

    #[test]
    fn vendor_error_wins() {
        assert_eq!(
            parse(r#"{"error":"No phlebotomist available","token":"x","orderLink":"y"}"#),
            Err("No phlebotomist available".to_string())
        );
    }
}
