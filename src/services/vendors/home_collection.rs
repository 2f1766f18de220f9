use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use super::{diagnostic_entries, gender_code, read_response, remember, PlacementContext, VendorAdapter};
use crate::config::VendorEndpoint;
use crate::errors::ServiceError;
use crate::integrations::envelope::decode_single;
use crate::integrations::{http_client, join_url};
use crate::models::{BeneficiaryProfile, BookingRequest, VendorKey, VendorOrderResult};
use crate::repositories::{VendorReference, VendorReferenceRepository};

/// The vendor sometimes answers `status: false` with a message that actually
/// confirms the order. Known heuristic, not a contract. Only a message that
/// is nothing but a confirmation counts.
static FALSE_NEGATIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(your\s+|the\s+)?(order\s+(has\s+been\s+|is\s+)?(placed|booked|created|confirmed)(\s+successfully)?|booked\s+successfully|successfully\s+(placed|booked)(\s+(the\s+|your\s+)?order)?)[\s.!]*$",
    )
    .expect("success pattern compiles")
});

static AUTH_FAILURE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(invalid|expired)\s+api\s*key|unauthori[sz]ed|session\s+expired")
        .expect("auth pattern compiles")
});

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(alias = "api_key", alias = "key")]
    api_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    order_no: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Interpretation {
    Placed(Option<String>),
    AuthExpired,
    Declined(String),
}

fn interpret(response: OrderResponse) -> Interpretation {
    if response.status {
        return Interpretation::Placed(response.order_no);
    }
    if FALSE_NEGATIVE_RE.is_match(&response.message) {
        warn!(message = %response.message, "negative status with a success message; treating as placed");
        return Interpretation::Placed(response.order_no);
    }
    if AUTH_FAILURE_RE.is_match(&response.message) {
        return Interpretation::AuthExpired;
    }
    let reason = if response.message.trim().is_empty() {
        "home collection vendor declined the order".to_string()
    } else {
        response.message
    };
    Interpretation::Declined(reason)
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Beneficiary block the vendor expects inside the JSON body.
fn beneficiary_xml(profile: &BeneficiaryProfile, age: Option<u32>) -> String {
    format!(
        "<NewDataSet><Ben_details><Name>{}</Name><Age>{}</Age><Gender>{}</Gender></Ben_details></NewDataSet>",
        escape_xml(&profile.full_name()),
        age.map(|a| a.to_string()).unwrap_or_default(),
        gender_code(profile.gender)
    )
}

/// Postpaid home-collection vendor. Needs an API key from a login call, a
/// day-first appointment date and the beneficiary as an XML block.
pub struct HomeCollectionAdapter {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    api_key: RwLock<Option<String>>,
    references: Arc<dyn VendorReferenceRepository>,
}

impl HomeCollectionAdapter {
    pub fn new(
        endpoint: &VendorEndpoint,
        timeout: Duration,
        references: Arc<dyn VendorReferenceRepository>,
    ) -> Result<Self, ServiceError> {
        let (Some(username), Some(password)) = (endpoint.username.clone(), endpoint.password.clone())
        else {
            return Err(ServiceError::ValidationError(
                "home_collection needs username and password".to_string(),
            ));
        };
        Ok(Self {
            client: http_client(timeout)?,
            base_url: endpoint.base_url.clone(),
            username,
            password,
            api_key: RwLock::new(endpoint.api_key.clone()),
            references,
        })
    }

    async fn login(&self) -> Result<String, VendorOrderResult> {
        let sent = self
            .client
            .post(join_url(&self.base_url, "/login"))
            .json(&json!({ "username": self.username, "password": self.password }))
            .send()
            .await;
        let body = read_response(VendorKey::HomeCollection, sent).await?;
        let login: LoginResponse = decode_single(&body).map_err(|e| {
            warn!(error = %e, "login response without an api key");
            VendorOrderResult::transient("home collection login failed")
        })?;
        *self.api_key.write().await = Some(login.api_key.clone());
        info!("home collection api key refreshed");
        Ok(login.api_key)
    }

    async fn current_key(&self) -> Result<String, VendorOrderResult> {
        if let Some(key) = self.api_key.read().await.clone() {
            return Ok(key);
        }
        self.login().await
    }

    fn order_body(request: &BookingRequest, ctx: &PlacementContext) -> serde_json::Value {
        let entries = diagnostic_entries(request);
        let profile = &request.beneficiary;
        let age = profile.age_on(Utc::now().date_naive());
        let slot = entries
            .first()
            .and_then(|e| e.slot.as_ref())
            .unwrap_or(&request.slot);
        let products: Vec<&str> = entries
            .iter()
            .map(|e| e.product_code.as_deref().unwrap_or(e.test_id.as_str()))
            .collect();
        let address = profile.address.as_ref();

        json!({
            "ProductCode": products.join(","),
            "OrderBy": profile.full_name(),
            "Rate": ctx.amount_paid,
            "HC": "Y",
            "Gender": gender_code(profile.gender),
            "Age": age,
            "Mobile": profile.phone,
            "Email": profile.email,
            "Address": address.map(|a| a.line1.clone()),
            "Pincode": address.map(|a| a.pincode.clone()),
            "ApptDate": format!(
                "{} {}",
                slot.date.format("%d-%m-%Y"),
                slot.start.format("%I:%M %p")
            ),
            "BenCount": 1,
            "BenDataXML": beneficiary_xml(profile, age),
            "RefOrderId": request.idempotency_key,
            "PayType": "POSTPAID",
            "Remarks": request.notes,
        })
    }

    /// `Ok(Some(response))` on a readable answer, `Ok(None)` when the key was refused.
    async fn submit(
        &self,
        key: &str,
        body: &serde_json::Value,
    ) -> Result<Option<OrderResponse>, VendorOrderResult> {
        let sent = self
            .client
            .post(join_url(&self.base_url, "/orders"))
            .header("apikey", key)
            .json(body)
            .send()
            .await;
        if let Ok(response) = &sent {
            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                return Ok(None);
            }
        }
        let raw = read_response(VendorKey::HomeCollection, sent).await?;
        decode_single::<OrderResponse>(&raw).map(Some).map_err(|e| {
            warn!(error = %e, body = %String::from_utf8_lossy(&raw), "unreadable order response");
            VendorOrderResult::rejected("unreadable confirmation from home collection vendor")
        })
    }
}

#[async_trait]
impl VendorAdapter for HomeCollectionAdapter {
    fn vendor(&self) -> VendorKey {
        VendorKey::HomeCollection
    }

    #[instrument(skip(self, request, ctx), fields(booking_id = %ctx.booking_id))]
    async fn place_order(&self, request: &BookingRequest, ctx: &PlacementContext) -> VendorOrderResult {
        if diagnostic_entries(request).is_empty() {
            return VendorOrderResult::rejected("nothing to book with the home collection vendor");
        }
        let body = Self::order_body(request, ctx);

        let mut key = match self.current_key().await {
            Ok(key) => key,
            Err(result) => return result,
        };
        let mut refreshed = false;
        loop {
            let interpretation = match self.submit(&key, &body).await {
                Ok(Some(response)) => interpret(response),
                Ok(None) => Interpretation::AuthExpired,
                Err(result) => return result,
            };
            match interpretation {
                Interpretation::AuthExpired if !refreshed => {
                    warn!("home collection api key refused; logging in again");
                    refreshed = true;
                    key = match self.login().await {
                        Ok(key) => key,
                        Err(result) => return result,
                    };
                }
                Interpretation::AuthExpired => {
                    break VendorOrderResult::transient("home collection vendor refused credentials");
                }
                Interpretation::Declined(reason) => break VendorOrderResult::rejected(reason),
                Interpretation::Placed(order_no) => {
                    let order_no = order_no
                        .filter(|o| !o.trim().is_empty())
                        .unwrap_or_else(|| request.idempotency_key.clone());
                    remember(
                        &self.references,
                        VendorReference::new(ctx.booking_id, VendorKey::HomeCollection, &order_no)
                            .with_attribute("ref_order_id", request.idempotency_key.clone()),
                    )
                    .await;
                    break VendorOrderResult::placed(order_no);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Beneficiary, Gender};
    use rstest::rstest;

    fn response(status: bool, message: &str, order_no: Option<&str>) -> OrderResponse {
        OrderResponse {
            status,
            message: message.to_string(),
            order_no: order_no.map(str::to_string),
        }
    }

    #[test]
    fn positive_status_is_placed() {
        assert_eq!(
            interpret(response(true, "", Some("VL123"))),
            Interpretation::Placed(Some("VL123".into()))
        );
    }

    // Known heuristic: negative flag with a confirming message.
    #[rstest]
    #[case("Order Has Been Placed")]
    #[case("order booked successfully")]
    #[case("Your order is confirmed")]
    #[case("Booked successfully!")]
    #[case("  Successfully placed the order. ")]
    fn false_negative_messages_are_placed(#[case] message: &str) {
        assert_eq!(
            interpret(response(false, message, Some("VL9"))),
            Interpretation::Placed(Some("VL9".into()))
        );
    }

    #[rstest]
    #[case("Pincode not serviceable")]
    #[case("Order could not be placed")]
    #[case("A previous order placed with this reference exists")]
    #[case("Order placed earlier was cancelled by the lab")]
    #[case("No order booked successfully for this slot")]
    #[case("Order placed successfully but payment failed")]
    fn genuine_declines_are_rejected(#[case] message: &str) {
        assert_eq!(
            interpret(response(false, message, None)),
            Interpretation::Declined(message.to_string())
        );
    }

    #[test]
    fn expired_key_is_detected() {
        assert_eq!(
            interpret(response(false, "Invalid Api Key", None)),
            Interpretation::AuthExpired
        );
    }

    #[test]
    fn beneficiary_block_is_escaped() {
        let profile = BeneficiaryProfile {
            reference: Beneficiary::AccountHolder,
            first_name: "Ravi & Sons".into(),
            last_name: "<K>".into(),
            gender: Gender::Male,
            date_of_birth: None,
            age_years: Some(40),
            phone: "1".into(),
            email: None,
            address: None,
        };
        assert_eq!(
            beneficiary_xml(&profile, Some(40)),
            "<NewDataSet><Ben_details><Name>Ravi &amp; Sons &lt;K&gt;</Name><Age>40</Age><Gender>M</Gender></Ben_details></NewDataSet>"
        );
    }
}
