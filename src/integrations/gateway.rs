use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument};

use super::envelope::decode_single;
use super::{checked_body, http_client, join_url};
use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Gateway-side order backing one checkout session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Client for the payment gateway's order API and completion signatures.
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
}

impl GatewayClient {
    pub fn new(
        base_url: impl Into<String>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into(),
            key_id: key_id.into(),
            key_secret: key_secret.into(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Opens a gateway order for `amount_minor`. Never retried.
    #[instrument(skip(self))]
    pub async fn create_order(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt: &str,
    ) -> Result<GatewayOrder, ServiceError> {
        let response = self
            .client
            .post(join_url(&self.base_url, "/v1/orders"))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&json!({
                "amount": amount_minor,
                "currency": currency,
                "receipt": receipt,
                "payment_capture": 1,
            }))
            .send()
            .await?;
        let body = checked_body("payment_gateway", response).await?;
        let order: GatewayOrder = decode_single(&body)?;
        debug!(gateway_order_id = %order.id, "gateway order opened");
        Ok(order)
    }

    /// Signature the gateway attaches to a successful checkout.
    pub fn sign(&self, order_id: &str, payment_id: &str) -> String {
        sign_completion(&self.key_secret, order_id, payment_id)
    }

    pub fn verify(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        constant_time_eq(&self.sign(order_id, payment_id), signature)
    }
}

/// `hex(HMAC-SHA256(secret, "{order_id}|{payment_id}"))`
pub fn sign_completion(secret: &str, order_id: &str, payment_id: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => return String::new(),
    };
    mac.update(format!("{}|{}", order_id, payment_id).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() || a.is_empty() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> GatewayClient {
        GatewayClient::new("http://gw", "key", "secret", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn accepts_matching_signature() {
        let gw = client();
        let sig = sign_completion("secret", "order_1", "pay_1");
        assert_eq!(sig.len(), 64);
        assert!(gw.verify("order_1", "pay_1", &sig));
    }

    #[test]
    fn rejects_tampered_signature() {
        let gw = client();
        let sig = sign_completion("secret", "order_1", "pay_1");
        assert!(!gw.verify("order_1", "pay_2", &sig));
        assert!(!gw.verify("order_1", "pay_1", ""));
        assert!(!gw.verify("order_1", "pay_1", &sign_completion("other", "order_1", "pay_1")));
    }
}
