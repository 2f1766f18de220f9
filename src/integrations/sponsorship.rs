use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use super::envelope::decode_single;
use super::{checked_body, http_client, join_url};
use crate::errors::ServiceError;
use crate::models::Beneficiary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorshipDecision {
    pub available: bool,
    /// Share of the price the plan covers; a sponsored service without one is fully covered.
    #[serde(default, alias = "discountPercent", alias = "discount")]
    pub discount_percent: Option<Decimal>,
}

impl SponsorshipDecision {
    pub fn not_sponsored() -> Self {
        Self {
            available: false,
            discount_percent: None,
        }
    }

    /// Effective discount in percent, clamped to 0..=100.
    pub fn effective_discount(&self) -> Decimal {
        if !self.available {
            return Decimal::ZERO;
        }
        self.discount_percent
            .unwrap_or(Decimal::ONE_HUNDRED)
            .clamp(Decimal::ZERO, Decimal::ONE_HUNDRED)
    }

    /// Amount left to charge after the discount, rounded to minor units.
    pub fn apply(&self, gross: Decimal) -> Decimal {
        let net = gross - gross * self.effective_discount() / Decimal::ONE_HUNDRED;
        net.max(Decimal::ZERO).round_dp(2)
    }
}

#[async_trait]
pub trait SponsorshipApi: Send + Sync {
    async fn check(
        &self,
        user_id: Uuid,
        beneficiary: &Beneficiary,
        service_id: &str,
    ) -> Result<SponsorshipDecision, ServiceError>;
}

#[derive(Clone)]
pub struct HttpSponsorshipClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSponsorshipClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl SponsorshipApi for HttpSponsorshipClient {
    #[instrument(skip(self, beneficiary))]
    async fn check(
        &self,
        user_id: Uuid,
        beneficiary: &Beneficiary,
        service_id: &str,
    ) -> Result<SponsorshipDecision, ServiceError> {
        let response = self
            .client
            .post(join_url(&self.base_url, "/sponsorship/check"))
            .json(&json!({
                "user_id": user_id,
                "beneficiary": beneficiary,
                "service_id": service_id,
            }))
            .send()
            .await?;
        let body = checked_body("sponsorship", response).await?;
        Ok(decode_single(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn sponsored_without_percent_is_free() {
        let decision = SponsorshipDecision {
            available: true,
            discount_percent: None,
        };
        assert_eq!(decision.apply(dec!(500)), Decimal::ZERO);
    }

    #[test]
    fn partial_discount_is_applied() {
        let decision = SponsorshipDecision {
            available: true,
            discount_percent: Some(dec!(20)),
        };
        assert_eq!(decision.apply(dec!(500)), dec!(400));
    }

    #[test]
    fn unsponsored_pays_full_price_even_with_stray_percent() {
        let decision = SponsorshipDecision {
            available: false,
            discount_percent: Some(dec!(50)),
        };
        assert_eq!(decision.apply(dec!(500)), dec!(500));
    }
}
