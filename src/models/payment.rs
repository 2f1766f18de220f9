use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentState {
    Captured,
    /// Explicit user dismissal of the payment modal.
    Cancelled,
    /// Gateway-reported decline or an unverifiable completion.
    Failed,
}

/// Terminal record of one payment attempt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub amount: Decimal,
    pub currency: String,
    /// Gateway session (order) identifier; synthetic for zero-amount bookings.
    pub session_id: String,
    pub payment_id: Option<String>,
    pub state: PaymentState,
    pub failure_reason: Option<String>,
    pub settled_at: DateTime<Utc>,
}

impl PaymentTransaction {
    pub fn captured(
        amount: Decimal,
        currency: impl Into<String>,
        session_id: impl Into<String>,
        payment_id: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            currency: currency.into(),
            session_id: session_id.into(),
            payment_id: Some(payment_id.into()),
            state: PaymentState::Captured,
            failure_reason: None,
            settled_at: Utc::now(),
        }
    }

    /// Stand-in for fully sponsored bookings; no gateway is involved.
    pub fn synthetic_zero(currency: impl Into<String>, idempotency_key: &str) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency: currency.into(),
            session_id: format!("zero-{}", idempotency_key),
            payment_id: None,
            state: PaymentState::Captured,
            failure_reason: None,
            settled_at: Utc::now(),
        }
    }

    pub fn cancelled(
        amount: Decimal,
        currency: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            currency: currency.into(),
            session_id: session_id.into(),
            payment_id: None,
            state: PaymentState::Cancelled,
            failure_reason: Some("payment dismissed by user".to_string()),
            settled_at: Utc::now(),
        }
    }

    pub fn failed(
        amount: Decimal,
        currency: impl Into<String>,
        session_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            amount,
            currency: currency.into(),
            session_id: session_id.into(),
            payment_id: None,
            state: PaymentState::Failed,
            failure_reason: Some(reason.into()),
            settled_at: Utc::now(),
        }
    }

    pub fn is_captured(&self) -> bool {
        self.state == PaymentState::Captured
    }

    /// Reference used on markers and reconciliation records.
    pub fn reference(&self) -> &str {
        self.payment_id.as_deref().unwrap_or(&self.session_id)
    }
}

/// Who pays; forwarded to the gateway to prefill the checkout modal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayerDetails {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Converts a major-unit amount to integer minor units (paise, cents).
pub fn to_minor_units(amount: Decimal) -> Option<i64> {
    use rust_decimal::prelude::ToPrimitive;
    (amount * Decimal::from(100)).round().to_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minor_units_round_half_even() {
        assert_eq!(to_minor_units(dec!(500)), Some(50_000));
        assert_eq!(to_minor_units(dec!(199.99)), Some(19_999));
        assert_eq!(to_minor_units(dec!(0.005)), Some(0));
    }

    #[test]
    fn synthetic_zero_is_captured() {
        let tx = PaymentTransaction::synthetic_zero("INR", "ORD-1");
        assert!(tx.is_captured());
        assert_eq!(tx.amount, Decimal::ZERO);
        assert_eq!(tx.reference(), "zero-ORD-1");
    }
}
