use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{info, instrument, warn};

use crate::errors::ServiceError;
use crate::integrations::GatewayClient;
use crate::models::payment::to_minor_units;
use crate::models::{PayerDetails, PaymentTransaction};

/// Opens a payment for a booking and resolves once the payer finishes with
/// the checkout modal. Charges are never retried.
#[async_trait]
pub trait PaymentCoordinator: Send + Sync {
    /// Resolves to a terminal transaction. `Err` only when no session could be
    /// opened at all.
    async fn charge(
        &self,
        idempotency_key: &str,
        amount: Decimal,
        payer: &PayerDetails,
    ) -> Result<PaymentTransaction, ServiceError>;

    /// Checkout session opened for `idempotency_key`, waiting up to `within`
    /// for it to appear.
    async fn pending_session(&self, _idempotency_key: &str, _within: Duration) -> Option<CheckoutSession> {
        None
    }

    /// Delivers the payer's result for an open session.
    async fn complete(&self, session_id: &str, _outcome: CheckoutOutcome) -> Result<(), ServiceError> {
        Err(ServiceError::NotFound(format!("payment session {}", session_id)))
    }
}

/// What the client needs to open the gateway's checkout modal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub key_id: String,
    /// Minor units.
    pub amount: i64,
    pub currency: String,
    pub receipt: String,
    pub payer: PayerDetails,
    pub opened_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result reported by the checkout modal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    Completed { payment_id: String, signature: String },
    Dismissed,
    Declined { reason: String },
}

struct PendingCharge {
    receipt: String,
    settle: oneshot::Sender<CheckoutOutcome>,
}

/// Clears a charge's session and its pending callback slot however the charge
/// ends, including when its future is dropped mid-wait.
struct OpenSession<'a> {
    pending: &'a DashMap<String, PendingCharge>,
    sessions: &'a DashMap<String, CheckoutSession>,
    session_id: String,
    receipt: String,
}

impl Drop for OpenSession<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.session_id);
        self.sessions.remove(&self.receipt);
    }
}

/// Gateway-backed coordinator. Each charge opens a gateway order and parks
/// until the completion callback arrives or the payment window closes.
pub struct GatewayPaymentCoordinator {
    gateway: GatewayClient,
    currency: String,
    window: Duration,
    pending: DashMap<String, PendingCharge>,
    sessions: DashMap<String, CheckoutSession>,
    opened: Notify,
}

impl GatewayPaymentCoordinator {
    pub fn new(gateway: GatewayClient, currency: impl Into<String>, window: Duration) -> Self {
        Self {
            gateway,
            currency: currency.into(),
            window,
            pending: DashMap::new(),
            sessions: DashMap::new(),
            opened: Notify::new(),
        }
    }

    /// Open checkout sessions, keyed by receipt.
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn settle(&self, session_id: &str, amount: Decimal, outcome: CheckoutOutcome) -> PaymentTransaction {
        match outcome {
            CheckoutOutcome::Completed {
                payment_id,
                signature,
            } => {
                if self.gateway.verify(session_id, &payment_id, &signature) {
                    PaymentTransaction::captured(amount, &self.currency, session_id, payment_id)
                } else {
                    warn!(%session_id, %payment_id, "payment signature mismatch");
                    PaymentTransaction::failed(
                        amount,
                        &self.currency,
                        session_id,
                        "payment could not be verified",
                    )
                }
            }
            CheckoutOutcome::Dismissed => {
                PaymentTransaction::cancelled(amount, &self.currency, session_id)
            }
            CheckoutOutcome::Declined { reason } => {
                PaymentTransaction::failed(amount, &self.currency, session_id, reason)
            }
        }
    }
}

#[async_trait]
impl PaymentCoordinator for GatewayPaymentCoordinator {
    #[instrument(skip(self, payer), fields(receipt = %idempotency_key, %amount))]
    async fn charge(
        &self,
        idempotency_key: &str,
        amount: Decimal,
        payer: &PayerDetails,
    ) -> Result<PaymentTransaction, ServiceError> {
        let minor = to_minor_units(amount)
            .filter(|m| *m > 0)
            .ok_or_else(|| ServiceError::ValidationError(format!("cannot charge {}", amount)))?;
        let order = self
            .gateway
            .create_order(minor, &self.currency, idempotency_key)
            .await?;

        let opened_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.window)
            .map(|w| opened_at + w)
            .unwrap_or(opened_at);
        let session = CheckoutSession {
            session_id: order.id.clone(),
            key_id: self.gateway.key_id().to_string(),
            amount: minor,
            currency: self.currency.clone(),
            receipt: idempotency_key.to_string(),
            payer: payer.clone(),
            opened_at,
            expires_at,
        };
        let (settle, settled) = oneshot::channel();
        self.pending.insert(
            order.id.clone(),
            PendingCharge {
                receipt: idempotency_key.to_string(),
                settle,
            },
        );
        self.sessions.insert(idempotency_key.to_string(), session);
        let _open = OpenSession {
            pending: &self.pending,
            sessions: &self.sessions,
            session_id: order.id.clone(),
            receipt: idempotency_key.to_string(),
        };
        self.opened.notify_waiters();
        info!(session_id = %order.id, "checkout session opened");

        let transaction = match tokio::time::timeout(self.window, settled).await {
            Ok(Ok(outcome)) => self.settle(&order.id, amount, outcome),
            Ok(Err(_)) => PaymentTransaction::failed(
                amount,
                &self.currency,
                &order.id,
                "payment session was dropped",
            ),
            Err(_) => {
                warn!(session_id = %order.id, "payment window elapsed");
                PaymentTransaction::cancelled(amount, &self.currency, &order.id)
            }
        };

        counter!("carebook.payments", 1, "state" => transaction.state.to_string());
        Ok(transaction)
    }

    async fn pending_session(&self, idempotency_key: &str, within: Duration) -> Option<CheckoutSession> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let notified = self.opened.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(session) = self.sessions.get(idempotency_key) {
                return Some(session.clone());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    #[instrument(skip(self, outcome))]
    async fn complete(&self, session_id: &str, outcome: CheckoutOutcome) -> Result<(), ServiceError> {
        let (_, pending) = self
            .pending
            .remove(session_id)
            .ok_or_else(|| ServiceError::NotFound(format!("payment session {}", session_id)))?;
        pending.settle.send(outcome).map_err(|_| {
            ServiceError::Conflict(format!(
                "payment session {} for {} is already settled",
                session_id, pending.receipt
            ))
        })
    }
}
