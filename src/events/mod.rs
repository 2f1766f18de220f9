use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{CartKind, PaymentState, VendorKey};

/// Domain events emitted while booking. Consumers are informational only;
/// nothing in a saga waits on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CartUpdated {
        user_id: Uuid,
        entries: usize,
    },
    CartSyncDeferred {
        user_id: Uuid,
        reason: String,
    },
    SagaTransition {
        booking_id: Uuid,
        from: String,
        to: String,
    },
    PaymentSettled {
        booking_id: Uuid,
        state: PaymentState,
        amount: Decimal,
        reference: String,
    },
    VendorOrderPlaced {
        booking_id: Uuid,
        vendor: VendorKey,
        vendor_order_id: String,
    },
    VendorOrderFailed {
        booking_id: Uuid,
        vendor: VendorKey,
        reason: String,
    },
    BookingCompleted {
        booking_id: Uuid,
        user_id: Uuid,
        kind: CartKind,
    },
    ReconciliationRequired {
        booking_id: Uuid,
        transaction_reference: String,
        vendors: Vec<VendorKey>,
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Publishes without waiting. A full or closed channel drops the event with a warning.
    pub fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping domain event: {}", e);
        }
    }
}

/// Drains the event channel, logging each event.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");
    while let Some(event) = rx.recv().await {
        match &event {
            Event::VendorOrderFailed {
                booking_id,
                vendor,
                reason,
            } => {
                warn!(%booking_id, %vendor, %reason, "vendor order failed");
            }
            Event::ReconciliationRequired {
                booking_id,
                transaction_reference,
                vendors,
                ..
            } => {
                warn!(
                    %booking_id,
                    transaction = %transaction_reference,
                    vendors = ?vendors,
                    "payment captured without confirmed booking; queued for reconciliation"
                );
            }
            Event::CartSyncDeferred { user_id, reason } => {
                info!(%user_id, %reason, "remote cart sync deferred");
            }
            other => {
                info!(event = ?other, "domain event");
            }
        }
    }
    warn!("Event processing loop has ended");
}
