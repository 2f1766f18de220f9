use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::saga::{BookingDraft, BookingOrchestrator, BookingOutcome, BookingSaga, BookingView, DetachHandle};
use super::state::SagaState;
use crate::errors::ServiceError;
use crate::models::PayerDetails;
use crate::services::payments::CheckoutSession;
use crate::services::reconciliation::ReconciliationStatus;

/// How long a finished or idle booking stays addressable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Clone)]
struct Tracked {
    saga: Arc<Mutex<BookingSaga>>,
    view: watch::Receiver<BookingView>,
    detach: DetachHandle,
    idempotency_key: String,
}

/// Result of asking to pay: either the booking settled right away (zero
/// amount, or a fast payer) or the checkout modal must be opened.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PaymentStep {
    Settled { outcome: BookingOutcome },
    AwaitingPayment { session: CheckoutSession },
}

/// Keeps live sagas addressable by booking id. One operation per saga at a
/// time; a second concurrent request gets `Conflict`.
///
/// Sagas are dropped by [`BookingService::prune_settled`] once they have been
/// quiet for the retention window.
pub struct BookingService {
    orchestrator: Arc<BookingOrchestrator>,
    sagas: DashMap<Uuid, Tracked>,
    retention: Duration,
}

enum Disposal {
    Keep,
    Evict,
    /// Committed but never paid; abandoned to free its lease, then evicted.
    AbandonIdle,
}

impl BookingService {
    pub fn new(orchestrator: Arc<BookingOrchestrator>) -> Self {
        Self {
            orchestrator,
            sagas: DashMap::new(),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn orchestrator(&self) -> &Arc<BookingOrchestrator> {
        &self.orchestrator
    }

    fn tracked(&self, booking_id: Uuid) -> Result<Tracked, ServiceError> {
        self.sagas
            .get(&booking_id)
            .map(|t| t.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("booking {}", booking_id)))
    }

    #[instrument(skip(self, draft), fields(user_id = %draft.user_id))]
    pub async fn start(&self, draft: BookingDraft) -> Result<BookingView, ServiceError> {
        let saga = self.orchestrator.start(draft).await?;
        let view = saga.view();
        self.sagas.insert(
            saga.booking_id(),
            Tracked {
                view: saga.subscribe(),
                detach: saga.detach_handle(),
                idempotency_key: saga.request().idempotency_key.clone(),
                saga: Arc::new(Mutex::new(saga)),
            },
        );
        Ok(view)
    }

    /// Latest published view; never waits on a running operation.
    pub fn get(&self, booking_id: Uuid) -> Result<BookingView, ServiceError> {
        let tracked = self.tracked(booking_id)?;
        let view = tracked.view.borrow().clone();
        Ok(view)
    }

    pub async fn pay(&self, booking_id: Uuid, payer: PayerDetails) -> Result<BookingOutcome, ServiceError> {
        let tracked = self.tracked(booking_id)?;
        let mut saga = tracked.saga.try_lock().map_err(|_| {
            ServiceError::Conflict(format!("booking {} is already being processed", booking_id))
        })?;
        self.orchestrator.pay_and_place(&mut saga, &payer).await
    }

    /// Starts payment in the background and returns as soon as there is
    /// something for the client to act on. The saga keeps running if the
    /// caller goes away.
    pub async fn pay_or_checkout(
        self: &Arc<Self>,
        booking_id: Uuid,
        payer: PayerDetails,
        wait: Duration,
    ) -> Result<PaymentStep, ServiceError> {
        let tracked = self.tracked(booking_id)?;
        let service = Arc::clone(self);
        let mut task = tokio::spawn(async move { service.pay(booking_id, payer).await });
        let payments = Arc::clone(self.orchestrator.payments());

        tokio::select! {
            joined = &mut task => {
                let outcome = joined.map_err(|e| {
                    ServiceError::InternalError(format!("payment task failed: {}", e))
                })??;
                Ok(PaymentStep::Settled { outcome })
            }
            Some(session) = payments.pending_session(&tracked.idempotency_key, wait) => {
                Ok(PaymentStep::AwaitingPayment { session })
            }
        }
    }

    pub async fn retry(&self, booking_id: Uuid) -> Result<BookingOutcome, ServiceError> {
        let tracked = self.tracked(booking_id)?;
        let mut saga = tracked.saga.try_lock().map_err(|_| {
            ServiceError::Conflict(format!("booking {} is already being processed", booking_id))
        })?;
        self.orchestrator.retry_order_placement(&mut saga).await
    }

    pub async fn abandon(&self, booking_id: Uuid) -> Result<BookingView, ServiceError> {
        let tracked = self.tracked(booking_id)?;
        let mut saga = tracked.saga.try_lock().map_err(|_| {
            ServiceError::Conflict(format!("booking {} is already being processed", booking_id))
        })?;
        self.orchestrator.abandon(&mut saga)?;
        info!(%booking_id, "booking abandoned");
        Ok(saga.view())
    }

    /// The originating view is gone; running work finishes without touching
    /// the local cart.
    pub fn detach(&self, booking_id: Uuid) -> Result<(), ServiceError> {
        self.tracked(booking_id)?.detach.detach();
        Ok(())
    }

    pub fn prune_settled(&self) -> usize {
        self.prune_settled_at(Utc::now())
    }

    /// Forgets bookings whose last transition is older than the retention
    /// window as of `now`: finished ones, and unpaid ones left at
    /// `CartCommitted`, which are abandoned first. A partially failed booking
    /// is kept while its reconciliation record is open. Returns how many were
    /// dropped.
    pub fn prune_settled_at(&self, now: DateTime<Utc>) -> usize {
        let retention =
            chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = now - retention;
        let reconciliation = self.orchestrator.reconciliation();

        let mut dropped = 0;
        self.sagas.retain(|booking_id, tracked| {
            let disposal = {
                let view = tracked.view.borrow();
                let quiet = view.history.last().map_or(false, |t| t.at <= cutoff);
                match view.state {
                    _ if !quiet => Disposal::Keep,
                    SagaState::PartiallyFailed => {
                        let open = reconciliation
                            .get(*booking_id)
                            .map_or(false, |r| r.status == ReconciliationStatus::Open);
                        if open {
                            Disposal::Keep
                        } else {
                            Disposal::Evict
                        }
                    }
                    state if state.is_terminal() => Disposal::Evict,
                    SagaState::CartCommitted => Disposal::AbandonIdle,
                    _ => Disposal::Keep,
                }
            };
            match disposal {
                Disposal::Keep => true,
                Disposal::Evict => {
                    self.orchestrator.forget(&tracked.idempotency_key);
                    dropped += 1;
                    false
                }
                Disposal::AbandonIdle => {
                    let Ok(mut saga) = tracked.saga.try_lock() else {
                        return true;
                    };
                    if let Err(e) = self.orchestrator.abandon(&mut saga) {
                        warn!(%booking_id, error = %e, "idle booking could not be abandoned");
                        return true;
                    }
                    info!(%booking_id, "idle unpaid booking abandoned");
                    dropped += 1;
                    false
                }
            }
        });
        if dropped > 0 {
            debug!(dropped, remaining = self.sagas.len(), "settled bookings pruned");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sagas.is_empty()
    }
}
