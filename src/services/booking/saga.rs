use chrono::{DateTime, FixedOffset, Utc};
use dashmap::DashSet;
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::lease::{LeaseGuard, LeaseKey, LeaseRegistry};
use super::state::{SagaState, Transition};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::integrations::{AppointmentRequest, ClinicApi, RemoteCart, SponsorshipApi, SponsorshipDecision};
use crate::models::{
    BeneficiaryProfile, BookingMarker, BookingRequest, CartEntry, CartKind, PayerDetails,
    PaymentState, PaymentTransaction, TimeSlot, VendorKey, VendorOrderResult,
};
use crate::retry::RetryPolicy;
use crate::services::cart_store::CartStore;
use crate::services::payments::PaymentCoordinator;
use crate::services::reconciliation::{FailedOrder, ReconciliationQueue, ReconciliationRecord};
use crate::services::slot_resolver::ensure_bookable_at;
use crate::services::vendors::{PlacementContext, VendorRegistry};

/// What the caller selects before a booking starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingDraft {
    pub user_id: Uuid,
    pub kind: CartKind,
    #[serde(default)]
    pub beneficiary: Option<BeneficiaryProfile>,
    /// Entries to book; empty means every entry of `kind` for the beneficiary.
    #[serde(default)]
    pub entry_ids: Vec<Uuid>,
    #[serde(default)]
    pub slot: Option<TimeSlot>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub vendor: VendorKey,
    pub vendor_order_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VendorOrderView {
    pub vendor: VendorKey,
    #[serde(flatten)]
    pub result: VendorOrderResult,
}

/// Read-only picture of a saga, published on every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingView {
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub kind: CartKind,
    pub state: SagaState,
    pub idempotency_key: String,
    pub slot: TimeSlot,
    pub gross_amount: Decimal,
    pub amount_due: Decimal,
    pub currency: String,
    pub appointment_ref: Option<String>,
    pub payment: Option<PaymentTransaction>,
    pub orders: Vec<VendorOrderView>,
    pub history: Vec<Transition>,
    pub detached: bool,
}

/// How a paid booking ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BookingOutcome {
    Completed {
        booking_id: Uuid,
        orders: Vec<PlacedOrder>,
        payment_reference: String,
    },
    /// Paid, but at least one vendor order is not placed. The cart entries
    /// stay marked until a retry succeeds or support settles it.
    PendingConfirmation {
        booking_id: Uuid,
        placed: Vec<PlacedOrder>,
        failed: Vec<FailedOrder>,
        transaction_reference: String,
        support_contact: String,
    },
}

impl BookingOutcome {
    pub fn booking_id(&self) -> Uuid {
        match self {
            Self::Completed { booking_id, .. } | Self::PendingConfirmation { booking_id, .. } => {
                *booking_id
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// User-facing summary. A pending booking never reads like a charge failure.
    pub fn message(&self) -> String {
        match self {
            Self::Completed { orders, .. } => {
                let ids: Vec<&str> = orders.iter().map(|o| o.vendor_order_id.as_str()).collect();
                format!("Booking confirmed: {}", ids.join(", "))
            }
            Self::PendingConfirmation {
                failed,
                transaction_reference,
                support_contact,
                ..
            } => {
                let vendors: Vec<String> = failed.iter().map(|f| f.vendor.to_string()).collect();
                ServiceError::PartialCommit(format!(
                    "{} has not confirmed the order. You have not been charged twice; contact {} quoting {}",
                    vendors.join(", "),
                    support_contact,
                    transaction_reference
                ))
                .to_string()
            }
        }
    }
}

/// Marks a saga whose originating view has gone away.
#[derive(Debug, Clone, Default)]
pub struct DetachHandle(Arc<AtomicBool>);

impl DetachHandle {
    pub fn detach(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_detached(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One booking run. Owned by exactly one caller at a time; every state change
/// goes through [`BookingSaga::transition`].
#[derive(Debug)]
pub struct BookingSaga {
    request: BookingRequest,
    state: SagaState,
    history: Vec<Transition>,
    appointment_ref: Option<String>,
    discounts: HashMap<Uuid, Decimal>,
    /// Per-entry amount charged after its discount.
    net_amounts: HashMap<Uuid, Decimal>,
    amount_due: Decimal,
    remote_items: HashMap<Uuid, String>,
    payment: Option<PaymentTransaction>,
    orders: BTreeMap<VendorKey, VendorOrderResult>,
    detached: DetachHandle,
    lease: Option<LeaseGuard>,
    events: EventSender,
    published: watch::Sender<BookingView>,
}

impl BookingSaga {
    fn new(request: BookingRequest, lease: LeaseGuard, events: EventSender) -> Self {
        let initial = BookingView {
            booking_id: request.booking_id,
            user_id: request.user_id,
            kind: request.kind,
            state: SagaState::Draft,
            idempotency_key: request.idempotency_key.clone(),
            slot: request.slot.clone(),
            gross_amount: request.amount,
            amount_due: request.amount,
            currency: request.currency.clone(),
            appointment_ref: None,
            payment: None,
            orders: Vec::new(),
            history: Vec::new(),
            detached: false,
        };
        let (published, _) = watch::channel(initial);
        Self {
            amount_due: request.amount,
            request,
            state: SagaState::Draft,
            history: Vec::new(),
            appointment_ref: None,
            discounts: HashMap::new(),
            net_amounts: HashMap::new(),
            remote_items: HashMap::new(),
            payment: None,
            orders: BTreeMap::new(),
            detached: DetachHandle::default(),
            lease: Some(lease),
            events,
            published,
        }
    }

    pub fn booking_id(&self) -> Uuid {
        self.request.booking_id
    }

    pub fn request(&self) -> &BookingRequest {
        &self.request
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn appointment_ref(&self) -> Option<&str> {
        self.appointment_ref.as_deref()
    }

    pub fn amount_due(&self) -> Decimal {
        self.amount_due
    }

    /// What was charged for `vendor`'s entries, after their discounts.
    pub fn amount_for(&self, vendor: VendorKey) -> Decimal {
        self.request
            .entries
            .iter()
            .filter(|e| e.vendor() == vendor)
            .map(|e| {
                self.net_amounts
                    .get(&e.id())
                    .copied()
                    .unwrap_or_else(|| e.line_total())
            })
            .sum()
    }

    /// Last payment attempt, captured or not.
    pub fn payment(&self) -> Option<&PaymentTransaction> {
        self.payment.as_ref()
    }

    pub fn orders(&self) -> &BTreeMap<VendorKey, VendorOrderResult> {
        &self.orders
    }

    pub fn holds_lease(&self) -> bool {
        self.lease.is_some()
    }

    pub fn detach_handle(&self) -> DetachHandle {
        self.detached.clone()
    }

    /// In-flight vendor calls still complete; their results are no longer
    /// written to the local cart.
    pub fn detach(&self) {
        self.detached.detach();
        self.publish();
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_detached()
    }

    pub fn subscribe(&self) -> watch::Receiver<BookingView> {
        self.published.subscribe()
    }

    pub fn view(&self) -> BookingView {
        BookingView {
            booking_id: self.request.booking_id,
            user_id: self.request.user_id,
            kind: self.request.kind,
            state: self.state,
            idempotency_key: self.request.idempotency_key.clone(),
            slot: self.request.slot.clone(),
            gross_amount: self.request.amount,
            amount_due: self.amount_due,
            currency: self.request.currency.clone(),
            appointment_ref: self.appointment_ref.clone(),
            payment: self.payment.clone(),
            orders: self
                .orders
                .iter()
                .map(|(vendor, result)| VendorOrderView {
                    vendor: *vendor,
                    result: result.clone(),
                })
                .collect(),
            history: self.history.clone(),
            detached: self.is_detached(),
        }
    }

    fn publish(&self) {
        self.published.send_replace(self.view());
    }

    fn transition(&mut self, to: SagaState) -> Result<(), ServiceError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(ServiceError::InvalidOperation(format!(
                "booking {} cannot move from {} to {}",
                self.request.booking_id, from, to
            )));
        }
        self.state = to;
        self.history.push(Transition {
            from,
            to,
            at: Utc::now(),
        });
        info!(booking_id = %self.request.booking_id, %from, %to, "saga transition");
        counter!("carebook.saga.transitions", 1, "to" => to.to_string());
        self.events.send_or_log(Event::SagaTransition {
            booking_id: self.request.booking_id,
            from: from.to_string(),
            to: to.to_string(),
        });
        if to.is_terminal() {
            self.lease = None;
        }
        self.publish();
        Ok(())
    }

    /// Vendors in the order their entries appear in the request.
    fn vendors(&self) -> Vec<VendorKey> {
        let mut vendors = Vec::new();
        for entry in &self.request.entries {
            if !vendors.contains(&entry.vendor()) {
                vendors.push(entry.vendor());
            }
        }
        vendors
    }
}

/// Everything a saga talks to.
pub struct Collaborators {
    pub carts: Arc<CartStore>,
    pub clinic: Arc<dyn ClinicApi>,
    pub remote_cart: Arc<dyn RemoteCart>,
    pub sponsorship: Arc<dyn SponsorshipApi>,
    pub payments: Arc<dyn PaymentCoordinator>,
    pub vendors: Arc<VendorRegistry>,
    pub reconciliation: Arc<ReconciliationQueue>,
    pub leases: Arc<LeaseRegistry>,
    pub events: EventSender,
}

#[derive(Debug, Clone)]
pub struct SagaSettings {
    /// Applied to vendor order placement only; payment is never retried.
    pub retry: RetryPolicy,
    /// Vendor wall-clock offset used for slot expiry.
    pub offset: FixedOffset,
    pub currency: String,
    pub support_contact: String,
}

/// Drives booking sagas through appointment creation, sponsorship, cart
/// commit, payment and vendor order placement.
pub struct BookingOrchestrator {
    carts: Arc<CartStore>,
    clinic: Arc<dyn ClinicApi>,
    remote_cart: Arc<dyn RemoteCart>,
    sponsorship: Arc<dyn SponsorshipApi>,
    payments: Arc<dyn PaymentCoordinator>,
    vendors: Arc<VendorRegistry>,
    reconciliation: Arc<ReconciliationQueue>,
    leases: Arc<LeaseRegistry>,
    events: EventSender,
    settings: SagaSettings,
    /// Idempotency keys whose payment was captured; a replay is refused.
    captured: DashSet<String>,
}

impl BookingOrchestrator {
    pub fn new(parts: Collaborators, settings: SagaSettings) -> Self {
        Self {
            carts: parts.carts,
            clinic: parts.clinic,
            remote_cart: parts.remote_cart,
            sponsorship: parts.sponsorship,
            payments: parts.payments,
            vendors: parts.vendors,
            reconciliation: parts.reconciliation,
            leases: parts.leases,
            events: parts.events,
            settings,
            captured: DashSet::new(),
        }
    }

    pub fn payments(&self) -> &Arc<dyn PaymentCoordinator> {
        &self.payments
    }

    pub fn reconciliation(&self) -> &Arc<ReconciliationQueue> {
        &self.reconciliation
    }

    pub fn leases(&self) -> &Arc<LeaseRegistry> {
        &self.leases
    }

    pub fn settings(&self) -> &SagaSettings {
        &self.settings
    }

    pub async fn start(&self, draft: BookingDraft) -> Result<BookingSaga, ServiceError> {
        self.start_at(draft, Utc::now()).await
    }

    /// Validates the draft, takes the lease and runs every step up to a
    /// committed cart. Validation failures happen before any network call.
    #[instrument(skip(self, draft), fields(user_id = %draft.user_id, kind = %draft.kind))]
    pub async fn start_at(&self, draft: BookingDraft, now: DateTime<Utc>) -> Result<BookingSaga, ServiceError> {
        let beneficiary = draft
            .beneficiary
            .ok_or_else(|| ServiceError::ValidationError("a beneficiary must be selected".to_string()))?;
        let slot = draft
            .slot
            .ok_or_else(|| ServiceError::ValidationError("no slot selected".to_string()))?;
        ensure_bookable_at(&slot, now, self.settings.offset)?;

        let cart = self.carts.snapshot(draft.user_id).await?;
        let entries: Vec<CartEntry> = cart
            .entries_of(draft.kind)
            .filter(|e| e.beneficiary() == beneficiary.reference)
            .filter(|e| draft.entry_ids.is_empty() || draft.entry_ids.contains(&e.id()))
            .cloned()
            .collect();
        if entries.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "no {} entries to book for this beneficiary",
                draft.kind
            )));
        }
        for entry in &entries {
            if entry.marker().is_some() {
                return Err(ServiceError::Conflict(format!(
                    "payment already received for entry {}; retry order placement instead",
                    entry.id()
                )));
            }
            if !self.vendors.supports(entry.vendor()) {
                return Err(ServiceError::ValidationError(format!(
                    "{} bookings are not available",
                    entry.vendor()
                )));
            }
            if let Some(entry_slot) = entry.slot() {
                ensure_bookable_at(entry_slot, now, self.settings.offset)?;
            }
        }

        let booking_id = Uuid::new_v4();
        let lease = self.leases.acquire(
            LeaseKey {
                user_id: draft.user_id,
                beneficiary: beneficiary.reference,
                kind: draft.kind,
            },
            booking_id,
        )?;
        let amount: Decimal = entries.iter().map(CartEntry::line_total).sum();
        let request = BookingRequest {
            booking_id,
            idempotency_key: BookingRequest::new_idempotency_key(booking_id),
            user_id: draft.user_id,
            kind: draft.kind,
            beneficiary,
            entries,
            slot,
            notes: draft.notes,
            amount,
            currency: self.settings.currency.clone(),
            created_at: now,
        };
        info!(%booking_id, %amount, entries = request.entries.len(), "booking started");

        let mut saga = BookingSaga::new(request, lease, self.events.clone());
        self.prepare(&mut saga).await?;
        Ok(saga)
    }

    async fn prepare(&self, saga: &mut BookingSaga) -> Result<(), ServiceError> {
        let request = saga.request.clone();

        if request.kind == CartKind::Appointment {
            let doctor_id = request
                .entries
                .iter()
                .find_map(|e| match e {
                    CartEntry::Appointment(a) => Some(a.doctor_id.clone()),
                    CartEntry::Diagnostic(_) => None,
                })
                .unwrap_or_default();
            let appointment = AppointmentRequest {
                user_id: request.user_id,
                doctor_id,
                beneficiary: request.beneficiary.reference,
                notes: request.notes.clone(),
            };
            match self.clinic.create_appointment(&appointment).await {
                Ok(case_id) => {
                    info!(%case_id, "appointment case opened");
                    saga.appointment_ref = Some(case_id);
                    saga.transition(SagaState::AppointmentCreated)?;
                }
                Err(e) => {
                    warn!(error = %e, "appointment creation failed");
                    saga.transition(SagaState::Failed)?;
                    return Err(ServiceError::AppointmentFailed(e.response_message()));
                }
            }
        }

        let mut amount_due = Decimal::ZERO;
        for entry in &request.entries {
            let decision = match self
                .sponsorship
                .check(request.user_id, &request.beneficiary.reference, entry.service_ref())
                .await
            {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(entry_id = %entry.id(), error = %e, "sponsorship check failed; charging full price");
                    SponsorshipDecision::not_sponsored()
                }
            };
            let net = decision.apply(entry.line_total());
            amount_due += net;
            saga.net_amounts.insert(entry.id(), net);
            saga.discounts.insert(entry.id(), decision.effective_discount());
        }
        saga.amount_due = amount_due;
        saga.transition(SagaState::SponsorshipChecked)?;

        for entry in &request.entries {
            let discount = saga.discounts.get(&entry.id()).copied().unwrap_or(Decimal::ZERO);
            match self
                .remote_cart
                .commit_item(request.user_id, entry, discount)
                .await
            {
                Ok(item_id) => {
                    saga.remote_items.insert(entry.id(), item_id.clone());
                    if let Err(e) = self
                        .carts
                        .set_remote_item_id(request.user_id, entry.id(), item_id)
                        .await
                    {
                        warn!(entry_id = %entry.id(), error = %e, "could not record remote item id locally");
                    }
                }
                Err(e) => {
                    warn!(entry_id = %entry.id(), error = %e, "cart commit failed");
                    saga.transition(SagaState::Failed)?;
                    return Err(ServiceError::CartCommitFailed(e.response_message()));
                }
            }
        }
        saga.transition(SagaState::CartCommitted)
    }

    /// Takes payment for a committed cart and places the vendor orders. A
    /// cancelled or declined payment returns the saga to `CartCommitted` with
    /// the cart untouched.
    #[instrument(skip(self, saga, payer), fields(booking_id = %saga.booking_id()))]
    pub async fn pay_and_place(
        &self,
        saga: &mut BookingSaga,
        payer: &PayerDetails,
    ) -> Result<BookingOutcome, ServiceError> {
        if saga.state != SagaState::CartCommitted {
            return Err(ServiceError::InvalidOperation(format!(
                "booking {} is {}; payment needs a committed cart",
                saga.booking_id(),
                saga.state
            )));
        }
        let key = saga.request.idempotency_key.clone();
        if self.captured.contains(&key) {
            return Err(ServiceError::Conflict(format!("order {} was already paid", key)));
        }

        let zero = saga.amount_due.is_zero();
        let transaction = if zero {
            info!("fully sponsored; payment bypassed");
            PaymentTransaction::synthetic_zero(&self.settings.currency, &key)
        } else {
            saga.transition(SagaState::PaymentPending)?;
            match self.payments.charge(&key, saga.amount_due, payer).await {
                Ok(transaction) => transaction,
                Err(e) => {
                    warn!(error = %e, "payment session could not be opened");
                    PaymentTransaction::failed(
                        saga.amount_due,
                        &self.settings.currency,
                        format!("unopened-{}", key),
                        e.response_message(),
                    )
                }
            }
        };
        self.events.send_or_log(Event::PaymentSettled {
            booking_id: saga.booking_id(),
            state: transaction.state,
            amount: transaction.amount,
            reference: transaction.reference().to_string(),
        });

        if !transaction.is_captured() {
            let reason = match transaction.state {
                PaymentState::Cancelled => "payment was cancelled; your cart is unchanged".to_string(),
                _ => format!(
                    "payment failed: {}",
                    transaction
                        .failure_reason
                        .as_deref()
                        .unwrap_or("declined by the payment gateway")
                ),
            };
            saga.payment = Some(transaction);
            saga.transition(SagaState::PaymentAborted)?;
            saga.transition(SagaState::CartCommitted)?;
            return Err(ServiceError::PaymentAborted(reason));
        }

        self.captured.insert(key);
        saga.payment = Some(transaction);
        if !zero {
            saga.transition(SagaState::PaymentCaptured)?;
        }
        saga.transition(SagaState::OrderPlacing)?;
        let vendors = saga.vendors();
        self.place_orders(saga, vendors).await
    }

    /// Re-places only the orders that were not placed. Never charges again.
    #[instrument(skip(self, saga), fields(booking_id = %saga.booking_id()))]
    pub async fn retry_order_placement(&self, saga: &mut BookingSaga) -> Result<BookingOutcome, ServiceError> {
        if saga.state != SagaState::PartiallyFailed {
            return Err(ServiceError::InvalidOperation(format!(
                "booking {} is {}; only partially failed bookings can be retried",
                saga.booking_id(),
                saga.state
            )));
        }
        let vendors: Vec<VendorKey> = saga
            .orders
            .iter()
            .filter(|(_, result)| !result.is_placed())
            .map(|(vendor, _)| *vendor)
            .collect();
        saga.transition(SagaState::OrderPlacing)?;
        self.place_orders(saga, vendors).await
    }

    /// Support has settled a paid booking by hand: closes its reconciliation
    /// record and releases the cart entries it marked.
    #[instrument(skip(self, note))]
    pub async fn resolve_reconciliation(
        &self,
        booking_id: Uuid,
        note: impl Into<String>,
    ) -> Result<ReconciliationRecord, ServiceError> {
        let record = self.reconciliation.resolve(booking_id, note)?;
        match self.carts.release_markers(record.user_id, booking_id).await {
            Ok(released) => info!(%booking_id, released, "paid entries released"),
            Err(e) => warn!(%booking_id, error = %e, "could not release marked entries"),
        }
        Ok(record)
    }

    /// Drops the replay guard of a saga that is no longer tracked.
    pub fn forget(&self, idempotency_key: &str) {
        self.captured.remove(idempotency_key);
    }

    /// Gives up on a committed but unpaid booking and frees its lease.
    pub fn abandon(&self, saga: &mut BookingSaga) -> Result<(), ServiceError> {
        saga.transition(SagaState::Abandoned)
    }

    async fn place_orders(
        &self,
        saga: &mut BookingSaga,
        vendors: Vec<VendorKey>,
    ) -> Result<BookingOutcome, ServiceError> {
        let request = saga.request.clone();
        let payment_reference = saga
            .payment
            .as_ref()
            .map(|p| p.reference().to_string())
            .unwrap_or_default();

        if request.kind == CartKind::Diagnostic {
            self.persist_schedule(&request, &saga.remote_items, &vendors).await;
        }

        // Spawned so a vendor call finishes even if the caller goes away.
        let mut tasks = Vec::with_capacity(vendors.len());
        for vendor in vendors {
            let scoped = scoped_request(&request, vendor);
            let registry = Arc::clone(&self.vendors);
            let ctx = PlacementContext {
                booking_id: request.booking_id,
                appointment_ref: saga.appointment_ref.clone(),
                payment_reference: payment_reference.clone(),
                amount_paid: saga.amount_for(vendor),
            };
            let retry = self.settings.retry;
            let task = tokio::spawn(async move {
                let (registry, scoped, ctx) = (&registry, &scoped, &ctx);
                retry
                    .run(
                        "vendor.place_order",
                        move |_| registry.place(vendor, scoped, ctx),
                        VendorOrderResult::is_transient,
                    )
                    .await
            });
            tasks.push((vendor, task));
        }

        for (vendor, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(%vendor, error = %e, "vendor placement task failed");
                    VendorOrderResult::transient("order placement was interrupted")
                }
            };
            match &result {
                VendorOrderResult::Placed { vendor_order_id } => {
                    self.events.send_or_log(Event::VendorOrderPlaced {
                        booking_id: request.booking_id,
                        vendor,
                        vendor_order_id: vendor_order_id.clone(),
                    })
                }
                VendorOrderResult::Rejected { reason } | VendorOrderResult::TransientFailure { reason } => {
                    self.events.send_or_log(Event::VendorOrderFailed {
                        booking_id: request.booking_id,
                        vendor,
                        reason: reason.clone(),
                    })
                }
            }
            saga.orders.insert(vendor, result);
        }

        self.finish(saga).await
    }

    /// Writes the final date and time onto each remote cart item before its
    /// vendor is called. A failure here does not stop placement.
    async fn persist_schedule(
        &self,
        request: &BookingRequest,
        remote_items: &HashMap<Uuid, String>,
        vendors: &[VendorKey],
    ) {
        for entry in request.entries.iter().filter(|e| vendors.contains(&e.vendor())) {
            let item_id = remote_items
                .get(&entry.id())
                .map(String::as_str)
                .or_else(|| entry.remote_item_id());
            let Some(item_id) = item_id else {
                warn!(entry_id = %entry.id(), "no remote item to schedule");
                continue;
            };
            let slot = entry.slot().unwrap_or(&request.slot);
            if let Err(e) = self
                .remote_cart
                .update_schedule(request.user_id, item_id, slot)
                .await
            {
                warn!(entry_id = %entry.id(), error = %e, "could not persist schedule before placing order");
            }
        }
    }

    async fn finish(&self, saga: &mut BookingSaga) -> Result<BookingOutcome, ServiceError> {
        let request = saga.request.clone();
        let booking_id = request.booking_id;
        let payment_reference = saga
            .payment
            .as_ref()
            .map(|p| p.reference().to_string())
            .unwrap_or_default();

        let placed: Vec<PlacedOrder> = saga
            .orders
            .iter()
            .filter_map(|(vendor, result)| {
                result.vendor_order_id().map(|id| PlacedOrder {
                    vendor: *vendor,
                    vendor_order_id: id.to_string(),
                })
            })
            .collect();
        let failed: Vec<FailedOrder> = saga
            .orders
            .iter()
            .filter_map(|(vendor, result)| {
                result.reason().map(|reason| FailedOrder {
                    vendor: *vendor,
                    reason: reason.to_string(),
                })
            })
            .collect();
        let booked: Vec<Uuid> = request
            .entries
            .iter()
            .filter(|e| placed.iter().any(|p| p.vendor == e.vendor()))
            .map(CartEntry::id)
            .collect();
        let detached = saga.is_detached();

        if failed.is_empty() {
            if detached {
                info!(%booking_id, "view detached; cart left as is");
            } else if let Err(e) = self.carts.remove_many(request.user_id, &booked).await {
                warn!(%booking_id, error = %e, "booked entries could not be removed from the cart");
            }
            self.reconciliation
                .resolve_if_open(booking_id, "all vendor orders placed on retry");
            self.events.send_or_log(Event::BookingCompleted {
                booking_id,
                user_id: request.user_id,
                kind: request.kind,
            });
            saga.transition(SagaState::Completed)?;
            return Ok(BookingOutcome::Completed {
                booking_id,
                orders: placed,
                payment_reference,
            });
        }

        if detached {
            info!(%booking_id, "view detached; failure markers not written");
        } else {
            self.mark_pending(&request, &booked, &failed, &payment_reference).await;
        }
        let (amount, currency) = saga
            .payment
            .as_ref()
            .map(|p| (p.amount, p.currency.clone()))
            .unwrap_or((Decimal::ZERO, request.currency.clone()));
        self.reconciliation.enqueue(ReconciliationRecord::open(
            booking_id,
            request.user_id,
            request.kind,
            &payment_reference,
            amount,
            currency,
            failed.clone(),
        ));
        self.events.send_or_log(Event::ReconciliationRequired {
            booking_id,
            transaction_reference: payment_reference.clone(),
            vendors: failed.iter().map(|f| f.vendor).collect(),
            at: Utc::now(),
        });
        saga.transition(SagaState::PartiallyFailed)?;
        Ok(BookingOutcome::PendingConfirmation {
            booking_id,
            placed,
            failed,
            transaction_reference: payment_reference,
            support_contact: self.settings.support_contact.clone(),
        })
    }

    /// Removes what was booked and marks what was paid for but not booked.
    async fn mark_pending(
        &self,
        request: &BookingRequest,
        booked: &[Uuid],
        failed: &[FailedOrder],
        transaction_id: &str,
    ) {
        if !booked.is_empty() {
            if let Err(e) = self.carts.remove_many(request.user_id, booked).await {
                warn!(booking_id = %request.booking_id, error = %e, "booked entries could not be removed");
            }
        }
        for failure in failed {
            let ids: Vec<Uuid> = request
                .entries
                .iter()
                .filter(|e| e.vendor() == failure.vendor)
                .map(CartEntry::id)
                .collect();
            let marker = BookingMarker::PaymentReceivedBookingPending {
                booking_id: request.booking_id,
                transaction_id: transaction_id.to_string(),
                vendor: failure.vendor,
                reason: failure.reason.clone(),
                marked_at: Utc::now(),
            };
            if let Err(e) = self
                .carts
                .set_marker(request.user_id, &ids, Some(marker))
                .await
            {
                error!(
                    booking_id = %request.booking_id,
                    vendor = %failure.vendor,
                    error = %e,
                    "could not mark paid entries as pending"
                );
            }
        }
    }
}

/// The request narrowed to one vendor's entries.
fn scoped_request(request: &BookingRequest, vendor: VendorKey) -> BookingRequest {
    BookingRequest {
        entries: request
            .entries
            .iter()
            .filter(|e| e.vendor() == vendor)
            .cloned()
            .collect(),
        ..request.clone()
    }
}
