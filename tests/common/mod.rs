#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use carebook::{
    circuit_breaker::CircuitBreakerRegistry,
    config::AppConfig,
    errors::ServiceError,
    events::{self, EventSender},
    integrations::{
        AppointmentConfirmation, AppointmentRequest, ClinicApi, LookupKind, LookupOption,
        RemoteCart, SponsorshipApi, SponsorshipDecision,
    },
    models::{
        AppointmentEntry, Beneficiary, BeneficiaryProfile, BookingRequest, Cart, CartEntry,
        CartKind, ContactAddress, DiagnosticEntry, Gender, PayerDetails, PaymentTransaction,
        RawSlot, SlotQuery, TimeSlot, VendorKey, VendorOrderResult,
    },
    repositories::InMemoryCartRepository,
    retry::RetryPolicy,
    services::{
        booking::{BookingOrchestrator, BookingService, Collaborators, LeaseRegistry, SagaSettings},
        cart_store::CartStore,
        payments::PaymentCoordinator,
        reconciliation::ReconciliationQueue,
        slot_resolver::{SlotResolver, SlotSource},
        vendors::{PlacementContext, VendorAdapter, VendorRegistry},
    },
    AppState,
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

pub const SUPPORT: &str = "help@carebook.test";

pub fn ist() -> FixedOffset {
    FixedOffset::east_opt(330 * 60).expect("valid offset")
}

/// A moment safely before every slot the tests book.
pub fn before_slots() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 12, 31, 6, 0, 0).unwrap()
}

pub fn slot(vendor: VendorKey, id: &str, date: (i32, u32, u32), hh: u32, mm: u32) -> TimeSlot {
    TimeSlot::new(
        vendor,
        id,
        NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
        NaiveTime::from_hms_opt(hh, mm, 0).unwrap(),
        None,
        format!("{:02}:{:02}", hh, mm),
    )
}

pub fn profile() -> BeneficiaryProfile {
    BeneficiaryProfile {
        reference: Beneficiary::AccountHolder,
        first_name: "Asha".into(),
        last_name: "Rao".into(),
        gender: Gender::Female,
        date_of_birth: NaiveDate::from_ymd_opt(1990, 6, 15),
        age_years: None,
        phone: "9876543210".into(),
        email: Some("asha@example.com".into()),
        address: Some(ContactAddress {
            line1: "12 MG Road".into(),
            city: Some("Bengaluru".into()),
            pincode: "560001".into(),
            latitude: Some(12.97),
            longitude: Some(77.59),
        }),
    }
}

pub fn payer() -> PayerDetails {
    PayerDetails {
        name: "Asha Rao".into(),
        email: Some("asha@example.com".into()),
        phone: Some("9876543210".into()),
    }
}

pub fn diagnostic(user: Uuid, test: &str, vendor: VendorKey, price: Decimal) -> CartEntry {
    CartEntry::Diagnostic(DiagnosticEntry {
        id: Uuid::new_v4(),
        user_id: user,
        beneficiary: Beneficiary::AccountHolder,
        vendor,
        test_id: test.to_string(),
        test_name: test.to_string(),
        center_id: "center-x".to_string(),
        branch_id: None,
        product_code: None,
        unit_price: price,
        quantity: 1,
        slot: None,
        remote_item_id: None,
        marker: None,
    })
}

pub fn consultation(user: Uuid, doctor: &str, price: Decimal) -> CartEntry {
    CartEntry::Appointment(AppointmentEntry {
        id: Uuid::new_v4(),
        user_id: user,
        beneficiary: Beneficiary::AccountHolder,
        vendor: VendorKey::Clinic,
        doctor_id: doctor.to_string(),
        service_id: doctor.to_string(),
        unit_price: price,
        slot: None,
        remote_item_id: None,
        marker: None,
    })
}

/// Clinic service stand-in: slots, appointment cases and the remote cart.
#[derive(Default)]
pub struct FakeClinic {
    pub slots: Mutex<Vec<RawSlot>>,
    pub slot_failures: AtomicU32,
    pub slot_calls: AtomicU32,
    pub fail_appointment: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_push: AtomicBool,
    pub fail_fetch: AtomicBool,
    pub remote: Mutex<HashMap<Uuid, Vec<CartEntry>>>,
    pub commits: AtomicU32,
    pub schedules: Mutex<Vec<(String, TimeSlot)>>,
    pub confirmations: Mutex<Vec<(String, String)>>,
}

impl FakeClinic {
    pub fn remote_entries(&self, user: Uuid) -> Vec<CartEntry> {
        self.remote.lock().unwrap().get(&user).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl SlotSource for FakeClinic {
    async fn fetch_slots(&self, _query: &SlotQuery) -> Result<Vec<RawSlot>, ServiceError> {
        self.slot_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.slot_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.slot_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ServiceError::UpstreamUnavailable("slot service unavailable".into()));
        }
        Ok(self.slots.lock().unwrap().clone())
    }
}

#[async_trait]
impl ClinicApi for FakeClinic {
    async fn create_appointment(&self, request: &AppointmentRequest) -> Result<String, ServiceError> {
        if self.fail_appointment.load(Ordering::SeqCst) {
            return Err(ServiceError::UpstreamUnavailable("doctor unavailable".into()));
        }
        Ok(format!("CASE-{}", request.doctor_id))
    }

    async fn confirm_appointment(
        &self,
        case_id: &str,
        _slot: &TimeSlot,
        payment_reference: &str,
        _amount: Decimal,
    ) -> Result<AppointmentConfirmation, ServiceError> {
        self.confirmations
            .lock()
            .unwrap()
            .push((case_id.to_string(), payment_reference.to_string()));
        Ok(AppointmentConfirmation {
            booking_id: format!("APT-{}", case_id),
            confirmed: Some(true),
            message: None,
        })
    }

    async fn lookup(&self, kind: LookupKind) -> Vec<LookupOption> {
        match kind {
            LookupKind::Languages => vec![LookupOption {
                id: "en".into(),
                name: "English".into(),
            }],
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl RemoteCart for FakeClinic {
    async fn fetch(&self, user_id: Uuid) -> Result<Vec<CartEntry>, ServiceError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ServiceError::UpstreamUnavailable("cart service down".into()));
        }
        Ok(self.remote_entries(user_id))
    }

    async fn push(&self, cart: &Cart) -> Result<(), ServiceError> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(ServiceError::UpstreamUnavailable("cart service down".into()));
        }
        self.remote
            .lock()
            .unwrap()
            .insert(cart.user_id, cart.entries.clone());
        Ok(())
    }

    async fn commit_item(
        &self,
        _user_id: Uuid,
        entry: &CartEntry,
        _discount_percent: Decimal,
    ) -> Result<String, ServiceError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(ServiceError::UpstreamUnavailable("cart service rejected item".into()));
        }
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("ITEM-{}-{}", n, entry.service_ref()))
    }

    async fn update_schedule(
        &self,
        _user_id: Uuid,
        item_id: &str,
        slot: &TimeSlot,
    ) -> Result<(), ServiceError> {
        self.schedules
            .lock()
            .unwrap()
            .push((item_id.to_string(), slot.clone()));
        Ok(())
    }
}

/// Sponsorship per service id; anything unlisted is not sponsored.
#[derive(Default)]
pub struct FakeSponsorship {
    pub decisions: Mutex<HashMap<String, SponsorshipDecision>>,
    pub fail: AtomicBool,
}

impl FakeSponsorship {
    pub fn sponsor(&self, service_id: &str, discount_percent: Option<Decimal>) {
        self.decisions.lock().unwrap().insert(
            service_id.to_string(),
            SponsorshipDecision {
                available: true,
                discount_percent,
            },
        );
    }
}

#[async_trait]
impl SponsorshipApi for FakeSponsorship {
    async fn check(
        &self,
        _user_id: Uuid,
        _beneficiary: &Beneficiary,
        service_id: &str,
    ) -> Result<SponsorshipDecision, ServiceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceError::UpstreamUnavailable("sponsorship lookup timed out".into()));
        }
        Ok(self
            .decisions
            .lock()
            .unwrap()
            .get(service_id)
            .copied()
            .unwrap_or_else(SponsorshipDecision::not_sponsored))
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedCharge {
    Capture,
    Dismiss,
    Decline(String),
    Unavailable,
}

/// Payment coordinator that settles immediately from a script. Captures by
/// default once the script runs out.
#[derive(Default)]
pub struct ScriptedPayments {
    pub script: Mutex<VecDeque<ScriptedCharge>>,
    pub charges: Mutex<Vec<(String, Decimal)>>,
}

impl ScriptedPayments {
    pub fn then(&self, charge: ScriptedCharge) {
        self.script.lock().unwrap().push_back(charge);
    }

    pub fn charge_count(&self) -> usize {
        self.charges.lock().unwrap().len()
    }
}

#[async_trait]
impl PaymentCoordinator for ScriptedPayments {
    async fn charge(
        &self,
        idempotency_key: &str,
        amount: Decimal,
        _payer: &PayerDetails,
    ) -> Result<PaymentTransaction, ServiceError> {
        let n = {
            let mut charges = self.charges.lock().unwrap();
            charges.push((idempotency_key.to_string(), amount));
            charges.len()
        };
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedCharge::Capture);
        let session = format!("order_{}", n);
        match next {
            ScriptedCharge::Capture => Ok(PaymentTransaction::captured(
                amount,
                "INR",
                session,
                format!("pay_{}", n),
            )),
            ScriptedCharge::Dismiss => Ok(PaymentTransaction::cancelled(amount, "INR", session)),
            ScriptedCharge::Decline(reason) => {
                Ok(PaymentTransaction::failed(amount, "INR", session, reason))
            }
            ScriptedCharge::Unavailable => {
                Err(ServiceError::UpstreamUnavailable("payment gateway unavailable".into()))
            }
        }
    }
}

/// Vendor adapter that answers from a script, placing `<VENDOR>-<n>` once
/// the script runs out.
pub struct ScriptedVendor {
    vendor: VendorKey,
    script: Mutex<VecDeque<VendorOrderResult>>,
    pub calls: AtomicU32,
    pub requests: Mutex<Vec<BookingRequest>>,
    pub amounts: Mutex<Vec<Decimal>>,
    pub delay: Duration,
}

impl ScriptedVendor {
    pub fn new(vendor: VendorKey) -> Self {
        Self {
            vendor,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            amounts: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then(&self, result: VendorOrderResult) -> &Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VendorAdapter for ScriptedVendor {
    fn vendor(&self) -> VendorKey {
        self.vendor
    }

    async fn place_order(&self, request: &BookingRequest, ctx: &PlacementContext) -> VendorOrderResult {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());
        self.amounts.lock().unwrap().push(ctx.amount_paid);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| VendorOrderResult::placed(format!("{}-{}", self.vendor, n)))
    }
}

/// Fully wired engine over fakes.
pub struct Harness {
    pub clinic: Arc<FakeClinic>,
    pub sponsorship: Arc<FakeSponsorship>,
    pub payments: Arc<ScriptedPayments>,
    pub vendors: HashMap<VendorKey, Arc<ScriptedVendor>>,
    pub carts: Arc<CartStore>,
    pub slots: Arc<SlotResolver>,
    pub reconciliation: Arc<ReconciliationQueue>,
    pub leases: Arc<LeaseRegistry>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub orchestrator: Arc<BookingOrchestrator>,
    pub bookings: Arc<BookingService>,
    pub events: EventSender,
    _event_task: tokio::task::JoinHandle<()>,
}

pub struct HarnessBuilder {
    vendors: Vec<ScriptedVendor>,
    payments: Option<Arc<dyn PaymentCoordinator>>,
}

impl HarnessBuilder {
    pub fn vendor(mut self, vendor: ScriptedVendor) -> Self {
        self.vendors.push(vendor);
        self
    }

    /// Replaces the scripted coordinator, e.g. with a gateway-backed one.
    pub fn payments(mut self, payments: Arc<dyn PaymentCoordinator>) -> Self {
        self.payments = Some(payments);
        self
    }

    pub fn build(self) -> Harness {
        let (events, rx) = EventSender::channel(256);
        let event_task = tokio::spawn(events::process_events(rx));

        let clinic = Arc::new(FakeClinic::default());
        let sponsorship = Arc::new(FakeSponsorship::default());
        let scripted = Arc::new(ScriptedPayments::default());
        let payments = self
            .payments
            .unwrap_or_else(|| scripted.clone() as Arc<dyn PaymentCoordinator>);
        let carts = Arc::new(CartStore::new(
            Arc::new(InMemoryCartRepository::new()),
            clinic.clone(),
            events.clone(),
        ));
        let retry = RetryPolicy::new(1, Duration::ZERO);
        let slots = Arc::new(
            SlotResolver::new(retry, ist())
                .with_source(VendorKey::Clinic, clinic.clone())
                .with_source(VendorKey::PartnerClinic, clinic.clone()),
        );
        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let mut registry = VendorRegistry::new(breakers.clone());
        let mut vendors = HashMap::new();
        for vendor in self.vendors {
            let vendor = Arc::new(vendor);
            vendors.insert(vendor.vendor(), vendor.clone());
            registry.register(vendor);
        }
        let reconciliation = Arc::new(ReconciliationQueue::new());
        let leases = Arc::new(LeaseRegistry::default());
        let orchestrator = Arc::new(BookingOrchestrator::new(
            Collaborators {
                carts: carts.clone(),
                clinic: clinic.clone(),
                remote_cart: clinic.clone(),
                sponsorship: sponsorship.clone(),
                payments,
                vendors: Arc::new(registry),
                reconciliation: reconciliation.clone(),
                leases: leases.clone(),
                events: events.clone(),
            },
            SagaSettings {
                retry,
                offset: ist(),
                currency: "INR".into(),
                support_contact: SUPPORT.into(),
            },
        ));
        let bookings = Arc::new(BookingService::new(orchestrator.clone()));

        Harness {
            clinic,
            sponsorship,
            payments: scripted,
            vendors,
            carts,
            slots,
            reconciliation,
            leases,
            breakers,
            orchestrator,
            bookings,
            events,
            _event_task: event_task,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            vendors: Vec::new(),
            payments: None,
        }
    }

    /// Clinic plus one lab vendor, both placing on the first call.
    pub fn standard() -> Self {
        Self::builder()
            .vendor(ScriptedVendor::new(VendorKey::Clinic))
            .vendor(ScriptedVendor::new(VendorKey::LabNetwork))
            .build()
    }

    pub fn vendor(&self, vendor: VendorKey) -> &Arc<ScriptedVendor> {
        &self.vendors[&vendor]
    }

    pub async fn add(&self, entry: CartEntry) -> Uuid {
        let id = entry.id();
        self.carts.add(entry).await.expect("entry added");
        id
    }

    pub async fn partition(&self, user: Uuid, kind: CartKind) -> Vec<CartEntry> {
        self.carts
            .snapshot(user)
            .await
            .expect("snapshot")
            .entries_of(kind)
            .cloned()
            .collect()
    }

    pub fn state(&self) -> AppState {
        let config = AppConfig::new(
            "http://clinic.test".into(),
            "http://sponsor.test".into(),
            "http://gateway.test".into(),
            "rzp_test".into(),
            "gateway-secret".into(),
            "test".into(),
        );
        AppState {
            config: Arc::new(config),
            slots: self.slots.clone(),
            carts: self.carts.clone(),
            bookings: self.bookings.clone(),
            clinic: self.clinic.clone(),
            breakers: self.breakers.clone(),
            event_sender: self.events.clone(),
        }
    }

    pub fn router(&self) -> Router {
        carebook::app_router(self.state(), CorsLayer::permissive())
    }
}
