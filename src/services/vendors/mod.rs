//! One adapter per booking vendor. Adapters translate a [`BookingRequest`]
//! into the vendor's request shape and reduce whatever the vendor answers to a
//! [`VendorOrderResult`]. Vendor wording never leaves this module.

pub mod clinic;
pub mod home_collection;
pub mod lab_network;
pub mod partner_clinic;
pub mod phlebotomy;

use async_trait::async_trait;
use metrics::counter;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::integrations::{error_message, is_transient_status};
use crate::models::{BookingRequest, DiagnosticEntry, Gender, VendorKey, VendorOrderResult};
use crate::repositories::{VendorReference, VendorReferenceRepository};

pub use clinic::ClinicAdapter;
pub use home_collection::HomeCollectionAdapter;
pub use lab_network::LabNetworkAdapter;
pub use partner_clinic::PartnerClinicAdapter;
pub use phlebotomy::PhlebotomyAdapter;

/// What the saga knows at placement time beyond the booking snapshot.
#[derive(Debug, Clone)]
pub struct PlacementContext {
    pub booking_id: Uuid,
    /// Clinic case opened before payment, consultations only.
    pub appointment_ref: Option<String>,
    /// Captured payment reference (gateway payment id or synthetic session).
    pub payment_reference: String,
    pub amount_paid: Decimal,
}

#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn vendor(&self) -> VendorKey;

    /// Places one order for every entry in `request`. Transport failures and
    /// 5xx answers are `TransientFailure`; business declines are `Rejected`.
    async fn place_order(&self, request: &BookingRequest, ctx: &PlacementContext) -> VendorOrderResult;
}

/// Adapter lookup plus a circuit breaker per vendor.
pub struct VendorRegistry {
    adapters: HashMap<VendorKey, Arc<dyn VendorAdapter>>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl VendorRegistry {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            adapters: HashMap::new(),
            breakers,
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn VendorAdapter>) {
        self.adapters.insert(adapter.vendor(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn VendorAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn supports(&self, vendor: VendorKey) -> bool {
        self.adapters.contains_key(&vendor)
    }

    pub fn vendors(&self) -> Vec<VendorKey> {
        let mut vendors: Vec<_> = self.adapters.keys().copied().collect();
        vendors.sort();
        vendors
    }

    /// Places through the vendor's adapter unless its breaker is open.
    pub async fn place(
        &self,
        vendor: VendorKey,
        request: &BookingRequest,
        ctx: &PlacementContext,
    ) -> VendorOrderResult {
        let Some(adapter) = self.adapters.get(&vendor) else {
            return VendorOrderResult::rejected(format!("no adapter configured for {}", vendor));
        };

        let breaker = self.breakers.get(vendor);
        let result = if breaker.can_execute() {
            let result = adapter.place_order(request, ctx).await;
            if result.is_transient() {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }
            result
        } else {
            warn!(%vendor, "circuit open; skipping vendor call");
            VendorOrderResult::transient("circuit open")
        };

        counter!(
            "carebook.vendor.orders",
            1,
            "vendor" => vendor.to_string(),
            "outcome" => result.label()
        );
        result
    }
}

pub(crate) fn gender_code(gender: Gender) -> &'static str {
    match gender {
        Gender::Male => "M",
        Gender::Female => "F",
        Gender::Other => "O",
    }
}

pub(crate) fn diagnostic_entries(request: &BookingRequest) -> Vec<&DiagnosticEntry> {
    request
        .entries
        .iter()
        .filter_map(|e| match e {
            crate::models::CartEntry::Diagnostic(d) => Some(d),
            crate::models::CartEntry::Appointment(_) => None,
        })
        .collect()
}

/// Network-level failure: always transient.
pub(crate) fn transport_failure(vendor: VendorKey, err: reqwest::Error) -> VendorOrderResult {
    warn!(%vendor, error = %err, "vendor call failed in transit");
    VendorOrderResult::transient(format!("{} unreachable", vendor))
}

/// Non-success HTTP status: transient for 5xx/429/408, otherwise a decline.
pub(crate) fn status_failure(
    vendor: VendorKey,
    status: reqwest::StatusCode,
    body: &[u8],
) -> VendorOrderResult {
    warn!(
        %vendor,
        %status,
        body = %String::from_utf8_lossy(body),
        "vendor returned an error status"
    );
    if is_transient_status(status) {
        VendorOrderResult::transient(format!("{} returned {}", vendor, status))
    } else {
        VendorOrderResult::rejected(
            error_message(body).unwrap_or_else(|| format!("{} declined the order", vendor)),
        )
    }
}

/// Reads a response, splitting it into a success body or a normalised failure.
pub(crate) async fn read_response(
    vendor: VendorKey,
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<Vec<u8>, VendorOrderResult> {
    let response = response.map_err(|e| transport_failure(vendor, e))?;
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| transport_failure(vendor, e))?
        .to_vec();
    if status.is_success() {
        debug!(%vendor, body = %String::from_utf8_lossy(&body), "vendor response");
        Ok(body)
    } else {
        Err(status_failure(vendor, status, &body))
    }
}

pub(crate) async fn remember(
    references: &Arc<dyn VendorReferenceRepository>,
    reference: VendorReference,
) {
    let vendor = reference.vendor;
    if let Err(e) = references.record(reference).await {
        warn!(%vendor, error = %e, "failed to persist vendor reference");
    }
}
