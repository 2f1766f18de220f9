use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{remember, PlacementContext, VendorAdapter};
use crate::errors::ServiceError;
use crate::integrations::ClinicApi;
use crate::models::{BookingRequest, VendorKey, VendorOrderResult};
use crate::repositories::{VendorReference, VendorReferenceRepository};

/// Confirms a paid consultation against the case opened before payment.
pub struct ClinicAdapter {
    clinic: Arc<dyn ClinicApi>,
    references: Arc<dyn VendorReferenceRepository>,
}

impl ClinicAdapter {
    pub fn new(clinic: Arc<dyn ClinicApi>, references: Arc<dyn VendorReferenceRepository>) -> Self {
        Self { clinic, references }
    }
}

#[async_trait]
impl VendorAdapter for ClinicAdapter {
    fn vendor(&self) -> VendorKey {
        VendorKey::Clinic
    }

    #[instrument(skip(self, request, ctx), fields(booking_id = %ctx.booking_id))]
    async fn place_order(&self, request: &BookingRequest, ctx: &PlacementContext) -> VendorOrderResult {
        let Some(case_id) = ctx.appointment_ref.as_deref() else {
            return VendorOrderResult::rejected("no appointment case was opened for this booking");
        };

        match self
            .clinic
            .confirm_appointment(case_id, &request.slot, &ctx.payment_reference, ctx.amount_paid)
            .await
        {
            Ok(confirmation) if confirmation.confirmed == Some(false) => {
                let reason = confirmation
                    .message
                    .unwrap_or_else(|| "clinic declined the appointment".to_string());
                warn!(%case_id, %reason, "clinic declined confirmation");
                VendorOrderResult::rejected(reason)
            }
            Ok(confirmation) => {
                info!(%case_id, appointment = %confirmation.booking_id, "consultation confirmed");
                remember(
                    &self.references,
                    VendorReference::new(ctx.booking_id, VendorKey::Clinic, &confirmation.booking_id)
                        .with_attribute("case_id", case_id),
                )
                .await;
                VendorOrderResult::placed(confirmation.booking_id)
            }
            Err(e) if e.is_retryable() => {
                warn!(%case_id, error = %e, "clinic unavailable");
                VendorOrderResult::transient(e.to_string())
            }
            Err(ServiceError::VendorRejected(reason)) => VendorOrderResult::rejected(reason),
            Err(e) => {
                warn!(%case_id, error = %e, "clinic confirmation failed");
                VendorOrderResult::rejected(e.response_message())
            }
        }
    }
}
