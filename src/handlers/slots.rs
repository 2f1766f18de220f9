use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::get,
    Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use validator::Validate;

use super::common::{success_response, validate_input};
use crate::errors::ServiceError;
use crate::integrations::LookupKind;
use crate::models::{DayPeriod, SlotQuery, VendorKey};
use crate::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct SlotParams {
    pub vendor: VendorKey,
    /// Doctor id for consultations, center id for diagnostics
    #[validate(length(min = 1, max = 128))]
    pub provider_ref: String,
    pub branch_id: Option<String>,
    pub date: NaiveDate,
    pub period: DayPeriod,
}

/// List bookable slots for a provider, date and period
async fn list_slots(
    State(state): State<AppState>,
    Query(params): Query<SlotParams>,
) -> Result<Response, ServiceError> {
    validate_input(&params)?;
    let query = SlotQuery {
        vendor: params.vendor,
        provider_ref: params.provider_ref,
        branch_id: params.branch_id,
        date: params.date,
        period: params.period,
    };
    let slots = state.slots.list_slots(&query).await?;
    Ok(success_response(slots))
}

/// Specialization, language and pincode option lists. Never fails.
async fn lookup(State(state): State<AppState>, Path(kind): Path<LookupKind>) -> Response {
    success_response(state.clinic.lookup(kind).await)
}

pub fn slot_routes() -> Router<AppState> {
    Router::new()
        .route("/slots", get(list_slots))
        .route("/lookups/:kind", get(lookup))
}
