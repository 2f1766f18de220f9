use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::common::{success_response, validate_input};
use crate::errors::ServiceError;
use crate::services::reconciliation::ReconciliationStatus;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ReconciliationFilter {
    pub status: Option<ReconciliationStatus>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct Resolution {
    #[validate(length(min = 1, max = 1000))]
    pub note: String,
}

/// Paid bookings waiting on support
async fn list_records(
    State(state): State<AppState>,
    Query(filter): Query<ReconciliationFilter>,
) -> Response {
    success_response(
        state
            .bookings
            .orchestrator()
            .reconciliation()
            .list(filter.status),
    )
}

async fn resolve_record(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(resolution): Json<Resolution>,
) -> Result<Response, ServiceError> {
    validate_input(&resolution)?;
    let record = state
        .bookings
        .orchestrator()
        .resolve_reconciliation(booking_id, resolution.note)
        .await?;
    Ok(success_response(record))
}

pub fn reconciliation_routes() -> Router<AppState> {
    Router::new()
        .route("/reconciliation", get(list_records))
        .route("/reconciliation/:booking_id/resolve", post(resolve_record))
}
