use axum::{
    extract::{Path, State},
    response::Response,
    routing::post,
    Json, Router,
};
use tracing::info;

use super::common::no_content_response;
use crate::errors::ServiceError;
use crate::services::payments::CheckoutOutcome;
use crate::AppState;

/// Checkout modal result for an open payment session
///
/// A completed payment carries the gateway payment id and signature; the
/// signature is verified before the booking proceeds.
async fn payment_callback(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(outcome): Json<CheckoutOutcome>,
) -> Result<Response, ServiceError> {
    info!(%session_id, "payment callback received");
    state
        .bookings
        .orchestrator()
        .payments()
        .complete(&session_id, outcome)
        .await?;
    Ok(no_content_response())
}

pub fn payment_routes() -> Router<AppState> {
    Router::new().route("/payments/:session_id/callback", post(payment_callback))
}
