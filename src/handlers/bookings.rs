use axum::{
    extract::{Path, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::common::{accepted_response, created_response, no_content_response, success_response};
use crate::errors::ServiceError;
use crate::models::PayerDetails;
use crate::services::booking::{BookingDraft, BookingOutcome, PaymentStep};
use crate::AppState;

/// How long a pay request waits for a checkout session or a settled outcome.
const CHECKOUT_WAIT: Duration = Duration::from_secs(5);

fn outcome_response(outcome: BookingOutcome) -> Response {
    let message = outcome.message();
    if outcome.is_completed() {
        success_response(outcome)
    } else {
        accepted_response(outcome, message)
    }
}

/// Validate the selection and run every step up to a committed cart
async fn start_booking(
    State(state): State<AppState>,
    Json(draft): Json<BookingDraft>,
) -> Result<Response, ServiceError> {
    let view = state.bookings.start(draft).await?;
    info!(booking_id = %view.booking_id, state = %view.state, "booking created");
    Ok(created_response(view))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    Ok(success_response(state.bookings.get(booking_id)?))
}

/// Take payment and place the vendor orders
///
/// Answers with the checkout session while the payer is in the modal, or
/// with the final outcome when it settles first.
async fn pay_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
    Json(payer): Json<PayerDetails>,
) -> Result<Response, ServiceError> {
    let bookings = Arc::clone(&state.bookings);
    match bookings.pay_or_checkout(booking_id, payer, CHECKOUT_WAIT).await? {
        PaymentStep::Settled { outcome } => Ok(outcome_response(outcome)),
        step @ PaymentStep::AwaitingPayment { .. } => Ok(accepted_response(
            step,
            "complete the payment to confirm the booking",
        )),
    }
}

/// Re-place orders that failed after payment; never charges again
async fn retry_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    Ok(outcome_response(state.bookings.retry(booking_id).await?))
}

async fn detach_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    state.bookings.detach(booking_id)?;
    Ok(no_content_response())
}

async fn abandon_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<Uuid>,
) -> Result<Response, ServiceError> {
    Ok(success_response(state.bookings.abandon(booking_id).await?))
}

pub fn booking_routes() -> Router<AppState> {
    Router::new()
        .route("/bookings", post(start_booking))
        .route("/bookings/:id", get(get_booking).delete(abandon_booking))
        .route("/bookings/:id/pay", post(pay_booking))
        .route("/bookings/:id/retry", post(retry_booking))
        .route("/bookings/:id/detach", post(detach_booking))
}
