//! Carebook booking engine
//!
//! Resolves bookable slots, mirrors the per-user cart, takes payment and
//! places orders with the clinic and diagnostics vendors, exposed over HTTP.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod integrations;
pub mod models;
pub mod repositories;
pub mod retry;
pub mod services;

use axum::Router;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::integrations::ClinicApi;
use crate::services::booking::BookingService;
use crate::services::cart_store::CartStore;
use crate::services::slot_resolver::SlotResolver;

/// Upper bound for any request; payment waits return well before it.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub slots: Arc<SlotResolver>,
    pub carts: Arc<CartStore>,
    pub bookings: Arc<BookingService>,
    pub clinic: Arc<dyn ClinicApi>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub event_sender: events::EventSender,
}

// Common response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn validation_errors(errors: Vec<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some("Validation failed".to_string()),
            errors: Some(errors),
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Every versioned endpoint, mounted under `/api/v1`.
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .merge(handlers::slots::slot_routes())
        .merge(handlers::carts::cart_routes())
        .merge(handlers::bookings::booking_routes())
        .merge(handlers::payments::payment_routes())
        .merge(handlers::reconciliation::reconciliation_routes())
}

/// Full application router with health probes, the v1 API and the HTTP
/// layers. `cors` comes from the caller so tests can pass a permissive one.
pub fn app_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .nest("/health", handlers::health::health_routes())
        .nest("/api/v1", api_v1_routes())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn success_response_carries_timestamp() {
        let response = ApiResponse::success("ok");
        assert!(response.success);
        let meta = response.meta.expect("metadata expected");
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[test]
    fn with_message_keeps_data() {
        let response = ApiResponse::success(7).with_message("pending");
        assert_eq!(response.data, Some(7));
        assert_eq!(response.message.as_deref(), Some("pending"));
    }

    #[test]
    fn validation_errors_are_listed() {
        let response = ApiResponse::<()>::validation_errors(vec!["slot is required".into()]);
        assert!(!response.success);
        assert_eq!(response.errors.as_ref().map(Vec::len), Some(1));
        assert_eq!(response.message.as_deref(), Some("Validation failed"));
    }
}
