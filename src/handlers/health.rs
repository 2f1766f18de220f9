use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::circuit_breaker::CircuitState;
use crate::AppState;

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: String,
    pub timestamp: String,
    pub uptime_secs: u64,
    pub details: HealthDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthDetails {
    /// Breaker state per vendor that has been called at least once
    pub vendors: BTreeMap<String, CircuitState>,
    /// Paid bookings waiting on support
    pub open_reconciliations: usize,
    /// Users whose remote cart is behind
    pub unsynced_carts: usize,
    pub live_bookings: usize,
}

static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Call once on startup so uptime is measured from boot.
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

fn uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

/// Liveness probe
async fn liveness_check() -> impl IntoResponse {
    Json(json!({
        "status": "up",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// An open vendor circuit degrades the service but never takes it down;
/// bookings for other vendors still go through.
pub fn overall_status(vendors: &BTreeMap<String, CircuitState>) -> ComponentStatus {
    if vendors.values().all(|s| *s == CircuitState::Closed) {
        ComponentStatus::Up
    } else {
        ComponentStatus::Degraded
    }
}

async fn detailed_health_check(State(state): State<AppState>) -> impl IntoResponse {
    let vendors: BTreeMap<String, CircuitState> = state
        .breakers
        .states()
        .into_iter()
        .map(|(vendor, s)| (vendor.to_string(), s))
        .collect();
    let status = overall_status(&vendors);

    let response = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: uptime_secs(),
        details: HealthDetails {
            vendors,
            open_reconciliations: state.bookings.orchestrator().reconciliation().open_count(),
            unsynced_carts: state.carts.dirty_count(),
            live_bookings: state.bookings.len(),
        },
    };

    (StatusCode::OK, Json(response))
}

/// - GET /health          liveness
/// - GET /health/detailed vendor circuits and backlog counters
pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(liveness_check))
        .route("/detailed", get(detailed_health_check))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_circuit_degrades() {
        let mut vendors = BTreeMap::new();
        vendors.insert("clinic".to_string(), CircuitState::Closed);
        assert_eq!(overall_status(&vendors), ComponentStatus::Up);
        vendors.insert("lab_network".to_string(), CircuitState::Open);
        assert_eq!(overall_status(&vendors), ComponentStatus::Degraded);
    }

    #[test]
    fn no_vendors_called_yet_is_up() {
        assert_eq!(overall_status(&BTreeMap::new()), ComponentStatus::Up);
    }
}
