//! HTTP clients for the collaborators the booking engine depends on.

pub mod clinic;
pub mod envelope;
pub mod gateway;
pub mod sponsorship;

use reqwest::StatusCode;
use std::time::Duration;
use tracing::warn;

use crate::errors::ServiceError;

pub use clinic::{
    AppointmentConfirmation, AppointmentRequest, ClinicApi, HttpClinicClient, LookupKind,
    LookupOption, RemoteCart,
};
pub use gateway::{GatewayClient, GatewayOrder};
pub use sponsorship::{HttpSponsorshipClient, SponsorshipApi, SponsorshipDecision};

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .gzip(true)
        .build()
        .map_err(|e| ServiceError::InternalError(format!("failed to build HTTP client: {}", e)))
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Statuses worth another attempt: server errors, throttling and timeouts.
pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Pulls a human-readable message out of an error body, if there is one.
pub(crate) fn error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    ["message", "error", "detail", "description", "msg"]
        .iter()
        .find_map(|key| value.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string)
}

/// Reads a response body, mapping non-success statuses onto the error taxonomy:
/// transient statuses become `UpstreamUnavailable`, 404 `NotFound`, other
/// client errors `VendorRejected`.
pub(crate) async fn checked_body(
    source: &str,
    response: reqwest::Response,
) -> Result<Vec<u8>, ServiceError> {
    let status = response.status();
    let body = response.bytes().await?.to_vec();
    if status.is_success() {
        return Ok(body);
    }

    warn!(
        source,
        %status,
        body = %String::from_utf8_lossy(&body),
        "upstream returned an error status"
    );
    let message = error_message(&body).unwrap_or_else(|| format!("{} returned {}", source, status));
    if is_transient_status(status) {
        Err(ServiceError::UpstreamUnavailable(message))
    } else if status == StatusCode::NOT_FOUND {
        Err(ServiceError::NotFound(message))
    } else {
        Err(ServiceError::VendorRejected(message))
    }
}
