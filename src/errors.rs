use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Error body returned by every HTTP endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Additional detail, e.g. the support path for a partial commit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Caught before any network call: missing beneficiary, no slot, expired slot.
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Network/HTTP failure talking to a collaborator.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Business-rule decline from a vendor; surfaced verbatim.
    #[error("Vendor rejected the booking: {0}")]
    VendorRejected(String),

    /// User-cancelled or gateway-declined payment; the cart is preserved.
    #[error("Payment aborted: {0}")]
    PaymentAborted(String),

    /// Payment captured but one or more vendor orders were not placed.
    #[error("Payment received, booking pending: {0}")]
    PartialCommit(String),

    #[error("Failed to create appointment: {0}")]
    AppointmentFailed(String),

    #[error("Failed to add to cart: {0}")]
    CartCommitFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Circuit breaker open")]
    CircuitBreakerOpen,

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        ServiceError::UpstreamUnavailable(err.to_string())
    }
}

impl From<redis::RedisError> for ServiceError {
    fn from(err: redis::RedisError) -> Self {
        ServiceError::CacheError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ValidationError(_) | Self::InvalidOperation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::VendorRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PaymentAborted(_) => StatusCode::PAYMENT_REQUIRED,
            Self::PartialCommit(_) => StatusCode::ACCEPTED,
            Self::UpstreamUnavailable(_)
            | Self::AppointmentFailed(_)
            | Self::CartCommitFailed(_) => StatusCode::BAD_GATEWAY,
            Self::CircuitBreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            Self::CacheError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::CacheError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            Self::CircuitBreakerOpen => "Service temporarily unavailable".to_string(),
            _ => self.to_string(),
        }
    }

    /// Only network-level failures are eligible for the bounded retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable(_) | Self::CircuitBreakerOpen)
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}
