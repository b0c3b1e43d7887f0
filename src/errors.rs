use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

use crate::checkout::store::DraftStoreError;
use crate::fulfillment::SchemaError;
use crate::idempotency::LedgerError;
use crate::payments::GatewayError;

fn current_request_id() -> Option<String> {
    crate::telemetry::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Payment Required")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Whether repeating the same request may succeed
    pub retryable: bool,
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The gateway reported a terminal decline for this attempt.
    #[error("Payment rejected: {0}")]
    PaymentRejected(String),

    /// Network, timeout or 5xx from the payment gateway. Never a payment failure.
    #[error("Payment gateway unavailable: {0}")]
    TransientGateway(String),

    /// A required write in the fulfillment path failed; the claim was released.
    #[error("Materialization failed: {0}")]
    MaterializationFailed(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
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

impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Declined(msg) => ServiceError::PaymentRejected(msg),
            GatewayError::NotFound(id) => {
                ServiceError::NotFound(format!("payment intent {} not found", id))
            }
            other => ServiceError::TransientGateway(other.to_string()),
        }
    }
}

impl From<DraftStoreError> for ServiceError {
    fn from(err: DraftStoreError) -> Self {
        match err {
            DraftStoreError::Serialization(e) => ServiceError::SerializationError(e.to_string()),
            other => ServiceError::CacheError(other.to_string()),
        }
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Database(e) => ServiceError::DatabaseError(e),
            other => ServiceError::CacheError(other.to_string()),
        }
    }
}

impl From<SchemaError> for ServiceError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::Database(e) => ServiceError::DatabaseError(e),
            other => ServiceError::SchemaError(other.to_string()),
        }
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidInput(_) | Self::InvalidOperation(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::PaymentRejected(_) => StatusCode::PAYMENT_REQUIRED,
            Self::TransientGateway(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError(_)
            | Self::MaterializationFailed(_)
            | Self::CacheError(_)
            | Self::SerializationError(_)
            | Self::SchemaError(_)
            | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller should retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientGateway(_) | Self::MaterializationFailed(_) | Self::Conflict(_)
        )
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::MaterializationFailed(_) => "could not complete booking".to_string(),
            Self::TransientGateway(_) => {
                "Payment provider temporarily unavailable, please retry".to_string()
            }
            Self::CacheError(_)
            | Self::SerializationError(_)
            | Self::SchemaError(_)
            | Self::InternalError(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: None,
            request_id: current_request_id(),
            retryable: self.is_retryable(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
