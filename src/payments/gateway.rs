use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Payment state as reported by the provider, collapsed to what confirmation needs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    RequiresAction,
    Succeeded,
    Failed,
}

/// Provider-side view of a payment intent. This, not anything the client sends, is
/// the source of truth for whether money moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvidence {
    pub intent_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub metadata: HashMap<String, String>,
    pub failure_message: Option<String>,
}

impl PaymentEvidence {
    pub fn session_token(&self) -> Option<&str> {
        self.metadata.get("session_token").map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedIntent {
    pub intent_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("payment gateway unavailable: {0}")]
    Transient(String),
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("{0}")]
    NotFound(String),
    #[error("unexpected gateway response: {0}")]
    InvalidResponse(String),
    #[error("payment gateway circuit open")]
    CircuitOpen,
}

impl GatewayError {
    /// Errors worth retrying later. They also count against the circuit breaker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Transient(_) | GatewayError::InvalidResponse(_) | GatewayError::CircuitOpen
        )
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        metadata: HashMap<String, String>,
    ) -> Result<CreatedIntent, GatewayError>;

    async fn get_intent(&self, intent_id: &str) -> Result<PaymentEvidence, GatewayError>;
}
