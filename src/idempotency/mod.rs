//! Idempotency ledger guarding fulfillment.
//!
//! A caller must win [`IdempotencyLedger::claim`] before writing domain records for a
//! payment. Claims are leases: an in-flight claim that outlives its TTL may be taken
//! over, and both [`complete`](IdempotencyLedger::complete) and
//! [`release`](IdempotencyLedger::release) only act while the caller's token still
//! holds the claim.

pub mod database;
pub mod memory;
pub mod redis_ledger;

pub use database::DatabaseLedger;
pub use memory::InMemoryLedger;
pub use redis_ledger::RedisLedger;

use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt ledger entry for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Ids recorded once a payment has been materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentRecord {
    pub order_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub booking_number: Option<String>,
    pub session_token: Option<String>,
    pub client_secret_hash: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Proof of holding a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub key: String,
    pub token: String,
}

impl ClaimToken {
    pub(crate) fn issue(key: &str) -> Self {
        Self {
            key: key.to_string(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ClaimToken),
    AlreadyDone(FulfillmentRecord),
    InFlight,
}

pub fn intent_key(payment_intent_id: &str) -> String {
    format!("intent:{payment_intent_id}")
}

pub fn session_alias_key(session_token: &str) -> String {
    format!("session:{session_token}")
}

#[async_trait::async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, LedgerError>;

    /// Marks the claim done and records the ids. When the record carries a session
    /// token the same record is also stored under its alias key.
    async fn complete(
        &self,
        claim: &ClaimToken,
        record: &FulfillmentRecord,
    ) -> Result<(), LedgerError>;

    async fn release(&self, claim: &ClaimToken) -> Result<(), LedgerError>;

    /// Returns the record for a completed key; in-flight and unknown keys yield `None`.
    async fn lookup(&self, key: &str) -> Result<Option<FulfillmentRecord>, LedgerError>;
}
