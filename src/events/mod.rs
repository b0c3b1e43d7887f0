//! Post-commit events produced by fulfillment.
//!
//! Materialization returns a list of [`FulfillmentEvent`]s. Once the ledger records the
//! payment as done, [`PostCommitDispatcher`] hands each event to every registered
//! handler. A failing handler is logged and counted; it never affects other handlers
//! or the already committed booking.

pub mod handlers;

pub use handlers::{EscrowHandler, NotificationHandler, PackageCreditHandler, ReminderHandler};

use crate::checkout::PackageType;
use crate::errors::ServiceError;
use crate::notifications::NotificationError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSummary {
    pub booking_id: Uuid,
    pub booking_number: String,
    pub provider_id: Uuid,
    pub guardian_id: Uuid,
    pub guardian_name: String,
    pub guardian_email: String,
    pub minor_names: Vec<String>,
    pub package_type: PackageType,
    pub total_sessions: i32,
    pub amount_paid_cents: i64,
    pub platform_fee_cents: i64,
    pub provider_payout_cents: i64,
    pub currency: String,
    pub payment_intent_id: String,
    pub session_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: Uuid,
    pub order_number: String,
    pub guardian_name: String,
    pub guardian_email: String,
    pub total_cents: i64,
    pub currency: String,
    pub payment_intent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FulfillmentEvent {
    BookingConfirmed(BookingSummary),
    OrderCreated(OrderSummary),
    /// The payment succeeded but the retail order could not be written; an admin
    /// has to create it by hand.
    RetailOrderFailed {
        payment_intent_id: String,
        guardian_name: String,
        guardian_email: String,
        total_cents: i64,
        currency: String,
        reason: String,
    },
}

impl FulfillmentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FulfillmentEvent::BookingConfirmed(_) => "booking_confirmed",
            FulfillmentEvent::OrderCreated(_) => "order_created",
            FulfillmentEvent::RetailOrderFailed { .. } => "retail_order_failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum SideEffectError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Notification(#[from] NotificationError),
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("{0}")]
    Multiple(String),
}

#[async_trait]
pub trait PostCommitHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handlers ignore events they do not care about.
    async fn handle(&self, event: &FulfillmentEvent) -> Result<(), SideEffectError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub event: &'static str,
    pub message: String,
}

#[derive(Clone, Default)]
pub struct PostCommitDispatcher {
    handlers: Vec<Arc<dyn PostCommitHandler>>,
}

impl PostCommitDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn PostCommitHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Runs every handler for every event, in order. Returns the failures.
    pub async fn dispatch(&self, events: &[FulfillmentEvent]) -> Vec<HandlerFailure> {
        let mut failures = Vec::new();
        for event in events {
            for handler in &self.handlers {
                match handler.handle(event).await {
                    Ok(()) => debug!(handler = handler.name(), event = event.name(), "side effect done"),
                    Err(e) => {
                        error!(
                            handler = handler.name(),
                            event = event.name(),
                            error = %e,
                            "side effect failed"
                        );
                        counter!("side_effect_failures_total", 1, "handler" => handler.name());
                        failures.push(HandlerFailure {
                            handler: handler.name(),
                            event: event.name(),
                            message: e.to_string(),
                        });
                    }
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);
    struct Failing;

    #[async_trait]
    impl PostCommitHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }
        async fn handle(&self, _: &FulfillmentEvent) -> Result<(), SideEffectError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl PostCommitHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn handle(&self, _: &FulfillmentEvent) -> Result<(), SideEffectError> {
            Err(SideEffectError::Multiple("boom".into()))
        }
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_others() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let dispatcher = PostCommitDispatcher::new()
            .with_handler(Arc::new(Failing))
            .with_handler(counting.clone());

        let events = vec![
            FulfillmentEvent::RetailOrderFailed {
                payment_intent_id: "pi_1".into(),
                guardian_name: "A B".into(),
                guardian_email: "a@example.com".into(),
                total_cents: 100,
                currency: "usd".into(),
                reason: "db down".into(),
            },
            FulfillmentEvent::RetailOrderFailed {
                payment_intent_id: "pi_2".into(),
                guardian_name: "A B".into(),
                guardian_email: "a@example.com".into(),
                total_cents: 100,
                currency: "usd".into(),
                reason: "db down".into(),
            },
        ];
        let failures = dispatcher.dispatch(&events).await;

        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.handler == "failing"));
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }
}
