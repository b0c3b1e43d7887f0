//! Camp Checkout API
//!
//! Checkout-to-fulfillment pipeline for camp and private-training bookings: payment
//! confirmation, exactly-once materialization of orders and bookings, escrow holds,
//! package credits and notifications.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod checkout;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod escrow;
pub mod events;
pub mod fulfillment;
pub mod handlers;
pub mod idempotency;
pub mod middleware_helpers;
pub mod migrator;
pub mod notifications;
pub mod payments;
pub mod telemetry;

use axum::{routing::get, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::{
    checkout::{CheckoutDraftStore, CheckoutService, InMemoryDraftStore, RedisDraftStore},
    config::AppConfig,
    errors::ServiceError,
    escrow::{EscrowService, PackageCreditService},
    events::{
        EscrowHandler, NotificationHandler, PackageCreditHandler, PostCommitDispatcher,
        ReminderHandler,
    },
    fulfillment::{
        BookingWriter, ConfirmationService, ConfirmationSettings, DbRetailOrders, Materializer,
    },
    idempotency::{DatabaseLedger, IdempotencyLedger, InMemoryLedger, RedisLedger},
    notifications::{DbJobScheduler, JobScheduler, JobWorker, NotificationDelivery, NotificationDispatcher},
    payments::PaymentGateway,
};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub checkout: Arc<CheckoutService>,
    pub confirmations: Arc<ConfirmationService>,
}

/// Everything `AppState::build` wires together that the binary needs besides the router.
pub struct AppComponents {
    pub state: AppState,
    pub job_worker: JobWorker,
}

impl AppState {
    /// Wires the services from configuration. The booking table is probed once here.
    pub async fn build(
        config: AppConfig,
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        delivery: Arc<dyn NotificationDelivery>,
    ) -> Result<AppComponents, ServiceError> {
        let drafts: Arc<dyn CheckoutDraftStore> =
            match config.draft_store_backend.to_ascii_lowercase().as_str() {
                "redis" => Arc::new(RedisDraftStore::new(&config.redis_url, config.draft_ttl())?),
                _ => Arc::new(InMemoryDraftStore::new(config.draft_ttl())),
            };
        let ledger: Arc<dyn IdempotencyLedger> =
            match config.idempotency_backend.to_ascii_lowercase().as_str() {
                "redis" => Arc::new(RedisLedger::new(&config.redis_url)?),
                "in-memory" => Arc::new(InMemoryLedger::new()),
                _ => Arc::new(DatabaseLedger::new(db.clone())),
            };
        info!(
            draft_store = %config.draft_store_backend,
            ledger = %config.idempotency_backend,
            "Selected checkout backends"
        );
        Self::assemble(config, db, gateway, delivery, drafts, ledger).await
    }

    /// Wires the services around an already chosen draft store and ledger.
    pub async fn assemble(
        config: AppConfig,
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        delivery: Arc<dyn NotificationDelivery>,
        drafts: Arc<dyn CheckoutDraftStore>,
        ledger: Arc<dyn IdempotencyLedger>,
    ) -> Result<AppComponents, ServiceError> {
        let bookings = Arc::new(BookingWriter::probe(db.as_ref()).await?);
        info!(layouts = ?bookings.layouts(), "Booking table layouts detected");

        let notifications = Arc::new(NotificationDispatcher::new(db.clone(), delivery));
        let scheduler: Arc<dyn JobScheduler> = Arc::new(DbJobScheduler::new(db.clone()));
        let escrow = Arc::new(EscrowService::new(db.clone()));
        let credits = Arc::new(PackageCreditService::new(
            db.clone(),
            config.credit_expiry_days,
        ));

        let dispatcher = PostCommitDispatcher::new()
            .with_handler(Arc::new(EscrowHandler::new(
                db.clone(),
                escrow,
                bookings.clone(),
            )))
            .with_handler(Arc::new(PackageCreditHandler::new(
                db.clone(),
                credits,
                bookings.clone(),
            )))
            .with_handler(Arc::new(NotificationHandler::new(
                db.clone(),
                notifications.clone(),
                config.admin_email.clone(),
            )))
            .with_handler(Arc::new(ReminderHandler::new(
                scheduler,
                config.reminder_lead_hours,
            )));

        let materializer = Arc::new(Materializer::new(
            db.clone(),
            Arc::new(DbRetailOrders::new(db.clone())),
            bookings,
            config.platform_fee_bps,
        ));

        let checkout = Arc::new(CheckoutService::new(
            db.clone(),
            drafts.clone(),
            gateway.clone(),
            config.default_currency.clone(),
        ));
        let confirmations = Arc::new(ConfirmationService::new(
            drafts,
            gateway,
            ledger,
            materializer,
            Arc::new(dispatcher),
            ConfirmationSettings::from(&config),
        ));

        let job_worker = JobWorker::new(
            db.clone(),
            notifications,
            config.job_batch_size,
            Duration::from_millis(config.job_poll_interval_millis),
        );

        Ok(AppComponents {
            state: AppState {
                db,
                config: Arc::new(config),
                checkout,
                confirmations,
            },
            job_worker,
        })
    }
}

// Common response wrappers
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: telemetry::current_request_id().map(|rid| rid.as_str().to_string()),
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
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

pub fn api_v1_routes() -> Router<AppState> {
    Router::new().nest("/checkout", handlers::checkout_routes())
}

/// Full application router with request ids, HTTP tracing and the request timeout.
/// CORS is left to the caller since it depends on deployment.
pub fn app_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.request_timeout_secs);
    Router::new()
        .route("/health", get(handlers::health_check))
        .nest("/api/v1", api_v1_routes())
        .with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(telemetry::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            middleware_helpers::request_id_middleware,
        ))
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response = telemetry::scope_request_id(telemetry::RequestId::new("meta-123"), async {
            ApiResponse::success("ok")
        })
        .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[test]
    fn error_response_carries_message() {
        let response = ApiResponse::<()>::error("oops".into());
        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("oops"));
        assert!(response.meta.expect("metadata expected").request_id.is_none());
    }
}
