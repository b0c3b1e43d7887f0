#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{body::Body, http::Request, Router};
use camp_checkout_api::{
    checkout::{
        CartLine, CheckoutDraftStore, CheckoutForm, GuardianInfo, MinorInfo, PackageType,
        TrainingSelection,
    },
    config::AppConfig,
    db,
    entities::provider,
    idempotency::IdempotencyLedger,
    notifications::{NotificationDelivery, NotificationError, TemplateKey},
    payments::{CreatedIntent, GatewayError, PaymentEvidence, PaymentGateway, PaymentStatus},
    AppComponents, AppState,
};
use camp_checkout_api::notifications::JobWorker;
use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

/// Payment provider double. Intents start pending; tests move them along.
#[derive(Default)]
pub struct ScriptedGateway {
    intents: Mutex<HashMap<String, PaymentEvidence>>,
    counter: AtomicUsize,
    pub get_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    unavailable: AtomicBool,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, intent_id: &str, status: PaymentStatus) {
        let mut intents = self.intents.lock().unwrap();
        let evidence = intents.get_mut(intent_id).expect("unknown intent");
        evidence.status = status;
        evidence.failure_message = match status {
            PaymentStatus::Failed => Some("Your card was declined.".to_string()),
            _ => None,
        };
    }

    pub fn set_amount(&self, intent_id: &str, amount_cents: i64) {
        let mut intents = self.intents.lock().unwrap();
        intents.get_mut(intent_id).expect("unknown intent").amount_cents = amount_cents;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        metadata: HashMap<String, String>,
    ) -> Result<CreatedIntent, GatewayError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let intent_id = format!("pi_test_{n}");
        self.intents.lock().unwrap().insert(
            intent_id.clone(),
            PaymentEvidence {
                intent_id: intent_id.clone(),
                amount_cents,
                currency: currency.to_string(),
                status: PaymentStatus::Pending,
                metadata,
                failure_message: None,
            },
        );
        Ok(CreatedIntent {
            client_secret: format!("{intent_id}_secret_{n}"),
            intent_id,
        })
    }

    async fn get_intent(&self, intent_id: &str) -> Result<PaymentEvidence, GatewayError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatewayError::Transient("connection reset".to_string()));
        }
        self.intents
            .lock()
            .unwrap()
            .get(intent_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(intent_id.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct SentNotification {
    pub to: String,
    pub template: TemplateKey,
    pub payload: Value,
}

/// Records every delivery. Can be told to fail.
#[derive(Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<SentNotification>>,
    failing: AtomicBool,
}

impl RecordingDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count(&self, template: TemplateKey) -> usize {
        self.sent().iter().filter(|n| n.template == template).count()
    }
}

#[async_trait]
impl NotificationDelivery for RecordingDelivery {
    async fn send(
        &self,
        recipient_address: &str,
        template_key: TemplateKey,
        payload: &Value,
    ) -> Result<(), NotificationError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationError::Delivery("mail relay down".to_string()));
        }
        self.sent.lock().unwrap().push(SentNotification {
            to: recipient_address.to_string(),
            template: template_key,
            payload: payload.clone(),
        });
        Ok(())
    }
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "redis://127.0.0.1:6379".to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.claim_wait_millis = 2_000;
    cfg.claim_poll_millis = 10;
    cfg.gateway_timeout_secs = 2;
    cfg.admin_email = "admin@camps.example.com".to_string();
    cfg.checkout_success_url = "https://camps.example.com/checkout/success".to_string();
    cfg.checkout_retry_url = "https://camps.example.com/checkout".to_string();
    cfg
}

/// Fresh in-memory database with migrations applied.
pub async fn setup_db() -> Arc<DatabaseConnection> {
    let pool = db::establish_connection_from_app_config(&test_config())
        .await
        .expect("failed to open test database");
    db::run_migrations(&pool)
        .await
        .expect("failed to run migrations");
    Arc::new(pool)
}

pub async fn seed_provider(db: &DatabaseConnection, active: bool) -> Uuid {
    let id = Uuid::new_v4();
    provider::ActiveModel {
        id: Set(id),
        display_name: Set("Coach Morgan".to_string()),
        email: Set(format!("coach-{}@camps.example.com", &id.simple().to_string()[..8])),
        active: Set(active),
        created_at: Set(Utc::now()),
    }
    .insert(db)
    .await
    .expect("failed to seed provider");
    id
}

pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub state: AppState,
    pub gateway: Arc<ScriptedGateway>,
    pub delivery: Arc<RecordingDelivery>,
    pub worker: JobWorker,
    pub provider_id: Uuid,
    router: Router,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_db(setup_db().await, test_config()).await
    }

    pub async fn with_db(db: Arc<DatabaseConnection>, cfg: AppConfig) -> Self {
        let gateway = ScriptedGateway::new();
        let delivery = RecordingDelivery::new();
        let components = AppState::build(cfg, db.clone(), gateway.clone(), delivery.clone())
            .await
            .expect("failed to build app state");
        Self::from_components(db, gateway, delivery, components).await
    }

    /// App over caller-supplied draft store and ledger, so tests can share or wrap them.
    pub async fn with_backends(
        db: Arc<DatabaseConnection>,
        cfg: AppConfig,
        drafts: Arc<dyn CheckoutDraftStore>,
        ledger: Arc<dyn IdempotencyLedger>,
    ) -> Self {
        let gateway = ScriptedGateway::new();
        let delivery = RecordingDelivery::new();
        let components = AppState::assemble(
            cfg,
            db.clone(),
            gateway.clone(),
            delivery.clone(),
            drafts,
            ledger,
        )
        .await
        .expect("failed to build app state");
        Self::from_components(db, gateway, delivery, components).await
    }

    async fn from_components(
        db: Arc<DatabaseConnection>,
        gateway: Arc<ScriptedGateway>,
        delivery: Arc<RecordingDelivery>,
        components: AppComponents,
    ) -> Self {
        let provider_id = seed_provider(&db, true).await;
        let router = camp_checkout_api::app_router(components.state.clone());
        Self {
            db,
            state: components.state,
            gateway,
            delivery,
            worker: components.job_worker,
            provider_id,
            router,
        }
    }

    pub async fn request(&self, request: Request<Body>) -> axum::response::Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router call failed")
    }
}

pub fn guardian() -> GuardianInfo {
    GuardianInfo {
        first_name: "Dana".to_string(),
        last_name: "Reyes".to_string(),
        email: "dana.reyes@example.com".to_string(),
        phone: Some("555-0100".to_string()),
    }
}

pub fn minor(first_name: &str) -> MinorInfo {
    MinorInfo {
        existing_id: None,
        first_name: first_name.to_string(),
        last_name: "Reyes".to_string(),
        date_of_birth: chrono::NaiveDate::from_ymd_opt(2014, 5, 17),
        shirt_size: Some("YM".to_string()),
        team: Some("Lightning".to_string()),
        position: Some("Midfield".to_string()),
    }
}

/// $120 of camp gear plus a $90 three-session package starting in three days.
pub fn cart_and_package_form(provider_id: Uuid) -> CheckoutForm {
    CheckoutForm {
        guardian: guardian(),
        emergency_contact: None,
        medical_notes: Some("Peanut allergy".to_string()),
        minors: vec![minor("Sam")],
        cart: vec![CartLine {
            sku: Some("CAMP-WEEK1".to_string()),
            name: "Summer camp week 1".to_string(),
            quantity: 1,
            unit_price_cents: 12_000,
        }],
        fees: vec![],
        training: Some(TrainingSelection {
            provider_id,
            package_type: PackageType::ThreePack,
            package_price_cents: 9_000,
            session_start: Some(Utc::now() + ChronoDuration::days(3)),
        }),
        currency: None,
    }
}

pub fn package_only_form(provider_id: Uuid, package_type: PackageType, price_cents: i64) -> CheckoutForm {
    CheckoutForm {
        cart: vec![],
        training: Some(TrainingSelection {
            provider_id,
            package_type,
            package_price_cents: price_cents,
            session_start: Some(Utc::now() + ChronoDuration::days(3)),
        }),
        ..cart_and_package_form(provider_id)
    }
}

pub fn cart_only_form(provider_id: Uuid) -> CheckoutForm {
    CheckoutForm {
        training: None,
        minors: vec![],
        ..cart_and_package_form(provider_id)
    }
}
