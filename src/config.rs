use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_DRAFT_TTL_SECS: u64 = 2 * 60 * 60;
const DEFAULT_CLAIM_TTL_SECS: u64 = 120;
const DEFAULT_PLATFORM_FEE_BPS: u32 = 1_000;
const DEFAULT_CREDIT_EXPIRY_DAYS: u32 = 365;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Redis connection URL (draft store / ledger when configured)
    pub redis_url: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default)]
    pub cors_allow_any_origin: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Upper bound for a whole HTTP request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // ========== Checkout drafts ==========
    /// "in-memory" or "redis"
    #[serde(default = "default_draft_store_backend")]
    #[validate(custom = "validate_draft_store_backend")]
    pub draft_store_backend: String,

    #[serde(default = "default_draft_ttl_secs")]
    #[validate(range(min = 1))]
    pub draft_ttl_secs: u64,

    // ========== Idempotency ledger ==========
    /// "database", "redis" or "in-memory"
    #[serde(default = "default_idempotency_backend")]
    #[validate(custom = "validate_idempotency_backend")]
    pub idempotency_backend: String,

    /// Lifetime of an in-flight claim before another process may take it over
    #[serde(default = "default_claim_ttl_secs")]
    #[validate(range(min = 1))]
    pub claim_ttl_secs: u64,

    /// How long a confirmation waits for a concurrent holder before answering "in progress"
    #[serde(default = "default_claim_wait_millis")]
    pub claim_wait_millis: u64,

    #[serde(default = "default_claim_poll_millis")]
    #[validate(range(min = 1))]
    pub claim_poll_millis: u64,

    // ========== Payment gateway ==========
    #[serde(default = "default_gateway_base_url")]
    #[validate(custom = "validate_http_url")]
    pub gateway_base_url: String,

    #[serde(default)]
    pub gateway_secret_key: Option<String>,

    #[serde(default = "default_gateway_timeout_secs")]
    #[validate(range(min = 1))]
    pub gateway_timeout_secs: u64,

    #[serde(default = "default_gateway_max_retries")]
    pub gateway_max_retries: u32,

    #[serde(default = "default_gateway_backoff_millis")]
    pub gateway_backoff_millis: u64,

    /// Number of failures before circuit breaker opens
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failure_threshold: u32,

    /// Circuit breaker reset timeout in seconds
    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_timeout_secs: u64,

    // ========== Fulfillment ==========
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    /// Platform commission in basis points, frozen into each booking at creation
    #[serde(default = "default_platform_fee_bps")]
    #[validate(range(max = 10000))]
    pub platform_fee_bps: u32,

    #[serde(default = "default_credit_expiry_days")]
    #[validate(range(min = 1))]
    pub credit_expiry_days: u32,

    #[serde(default = "default_reminder_lead_hours")]
    pub reminder_lead_hours: u32,

    // ========== Notifications ==========
    #[serde(default = "default_admin_email")]
    #[validate(email)]
    pub admin_email: String,

    /// Delivery collaborator endpoint; log-only delivery when unset
    #[serde(default)]
    pub notification_delivery_url: Option<String>,

    /// HMAC secret used to sign delivery requests
    #[serde(default)]
    pub notification_signing_secret: Option<String>,

    #[serde(default = "default_notification_max_retries")]
    #[validate(range(min = 1))]
    pub notification_max_retries: u32,

    #[serde(default = "default_true_bool")]
    pub job_worker_enabled: bool,

    #[serde(default = "default_job_poll_interval_millis")]
    #[validate(range(min = 10))]
    pub job_poll_interval_millis: u64,

    #[serde(default = "default_job_batch_size")]
    #[validate(range(min = 1))]
    pub job_batch_size: u64,

    // ========== Redirects ==========
    /// Where the hosted payment page return lands on success
    #[serde(default = "default_checkout_success_url")]
    #[validate(custom = "validate_http_url")]
    pub checkout_success_url: String,

    /// Checkout form the buyer is sent back to on rejection
    #[serde(default = "default_checkout_retry_url")]
    #[validate(custom = "validate_http_url")]
    pub checkout_retry_url: String,
}

impl AppConfig {
    /// Creates a configuration with defaults for every tunable.
    pub fn new(
        database_url: String,
        redis_url: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            redis_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            draft_store_backend: default_draft_store_backend(),
            draft_ttl_secs: default_draft_ttl_secs(),
            idempotency_backend: default_idempotency_backend(),
            claim_ttl_secs: default_claim_ttl_secs(),
            claim_wait_millis: default_claim_wait_millis(),
            claim_poll_millis: default_claim_poll_millis(),
            gateway_base_url: default_gateway_base_url(),
            gateway_secret_key: None,
            gateway_timeout_secs: default_gateway_timeout_secs(),
            gateway_max_retries: default_gateway_max_retries(),
            gateway_backoff_millis: default_gateway_backoff_millis(),
            circuit_breaker_failure_threshold: default_circuit_breaker_failures(),
            circuit_breaker_timeout_secs: default_circuit_breaker_timeout(),
            default_currency: default_currency(),
            platform_fee_bps: default_platform_fee_bps(),
            credit_expiry_days: default_credit_expiry_days(),
            reminder_lead_hours: default_reminder_lead_hours(),
            admin_email: default_admin_email(),
            notification_delivery_url: None,
            notification_signing_secret: None,
            notification_max_retries: default_notification_max_retries(),
            job_worker_enabled: default_true_bool(),
            job_poll_interval_millis: default_job_poll_interval_millis(),
            job_batch_size: default_job_batch_size(),
            checkout_success_url: default_checkout_success_url(),
            checkout_retry_url: default_checkout_retry_url(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    pub fn draft_ttl(&self) -> Duration {
        Duration::from_secs(self.draft_ttl_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    /// Bound on one payment verification including the client's retries: every
    /// attempt may hit the per-attempt timeout, and each retry sleeps its doubling
    /// backoff plus up to a quarter of jitter.
    pub fn gateway_verification_budget(&self) -> Duration {
        let attempts = self.gateway_max_retries.max(1);
        let backoff_millis: u64 = (1..attempts)
            .map(|attempt| {
                self.gateway_backoff_millis
                    .saturating_mul(2_u64.saturating_pow(attempt - 1))
            })
            .sum();
        self.gateway_timeout() * attempts + Duration::from_millis(backoff_millis + backoff_millis / 4)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        let missing_key = self
            .gateway_secret_key
            .as_ref()
            .map(|k| k.trim().is_empty())
            .unwrap_or(true);
        if self.is_production() && missing_key {
            let mut err = ValidationError::new("gateway_secret_key_required");
            err.message = Some("Set APP__GATEWAY_SECRET_KEY in production".into());
            errors.add("gateway_secret_key", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_true_bool() -> bool {
    true
}

fn default_draft_store_backend() -> String {
    "in-memory".to_string()
}
fn default_draft_ttl_secs() -> u64 {
    DEFAULT_DRAFT_TTL_SECS
}
fn default_idempotency_backend() -> String {
    "database".to_string()
}
fn default_claim_ttl_secs() -> u64 {
    DEFAULT_CLAIM_TTL_SECS
}
fn default_claim_wait_millis() -> u64 {
    3_000
}
fn default_claim_poll_millis() -> u64 {
    100
}

fn default_gateway_base_url() -> String {
    "https://api.stripe.com/v1".to_string()
}
fn default_gateway_timeout_secs() -> u64 {
    10
}
fn default_gateway_max_retries() -> u32 {
    3
}
fn default_gateway_backoff_millis() -> u64 {
    250
}
fn default_circuit_breaker_failures() -> u32 {
    5
}
fn default_circuit_breaker_timeout() -> u64 {
    60
}

fn default_currency() -> String {
    "usd".to_string()
}
fn default_platform_fee_bps() -> u32 {
    DEFAULT_PLATFORM_FEE_BPS
}
fn default_credit_expiry_days() -> u32 {
    DEFAULT_CREDIT_EXPIRY_DAYS
}
fn default_reminder_lead_hours() -> u32 {
    24
}

fn default_admin_email() -> String {
    "bookings@example.com".to_string()
}
fn default_notification_max_retries() -> u32 {
    3
}
fn default_job_poll_interval_millis() -> u64 {
    1_000
}
fn default_job_batch_size() -> u64 {
    25
}

fn default_checkout_success_url() -> String {
    "http://localhost:3000/checkout/success".to_string()
}
fn default_checkout_retry_url() -> String {
    "http://localhost:3000/checkout".to_string()
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_draft_store_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "in-memory" | "redis" => Ok(()),
        _ => {
            let mut err = ValidationError::new("draft_store_backend");
            err.message = Some("Must be one of: in-memory, redis".into());
            Err(err)
        }
    }
}

fn validate_idempotency_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "database" | "redis" | "in-memory" => Ok(()),
        _ => {
            let mut err = ValidationError::new("idempotency_backend");
            err.message = Some("Must be one of: database, redis, in-memory".into());
            Err(err)
        }
    }
}

fn validate_http_url(value: &str) -> Result<(), ValidationError> {
    match url::Url::parse(value) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => {
            let mut err = ValidationError::new("url");
            err.message = Some("Must be an absolute http(s) URL".into());
            Err(err)
        }
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("camp_checkout_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(CONFIG_DIR)
}

pub(crate) fn load_config_from(config_dir: &str) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(config_dir).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://camp_checkout.db?mode=rwc")?
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", config_dir, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "redis://127.0.0.1:6379".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        )
    }

    #[test]
    fn defaults_pass_field_validation() {
        let cfg = base_config();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.platform_fee_bps, 1_000);
        assert_eq!(cfg.draft_ttl(), Duration::from_secs(7_200));
    }

    #[test]
    fn fee_above_one_hundred_percent_is_rejected() {
        let mut cfg = base_config();
        cfg.platform_fee_bps = 10_001;
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("platform_fee_bps"));
    }

    #[test]
    fn verification_budget_covers_every_retry() {
        let mut cfg = base_config();
        cfg.gateway_timeout_secs = 2;
        cfg.gateway_max_retries = 3;
        cfg.gateway_backoff_millis = 100;
        // 3 attempts of 2s, backoffs of 100ms and 200ms, plus a quarter for jitter
        assert_eq!(cfg.gateway_verification_budget(), Duration::from_millis(6_375));
        assert!(cfg.gateway_verification_budget() > cfg.gateway_timeout());

        cfg.gateway_max_retries = 1;
        assert_eq!(cfg.gateway_verification_budget(), cfg.gateway_timeout());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let mut cfg = base_config();
        cfg.idempotency_backend = "memcached".into();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("idempotency_backend"));
    }

    #[test]
    fn production_requires_gateway_key_and_cors() {
        let cfg = base_config();
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.field_errors().contains_key("gateway_secret_key"));
        assert!(errors.field_errors().contains_key("cors_allowed_origins"));

        let mut cfg = base_config();
        cfg.gateway_secret_key = Some("sk_live_123".into());
        cfg.cors_allowed_origins = Some("https://camps.example.com".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn development_allows_permissive_cors() {
        let mut cfg = base_config();
        cfg.environment = "development".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn file_values_are_layered_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("default.toml")).unwrap();
        writeln!(
            file,
            "platform_fee_bps = 1500\ndraft_store_backend = \"redis\"\nadmin_email = \"ops@camps.example.com\""
        )
        .unwrap();

        let cfg = load_config_from(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.platform_fee_bps, 1_500);
        assert_eq!(cfg.draft_store_backend, "redis");
        assert_eq!(cfg.admin_email, "ops@camps.example.com");
        assert_eq!(cfg.claim_ttl_secs, DEFAULT_CLAIM_TTL_SECS);
    }
}
