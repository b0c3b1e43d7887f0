use super::{NotificationError, TemplateKey};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

#[async_trait::async_trait]
pub trait NotificationDelivery: Send + Sync {
    async fn send(
        &self,
        recipient_address: &str,
        template_key: TemplateKey,
        payload: &serde_json::Value,
    ) -> Result<(), NotificationError>;
}

/// HMAC-SHA256 over `"{timestamp}.{body}"`, hex encoded.
pub struct SignatureGenerator {
    secret: String,
}

impl SignatureGenerator {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    pub fn sign_payload(&self, timestamp: &str, body: &str) -> Result<String, NotificationError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| NotificationError::Delivery(format!("invalid signing key: {e}")))?;
        mac.update(format!("{timestamp}.{body}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[derive(Serialize)]
struct DeliveryBody<'a> {
    to: &'a str,
    template: TemplateKey,
    data: &'a serde_json::Value,
}

/// Posts notifications to the delivery collaborator's HTTP endpoint.
#[derive(Clone)]
pub struct HttpNotificationDelivery {
    client: reqwest::Client,
    endpoint: String,
    signature_generator: Option<Arc<SignatureGenerator>>,
    max_retries: u32,
    base_backoff: Duration,
}

impl HttpNotificationDelivery {
    pub fn new(
        endpoint: impl Into<String>,
        signing_secret: Option<String>,
        max_retries: u32,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotificationError::Delivery(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            signature_generator: signing_secret.map(|s| Arc::new(SignatureGenerator::new(s))),
            max_retries: max_retries.max(1),
            base_backoff: Duration::from_secs(1),
        })
    }

    pub fn with_base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }
}

#[async_trait::async_trait]
impl NotificationDelivery for HttpNotificationDelivery {
    #[instrument(skip(self, payload))]
    async fn send(
        &self,
        recipient_address: &str,
        template_key: TemplateKey,
        payload: &serde_json::Value,
    ) -> Result<(), NotificationError> {
        let body = serde_json::to_string(&DeliveryBody {
            to: recipient_address,
            template: template_key,
            data: payload,
        })?;
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = match &self.signature_generator {
            Some(generator) => Some(generator.sign_payload(&timestamp, &body)?),
            None => None,
        };

        for attempt in 1..=self.max_retries {
            let mut request = self
                .client
                .post(&self.endpoint)
                .header("Content-Type", "application/json")
                .header(TIMESTAMP_HEADER, &timestamp)
                .body(body.clone());
            if let Some(sig) = &signature {
                request = request.header(SIGNATURE_HEADER, sig);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!(template = %template_key, "Notification delivered");
                    return Ok(());
                }
                Ok(response) if response.status().is_client_error() && response.status().as_u16() != 429 => {
                    return Err(NotificationError::Delivery(format!(
                        "delivery endpoint rejected notification: {}",
                        response.status()
                    )));
                }
                Ok(response) => warn!(
                    "Notification delivery failed with status: {} (attempt {}/{})",
                    response.status(),
                    attempt,
                    self.max_retries
                ),
                Err(e) => warn!(
                    "Notification delivery error: {} (attempt {}/{})",
                    e, attempt, self.max_retries
                ),
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.base_backoff * 2_u32.pow(attempt - 1)).await;
            }
        }

        error!("Notification delivery failed after {} attempts", self.max_retries);
        Err(NotificationError::Delivery(format!(
            "failed to deliver notification after {} attempts",
            self.max_retries
        )))
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Default)]
pub struct LogNotificationDelivery;

#[async_trait::async_trait]
impl NotificationDelivery for LogNotificationDelivery {
    async fn send(
        &self,
        recipient_address: &str,
        template_key: TemplateKey,
        payload: &serde_json::Value,
    ) -> Result<(), NotificationError> {
        info!(
            to = %recipient_address,
            template = %template_key,
            payload = %payload,
            "Notification (log delivery)"
        );
        Ok(())
    }
}
