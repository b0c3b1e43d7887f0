//! Form-encoded REST client for a Stripe-compatible payment intents API.

use super::gateway::{CreatedIntent, GatewayError, PaymentEvidence, PaymentGateway, PaymentStatus};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerError};
use crate::config::AppConfig;
use metrics::counter;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
pub struct HttpPaymentGatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_timeout: Duration,
}

impl From<&AppConfig> for HttpPaymentGatewayConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            base_url: cfg.gateway_base_url.trim_end_matches('/').to_string(),
            secret_key: cfg.gateway_secret_key.clone().unwrap_or_default(),
            timeout: cfg.gateway_timeout(),
            max_retries: cfg.gateway_max_retries.max(1),
            backoff: Duration::from_millis(cfg.gateway_backoff_millis),
            breaker_failure_threshold: cfg.circuit_breaker_failure_threshold,
            breaker_timeout: Duration::from_secs(cfg.circuit_breaker_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IntentBody {
    id: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    currency: String,
    status: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    last_payment_error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

impl ErrorDetail {
    fn describe(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.code.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// Maps provider intent states onto [`PaymentStatus`]. `requires_payment_method` is
/// only a failure once an attempt has actually been made and rejected.
fn map_status(raw: &str, has_payment_error: bool) -> Result<PaymentStatus, GatewayError> {
    match raw {
        "succeeded" => Ok(PaymentStatus::Succeeded),
        "requires_action" => Ok(PaymentStatus::RequiresAction),
        "processing" | "requires_confirmation" | "requires_capture" => Ok(PaymentStatus::Pending),
        "canceled" => Ok(PaymentStatus::Failed),
        "requires_payment_method" if has_payment_error => Ok(PaymentStatus::Failed),
        "requires_payment_method" => Ok(PaymentStatus::Pending),
        other => Err(GatewayError::InvalidResponse(format!(
            "unknown intent status '{other}'"
        ))),
    }
}

impl TryFrom<IntentBody> for PaymentEvidence {
    type Error = GatewayError;

    fn try_from(body: IntentBody) -> Result<Self, Self::Error> {
        let status = map_status(&body.status, body.last_payment_error.is_some())?;
        Ok(PaymentEvidence {
            intent_id: body.id,
            amount_cents: body.amount,
            currency: body.currency.to_lowercase(),
            status,
            metadata: body.metadata,
            failure_message: body.last_payment_error.map(|e| e.describe()),
        })
    }
}

#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    config: HttpPaymentGatewayConfig,
    breaker: CircuitBreaker,
}

impl HttpPaymentGateway {
    pub fn new(config: HttpPaymentGatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Transient(format!("failed to build http client: {e}")))?;
        let breaker = CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_timeout,
            1,
        );
        Ok(Self {
            client,
            config,
            breaker,
        })
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.config.backoff.as_millis() as u64 * 2_u64.pow(attempt.saturating_sub(1));
        let jitter = if base > 1 {
            rand::thread_rng().gen_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    async fn classify_failure(response: reqwest::Response, intent_hint: &str) -> GatewayError {
        let status = response.status();
        let detail = response
            .json::<ErrorEnvelope>()
            .await
            .map(|e| e.error.describe())
            .unwrap_or_else(|_| status.to_string());

        if status.is_server_error() || status.as_u16() == 429 {
            GatewayError::Transient(format!("{status}: {detail}"))
        } else if status.as_u16() == 404 {
            GatewayError::NotFound(intent_hint.to_string())
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            GatewayError::InvalidResponse(format!("gateway rejected credentials: {detail}"))
        } else {
            GatewayError::Declined(detail)
        }
    }

    /// Sends a request built by `build`, retrying transient failures with exponential
    /// backoff. The whole retry sequence counts as one call for the breaker.
    async fn send_with_retry<F>(
        &self,
        operation: &'static str,
        intent_hint: &str,
        build: F,
    ) -> Result<IntentBody, GatewayError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let attempts = async {
            let mut last_error = GatewayError::Transient("no attempt made".to_string());
            for attempt in 1..=self.config.max_retries {
                let outcome = match build().bearer_auth(&self.config.secret_key).send().await {
                    Ok(response) if response.status().is_success() => response
                        .json::<IntentBody>()
                        .await
                        .map_err(|e| GatewayError::InvalidResponse(e.to_string())),
                    Ok(response) => Err(Self::classify_failure(response, intent_hint).await),
                    Err(e) => Err(GatewayError::Transient(e.to_string())),
                };

                match outcome {
                    Ok(body) => return Ok(body),
                    Err(GatewayError::Transient(msg)) => {
                        warn!(
                            operation,
                            attempt,
                            max_retries = self.config.max_retries,
                            "payment gateway call failed: {}",
                            msg
                        );
                        last_error = GatewayError::Transient(msg);
                        if attempt < self.config.max_retries {
                            counter!("payment_gateway_retries_total", 1, "operation" => operation);
                            tokio::time::sleep(self.backoff_for(attempt)).await;
                        }
                    }
                    Err(other) => return Err(other),
                }
            }
            Err(last_error)
        };

        let result = self
            .breaker
            .call(|| attempts, GatewayError::is_transient)
            .await;

        match result {
            Ok(body) => {
                counter!("payment_gateway_requests_total", 1, "operation" => operation, "outcome" => "ok");
                Ok(body)
            }
            Err(err) => {
                let err = match err {
                    CircuitBreakerError::CircuitOpen => GatewayError::CircuitOpen,
                    CircuitBreakerError::Inner(e) => e,
                };
                counter!("payment_gateway_requests_total", 1, "operation" => operation, "outcome" => "error");
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self, metadata))]
    async fn create_intent(
        &self,
        amount_cents: i64,
        currency: &str,
        metadata: HashMap<String, String>,
    ) -> Result<CreatedIntent, GatewayError> {
        let url = format!("{}/payment_intents", self.config.base_url);
        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), amount_cents.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        form.extend(
            metadata
                .into_iter()
                .map(|(k, v)| (format!("metadata[{k}]"), v)),
        );

        let body = self
            .send_with_retry("create_intent", "", || self.client.post(&url).form(&form))
            .await?;
        let client_secret = body.client_secret.ok_or_else(|| {
            GatewayError::InvalidResponse("created intent has no client_secret".to_string())
        })?;
        debug!(intent_id = %body.id, "payment intent created");
        Ok(CreatedIntent {
            intent_id: body.id,
            client_secret,
        })
    }

    #[instrument(skip(self))]
    async fn get_intent(&self, intent_id: &str) -> Result<PaymentEvidence, GatewayError> {
        let url = format!("{}/payment_intents/{}", self.config.base_url, intent_id);
        let body = self
            .send_with_retry("get_intent", intent_id, || self.client.get(&url))
            .await?;
        PaymentEvidence::try_from(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("succeeded", false, PaymentStatus::Succeeded)]
    #[case("processing", false, PaymentStatus::Pending)]
    #[case("requires_confirmation", false, PaymentStatus::Pending)]
    #[case("requires_action", false, PaymentStatus::RequiresAction)]
    #[case("canceled", false, PaymentStatus::Failed)]
    #[case("requires_payment_method", false, PaymentStatus::Pending)]
    #[case("requires_payment_method", true, PaymentStatus::Failed)]
    fn status_mapping(#[case] raw: &str, #[case] has_error: bool, #[case] expected: PaymentStatus) {
        assert_eq!(map_status(raw, has_error).unwrap(), expected);
    }

    #[test]
    fn unknown_status_is_invalid_response() {
        assert!(matches!(
            map_status("teleported", false),
            Err(GatewayError::InvalidResponse(_))
        ));
    }

    #[test]
    fn evidence_from_body_lowercases_currency() {
        let body: IntentBody = serde_json::from_value(serde_json::json!({
            "id": "pi_1",
            "amount": 9000,
            "currency": "USD",
            "status": "requires_payment_method",
            "metadata": {"session_token": "cs_1"},
            "last_payment_error": {"message": "Your card was declined."}
        }))
        .unwrap();
        let evidence = PaymentEvidence::try_from(body).unwrap();
        assert_eq!(evidence.currency, "usd");
        assert_eq!(evidence.status, PaymentStatus::Failed);
        assert_eq!(evidence.session_token(), Some("cs_1"));
        assert_eq!(
            evidence.failure_message.as_deref(),
            Some("Your card was declined.")
        );
    }
}
