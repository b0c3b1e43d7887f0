//! Confirmation routing.
//!
//! A paid checkout can be confirmed by the inline submit response, the redirect back
//! from the hosted payment page, or a client-side confirm call. All three land in
//! [`ConfirmationService::confirm`], which verifies the payment with the gateway,
//! wins the ledger claim and materializes at most once.

use super::materializer::{FulfillmentIds, Materializer};
use crate::{
    checkout::{draft::hash_client_secret, CheckoutDraft, CheckoutDraftStore},
    config::AppConfig,
    errors::ServiceError,
    events::PostCommitDispatcher,
    idempotency::{
        intent_key, session_alias_key, ClaimOutcome, ClaimToken, FulfillmentRecord,
        IdempotencyLedger,
    },
    payments::{PaymentEvidence, PaymentGateway, PaymentStatus},
};
use chrono::Utc;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConfirmationTrigger {
    Submit,
    Redirect,
    ClientConfirm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub trigger: ConfirmationTrigger,
    pub session_token: Option<String>,
    pub payment_intent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// This call materialized the payment.
    Done(FulfillmentIds),
    /// An earlier call already did.
    AlreadyDone(FulfillmentIds),
    /// The payment is not (yet) usable. The draft is kept so the buyer can retry.
    Rejected {
        status: PaymentStatus,
        reason: String,
        session_token: Option<String>,
    },
}

impl ConfirmationOutcome {
    pub fn ids(&self) -> Option<&FulfillmentIds> {
        match self {
            ConfirmationOutcome::Done(ids) | ConfirmationOutcome::AlreadyDone(ids) => Some(ids),
            ConfirmationOutcome::Rejected { .. } => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ConfirmationOutcome::Done(_) => "done",
            ConfirmationOutcome::AlreadyDone(_) => "already_done",
            ConfirmationOutcome::Rejected { .. } => "rejected",
        }
    }
}

impl From<FulfillmentRecord> for FulfillmentIds {
    fn from(record: FulfillmentRecord) -> Self {
        FulfillmentIds {
            order_id: record.order_id,
            booking_id: record.booking_id,
            booking_number: record.booking_number,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConfirmationSettings {
    pub claim_ttl: Duration,
    pub claim_wait: Duration,
    pub claim_poll: Duration,
    pub gateway_timeout: Duration,
}

impl From<&AppConfig> for ConfirmationSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            claim_ttl: cfg.claim_ttl(),
            claim_wait: Duration::from_millis(cfg.claim_wait_millis),
            claim_poll: Duration::from_millis(cfg.claim_poll_millis.max(1)),
            gateway_timeout: cfg.gateway_verification_budget(),
        }
    }
}

const MISMATCH_REASON: &str = "Payment does not match this checkout.";

fn rejection_reason(evidence: &PaymentEvidence) -> String {
    match evidence.status {
        PaymentStatus::Pending => "Your payment is still processing.".to_string(),
        PaymentStatus::RequiresAction => {
            "Your payment needs additional authentication.".to_string()
        }
        PaymentStatus::Failed => evidence
            .failure_message
            .clone()
            .unwrap_or_else(|| "Your payment was not completed.".to_string()),
        PaymentStatus::Succeeded => MISMATCH_REASON.to_string(),
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[derive(Clone)]
pub struct ConfirmationService {
    drafts: Arc<dyn CheckoutDraftStore>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<dyn IdempotencyLedger>,
    materializer: Arc<Materializer>,
    dispatcher: Arc<PostCommitDispatcher>,
    settings: ConfirmationSettings,
}

impl ConfirmationService {
    pub fn new(
        drafts: Arc<dyn CheckoutDraftStore>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<dyn IdempotencyLedger>,
        materializer: Arc<Materializer>,
        dispatcher: Arc<PostCommitDispatcher>,
        settings: ConfirmationSettings,
    ) -> Self {
        Self {
            drafts,
            gateway,
            ledger,
            materializer,
            dispatcher,
            settings,
        }
    }

    #[instrument(skip(self), fields(trigger = %request.trigger))]
    pub async fn confirm(
        &self,
        request: ConfirmationRequest,
    ) -> Result<ConfirmationOutcome, ServiceError> {
        let result = self.route(&request).await;
        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(e) if e.is_retryable() => "retryable_error",
            Err(_) => "error",
        };
        counter!(
            "checkout_confirmations_total",
            1,
            "trigger" => request.trigger.to_string(),
            "outcome" => outcome
        );
        result
    }

    async fn route(&self, request: &ConfirmationRequest) -> Result<ConfirmationOutcome, ServiceError> {
        let session_token = request
            .session_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let mut draft = match session_token {
            Some(token) => self.drafts.load(token).await?,
            None => None,
        };

        let intent_id = request
            .payment_intent_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| draft.as_ref().and_then(|d| d.payment_intent_id.clone()));

        let Some(intent_id) = intent_id else {
            return match session_token {
                Some(token) => self.recorded_outcome(token).await,
                None => Err(ServiceError::InvalidInput(
                    "a payment intent or checkout session is required".to_string(),
                )),
            };
        };

        let evidence = self.verify(&intent_id).await?;
        let session_token = session_token
            .map(str::to_string)
            .or_else(|| evidence.session_token().map(str::to_string));

        if evidence.status != PaymentStatus::Succeeded {
            info!(payment_intent_id = %intent_id, status = %evidence.status, "Payment not confirmable yet");
            return Ok(ConfirmationOutcome::Rejected {
                status: evidence.status,
                reason: rejection_reason(&evidence),
                session_token,
            });
        }

        let claim = match self.acquire(&intent_key(&intent_id)).await? {
            Ok(claim) => claim,
            Err(done) => return Ok(ConfirmationOutcome::AlreadyDone(done)),
        };

        if draft.is_none() {
            if let Some(token) = &session_token {
                draft = self.drafts.load(token).await?;
            }
        }
        let Some(draft) = draft else {
            return self.recover(claim, &intent_id, session_token).await;
        };

        if let Some(reason) = mismatch(&draft, &evidence) {
            self.release(&claim).await;
            error!(payment_intent_id = %intent_id, session_token = %draft.session_token, reason = %reason, "Payment evidence does not match draft");
            counter!("checkout_evidence_mismatch_total", 1);
            return Ok(ConfirmationOutcome::Rejected {
                status: evidence.status,
                reason: MISMATCH_REASON.to_string(),
                session_token: Some(draft.session_token),
            });
        }

        let materialized = match self.materializer.materialize(&draft, &evidence).await {
            Ok(m) => m,
            Err(e) => {
                self.release(&claim).await;
                error!(payment_intent_id = %intent_id, error = %e, "Fulfillment failed; claim released");
                counter!("fulfillment_failures_total", 1);
                return Err(ServiceError::MaterializationFailed(e.to_string()));
            }
        };

        let record = FulfillmentRecord {
            order_id: materialized.ids.order_id,
            booking_id: materialized.ids.booking_id,
            booking_number: materialized.ids.booking_number.clone(),
            session_token: Some(draft.session_token.clone()),
            client_secret_hash: draft.client_secret_hash.clone(),
            completed_at: Utc::now(),
        };
        if let Err(e) = self.ledger.complete(&claim, &record).await {
            // The records are committed; a later confirmation finds them by intent.
            error!(payment_intent_id = %intent_id, error = %e, "Failed to record completed fulfillment");
            self.release(&claim).await;
        }
        if let Err(e) = self.drafts.delete(&draft.session_token).await {
            warn!(session_token = %draft.session_token, error = %e, "Failed to delete checkout draft");
        }

        let failures = self.dispatcher.dispatch(&materialized.events).await;
        if !failures.is_empty() {
            warn!(
                payment_intent_id = %intent_id,
                failures = failures.len(),
                "Some post-commit side effects failed"
            );
        }

        info!(
            payment_intent_id = %intent_id,
            booking_number = ?materialized.ids.booking_number,
            order_id = ?materialized.ids.order_id,
            "Checkout fulfilled"
        );
        Ok(ConfirmationOutcome::Done(materialized.ids))
    }

    /// Handles a claimed, paid intent whose draft is gone. Records committed by an
    /// earlier run are recorded in the ledger and returned; otherwise the checkout is
    /// unknown.
    async fn recover(
        &self,
        claim: ClaimToken,
        intent_id: &str,
        session_token: Option<String>,
    ) -> Result<ConfirmationOutcome, ServiceError> {
        let ids = match self.materializer.recover(intent_id).await {
            Ok(ids) => ids,
            Err(e) => {
                self.release(&claim).await;
                return Err(e);
            }
        };
        let Some(ids) = ids else {
            self.release(&claim).await;
            warn!(payment_intent_id = %intent_id, "Paid intent has no checkout draft");
            return Err(ServiceError::NotFound("checkout data not found".to_string()));
        };

        info!(
            payment_intent_id = %intent_id,
            booking_number = ?ids.booking_number,
            order_id = ?ids.order_id,
            "Found records of an unrecorded fulfillment"
        );
        let record = FulfillmentRecord {
            order_id: ids.order_id,
            booking_id: ids.booking_id,
            booking_number: ids.booking_number.clone(),
            session_token,
            client_secret_hash: None,
            completed_at: Utc::now(),
        };
        if let Err(e) = self.ledger.complete(&claim, &record).await {
            error!(payment_intent_id = %intent_id, error = %e, "Failed to record recovered fulfillment");
            self.release(&claim).await;
        }
        Ok(ConfirmationOutcome::AlreadyDone(ids))
    }

    async fn verify(&self, intent_id: &str) -> Result<PaymentEvidence, ServiceError> {
        match tokio::time::timeout(self.settings.gateway_timeout, self.gateway.get_intent(intent_id)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                warn!(payment_intent_id = %intent_id, "Payment verification timed out");
                Err(ServiceError::TransientGateway(
                    "payment verification timed out".to_string(),
                ))
            }
        }
    }

    /// Wins the claim for `key`, or returns the recorded ids when the work is already
    /// done. Waits a bounded time for a concurrent holder before giving up.
    async fn acquire(&self, key: &str) -> Result<Result<ClaimToken, FulfillmentIds>, ServiceError> {
        let deadline = Instant::now() + self.settings.claim_wait;
        loop {
            match self.ledger.claim(key, self.settings.claim_ttl).await? {
                ClaimOutcome::Claimed(claim) => return Ok(Ok(claim)),
                ClaimOutcome::AlreadyDone(record) => return Ok(Err(record.into())),
                ClaimOutcome::InFlight => {
                    if Instant::now() >= deadline {
                        return Err(ServiceError::Conflict(
                            "confirmation already in progress".to_string(),
                        ));
                    }
                    debug!(key, "Claim held elsewhere; waiting");
                    tokio::time::sleep(self.settings.claim_poll).await;
                }
            }
        }
    }

    async fn release(&self, claim: &ClaimToken) {
        if let Err(e) = self.ledger.release(claim).await {
            warn!(key = %claim.key, error = %e, "Failed to release fulfillment claim");
        }
    }

    async fn recorded_outcome(&self, session_token: &str) -> Result<ConfirmationOutcome, ServiceError> {
        match self.ledger.lookup(&session_alias_key(session_token)).await? {
            Some(record) => Ok(ConfirmationOutcome::AlreadyDone(record.into())),
            None => Err(ServiceError::NotFound("checkout data not found".to_string())),
        }
    }

    /// Checks a client-side confirm's bearer secret against the hash kept with the
    /// draft, or with the completed record once the draft is gone.
    pub async fn authorize_client(
        &self,
        session_token: &str,
        payment_intent_id: &str,
        client_secret: &str,
    ) -> Result<(), ServiceError> {
        let presented = hash_client_secret(client_secret);

        let stored = match self.drafts.load(session_token).await? {
            Some(draft) if draft.payment_intent_id.as_deref() == Some(payment_intent_id) => {
                draft.client_secret_hash
            }
            Some(_) => None,
            None => self
                .ledger
                .lookup(&intent_key(payment_intent_id))
                .await?
                .filter(|r| r.session_token.as_deref() == Some(session_token))
                .and_then(|r| r.client_secret_hash),
        };

        match stored {
            Some(expected) if constant_time_eq(&expected, &presented) => Ok(()),
            _ => Err(ServiceError::Unauthorized(
                "invalid client credentials for this checkout".to_string(),
            )),
        }
    }
}

/// Describes how the payment differs from what the checkout expected, if it does.
fn mismatch(draft: &CheckoutDraft, evidence: &PaymentEvidence) -> Option<String> {
    if evidence.amount_cents != draft.breakdown.grand_total_cents {
        return Some(format!(
            "amount {} != expected {}",
            evidence.amount_cents, draft.breakdown.grand_total_cents
        ));
    }
    if !evidence.currency.eq_ignore_ascii_case(&draft.currency) {
        return Some(format!(
            "currency {} != expected {}",
            evidence.currency, draft.currency
        ));
    }
    if evidence.session_token() != Some(draft.session_token.as_str()) {
        return Some("session token in payment metadata does not match".to_string());
    }
    if let Some(expected) = &draft.payment_intent_id {
        if *expected != evidence.intent_id {
            return Some(format!(
                "intent {} != expected {}",
                evidence.intent_id, expected
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[test]
    fn rejection_reasons_prefer_gateway_message() {
        let mut evidence = PaymentEvidence {
            intent_id: "pi_1".into(),
            amount_cents: 100,
            currency: "usd".into(),
            status: PaymentStatus::Failed,
            metadata: Default::default(),
            failure_message: Some("Your card has insufficient funds.".into()),
        };
        assert_eq!(rejection_reason(&evidence), "Your card has insufficient funds.");
        evidence.status = PaymentStatus::RequiresAction;
        assert!(rejection_reason(&evidence).contains("authentication"));
    }
}
