use super::draft::{
    hash_client_secret, new_session_token, CartLine, CheckoutDraft, EmergencyContact, FeeLine,
    GuardianInfo, MinorInfo, PriceBreakdown, TrainingSelection,
};
use super::store::CheckoutDraftStore;
use crate::{
    db::DbPool,
    entities::provider::Entity as ProviderEntity,
    errors::ServiceError,
    payments::PaymentGateway,
};
use chrono::Utc;
use metrics::counter;
use sea_orm::EntityTrait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

/// Checkout form as submitted by the buyer.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CheckoutForm {
    pub guardian: GuardianInfo,
    pub emergency_contact: Option<EmergencyContact>,
    #[validate(length(max = 4000))]
    pub medical_notes: Option<String>,
    #[serde(default)]
    pub minors: Vec<MinorInfo>,
    #[serde(default)]
    pub cart: Vec<CartLine>,
    #[serde(default)]
    pub fees: Vec<FeeLine>,
    pub training: Option<TrainingSelection>,
    #[validate(length(equal = 3, message = "Currency must be 3 characters"))]
    pub currency: Option<String>,
}

impl CheckoutForm {
    fn validate_all(&self) -> Result<(), ServiceError> {
        self.validate()?;
        self.guardian.validate()?;
        if let Some(contact) = &self.emergency_contact {
            contact.validate()?;
        }
        for minor in &self.minors {
            minor.validate()?;
        }
        for line in &self.cart {
            line.validate()?;
            if line.unit_price_cents < 0 {
                return Err(ServiceError::ValidationError(format!(
                    "cart line '{}' has a negative price",
                    line.name
                )));
            }
        }
        for fee in &self.fees {
            fee.validate()?;
        }
        if let Some(training) = &self.training {
            if training.package_price_cents < 0 {
                return Err(ServiceError::ValidationError(
                    "package price cannot be negative".to_string(),
                ));
            }
            if self.minors.is_empty() {
                return Err(ServiceError::ValidationError(
                    "a training package needs at least one participant".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn normalize(mut self) -> Self {
        self.guardian.first_name = self.guardian.first_name.trim().to_string();
        self.guardian.last_name = self.guardian.last_name.trim().to_string();
        self.guardian.email = self.guardian.email.trim().to_lowercase();
        self.guardian.phone = self
            .guardian
            .phone
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        for minor in &mut self.minors {
            minor.first_name = minor.first_name.trim().to_string();
            minor.last_name = minor.last_name.trim().to_string();
        }
        self.medical_notes = self
            .medical_notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self
    }
}

/// What the client needs to present the payment form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutStarted {
    pub session_token: String,
    pub payment_intent_id: String,
    pub client_secret: String,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    db_pool: Arc<DbPool>,
    drafts: Arc<dyn CheckoutDraftStore>,
    gateway: Arc<dyn PaymentGateway>,
    default_currency: String,
}

impl CheckoutService {
    pub fn new(
        db_pool: Arc<DbPool>,
        drafts: Arc<dyn CheckoutDraftStore>,
        gateway: Arc<dyn PaymentGateway>,
        default_currency: impl Into<String>,
    ) -> Self {
        Self {
            db_pool,
            drafts,
            gateway,
            default_currency: default_currency.into(),
        }
    }

    /// Validates and prices the form, opens a payment intent and stores the draft.
    #[instrument(skip(self, form), fields(email = %form.guardian.email))]
    pub async fn start(&self, form: CheckoutForm) -> Result<CheckoutStarted, ServiceError> {
        form.validate_all()?;
        let form = form.normalize();

        if let Some(training) = &form.training {
            let provider = ProviderEntity::find_by_id(training.provider_id)
                .one(&*self.db_pool)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("provider {} not found", training.provider_id))
                })?;
            if !provider.active {
                return Err(ServiceError::InvalidOperation(format!(
                    "provider {} is not accepting bookings",
                    provider.display_name
                )));
            }
        }

        let breakdown = PriceBreakdown::compute(&form.cart, &form.fees, form.training.as_ref());
        let has_package = form
            .training
            .as_ref()
            .map(|t| t.package_price_cents > 0)
            .unwrap_or(false);
        if form.cart.is_empty() && !has_package {
            return Err(ServiceError::ValidationError(
                "checkout needs cart items or a training package".to_string(),
            ));
        }
        if breakdown.order_total_cents < 0 {
            return Err(ServiceError::ValidationError(
                "discounts exceed the cart subtotal".to_string(),
            ));
        }
        if breakdown.grand_total_cents <= 0 {
            return Err(ServiceError::ValidationError(
                "checkout total must be greater than zero".to_string(),
            ));
        }

        let currency = form
            .currency
            .clone()
            .unwrap_or_else(|| self.default_currency.clone())
            .to_lowercase();
        let session_token = new_session_token();

        let mut metadata = HashMap::new();
        metadata.insert("session_token".to_string(), session_token.clone());
        metadata.insert("guardian_email".to_string(), form.guardian.email.clone());

        let intent = self
            .gateway
            .create_intent(breakdown.grand_total_cents, &currency, metadata)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to create payment intent");
                ServiceError::from(e)
            })?;

        let draft = CheckoutDraft {
            session_token: session_token.clone(),
            guardian: form.guardian,
            emergency_contact: form.emergency_contact,
            medical_notes: form.medical_notes,
            minors: form.minors,
            cart: form.cart,
            fees: form.fees,
            training: form.training,
            breakdown,
            currency: currency.clone(),
            payment_intent_id: Some(intent.intent_id.clone()),
            client_secret_hash: Some(hash_client_secret(&intent.client_secret)),
            created_at: Utc::now(),
        };
        self.drafts.save(&draft).await?;

        counter!("checkout_started_total", 1);
        info!(
            session_token = %session_token,
            payment_intent_id = %intent.intent_id,
            amount_cents = breakdown.grand_total_cents,
            "Checkout started"
        );

        Ok(CheckoutStarted {
            session_token,
            payment_intent_id: intent.intent_id,
            client_secret: intent.client_secret,
            amount_cents: breakdown.grand_total_cents,
            currency,
        })
    }
}
