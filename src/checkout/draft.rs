use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;
use validator::Validate;

/// Training package sizes sold by providers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PackageType {
    Single,
    ThreePack,
    FivePack,
    TenPack,
}

impl PackageType {
    pub fn sessions(self) -> i32 {
        match self {
            PackageType::Single => 1,
            PackageType::ThreePack => 3,
            PackageType::FivePack => 5,
            PackageType::TenPack => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct GuardianInfo {
    #[validate(length(min = 1, max = 100, message = "First name is required"))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100, message = "Last name is required"))]
    pub last_name: String,
    #[validate(email(message = "A valid email address is required"))]
    pub email: String,
    #[validate(length(max = 32))]
    pub phone: Option<String>,
}

impl GuardianInfo {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct EmergencyContact {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(min = 1, max = 32))]
    pub phone: String,
    pub relationship: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct MinorInfo {
    /// Set when the buyer picked a previously registered minor.
    #[serde(default)]
    pub existing_id: Option<Uuid>,
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub shirt_size: Option<String>,
    pub team: Option<String>,
    pub position: Option<String>,
}

impl MinorInfo {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CartLine {
    pub sku: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(range(min = 1, max = 100))]
    pub quantity: i32,
    pub unit_price_cents: i64,
}

impl CartLine {
    pub fn line_total_cents(&self) -> i64 {
        i64::from(self.quantity) * self.unit_price_cents
    }
}

/// Extra charge or discount applied to the retail order. Negative amounts are discounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct FeeLine {
    #[validate(length(min = 1, max = 200))]
    pub label: String,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingSelection {
    pub provider_id: Uuid,
    pub package_type: PackageType,
    /// Full package price, not per session.
    pub package_price_cents: i64,
    pub session_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub cart_subtotal_cents: i64,
    pub fees_total_cents: i64,
    /// Amount charged for the retail order (cart plus fee lines).
    pub order_total_cents: i64,
    pub training_total_cents: i64,
    pub grand_total_cents: i64,
}

impl PriceBreakdown {
    pub fn compute(
        cart: &[CartLine],
        fees: &[FeeLine],
        training: Option<&TrainingSelection>,
    ) -> Self {
        let cart_subtotal_cents: i64 = cart.iter().map(CartLine::line_total_cents).sum();
        let fees_total_cents: i64 = fees.iter().map(|f| f.amount_cents).sum();
        let order_total_cents = cart_subtotal_cents + fees_total_cents;
        let training_total_cents = training.map(|t| t.package_price_cents).unwrap_or(0);
        Self {
            cart_subtotal_cents,
            fees_total_cents,
            order_total_cents,
            training_total_cents,
            grand_total_cents: order_total_cents + training_total_cents,
        }
    }
}

/// Everything the buyer submitted, normalized, keyed by an opaque session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutDraft {
    pub session_token: String,
    pub guardian: GuardianInfo,
    pub emergency_contact: Option<EmergencyContact>,
    pub medical_notes: Option<String>,
    pub minors: Vec<MinorInfo>,
    pub cart: Vec<CartLine>,
    pub fees: Vec<FeeLine>,
    pub training: Option<TrainingSelection>,
    pub breakdown: PriceBreakdown,
    pub currency: String,
    pub payment_intent_id: Option<String>,
    /// Hex SHA-256 of the intent's client secret; authenticates client-side confirms.
    pub client_secret_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CheckoutDraft {
    pub fn has_cart(&self) -> bool {
        !self.cart.is_empty()
    }

    /// A booking is due only for a provider package with a non-zero price.
    pub fn bookable_training(&self) -> Option<&TrainingSelection> {
        self.training
            .as_ref()
            .filter(|t| self.breakdown.training_total_cents > 0 && t.package_price_cents > 0)
    }
}

pub fn new_session_token() -> String {
    format!("cs_{}", Uuid::new_v4().simple())
}

pub fn hash_client_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}
