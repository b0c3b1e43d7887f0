use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per idempotency key. `state` is `in_flight` while a materializer holds the
/// claim and `done` once the resulting ids are recorded.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "fulfillment_claims")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub claim_key: String,
    pub state: String,
    pub claim_token: String,
    pub expires_at: DateTime<Utc>,
    pub order_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub booking_number: Option<String>,
    pub session_token: Option<String>,
    pub client_secret_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

pub const STATE_IN_FLIGHT: &str = "in_flight";
pub const STATE_DONE: &str = "done";
