//! Notification dispatch. The crate decides who is told what; rendering and transport
//! belong to the delivery collaborator behind [`NotificationDelivery`].

pub mod delivery;
pub mod scheduler;

pub use delivery::{
    HttpNotificationDelivery, LogNotificationDelivery, NotificationDelivery, SignatureGenerator,
};
pub use scheduler::{reminder_job_key, reminder_run_at, DbJobScheduler, JobScheduler, JobWorker};

use crate::{
    db::DbPool,
    entities::notification_log::{self, ActiveModel as MarkerActiveModel, Entity as MarkerEntity},
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{sea_query::OnConflict, ColumnTrait, DbErr, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Invalid notification: {0}")]
    Invalid(String),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecipientRole {
    Provider,
    Guardian,
    Admin,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TemplateKey {
    ProviderNewBooking,
    GuardianBookingConfirmed,
    AdminNewOrder,
    AdminOrderFallback,
    GuardianSessionReminder,
}

/// A message for one recipient. `subject` names the booking or order the message is
/// about; when set, at most one message per (subject, template) is ever sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub recipient_role: RecipientRole,
    pub template_key: TemplateKey,
    pub recipient_address: String,
    pub subject: Option<String>,
    pub payload: serde_json::Value,
}

impl NotificationEvent {
    pub fn dedupe_key(&self) -> Option<String> {
        self.subject
            .as_ref()
            .map(|subject| format!("{}:{}", subject, self.template_key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Sent,
    /// A marker for this subject and template already exists.
    Suppressed,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    db_pool: Arc<DbPool>,
    delivery: Arc<dyn NotificationDelivery>,
}

impl NotificationDispatcher {
    pub fn new(db_pool: Arc<DbPool>, delivery: Arc<dyn NotificationDelivery>) -> Self {
        Self { db_pool, delivery }
    }

    /// Sends the notification unless its marker already exists. The marker is written
    /// first and removed again if delivery fails, so a later attempt can retry.
    #[instrument(skip(self, event), fields(template = %event.template_key, role = %event.recipient_role))]
    pub async fn emit(&self, event: NotificationEvent) -> Result<EmitOutcome, NotificationError> {
        if event.recipient_address.trim().is_empty() {
            return Err(NotificationError::Invalid(format!(
                "no recipient address for {}",
                event.template_key
            )));
        }

        let dedupe_key = event.dedupe_key();
        if let Some(key) = &dedupe_key {
            let marker = MarkerActiveModel {
                id: Set(Uuid::new_v4()),
                dedupe_key: Set(key.clone()),
                template_key: Set(event.template_key.to_string()),
                recipient_role: Set(event.recipient_role.to_string()),
                recipient: Set(event.recipient_address.clone()),
                created_at: Set(Utc::now()),
            };
            let inserted = MarkerEntity::insert(marker)
                .on_conflict(
                    OnConflict::column(notification_log::Column::DedupeKey)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&*self.db_pool)
                .await?;
            if inserted == 0 {
                debug!(dedupe_key = %key, "Notification already sent");
                counter!("notifications_total", 1, "template" => event.template_key.to_string(), "outcome" => "suppressed");
                return Ok(EmitOutcome::Suppressed);
            }
        }

        match self
            .delivery
            .send(&event.recipient_address, event.template_key, &event.payload)
            .await
        {
            Ok(()) => {
                counter!("notifications_total", 1, "template" => event.template_key.to_string(), "outcome" => "sent");
                info!(recipient = %event.recipient_address, "Notification sent");
                Ok(EmitOutcome::Sent)
            }
            Err(e) => {
                if let Some(key) = &dedupe_key {
                    if let Err(cleanup) = MarkerEntity::delete_many()
                        .filter(notification_log::Column::DedupeKey.eq(key.as_str()))
                        .exec(&*self.db_pool)
                        .await
                    {
                        warn!(dedupe_key = %key, error = %cleanup, "Failed to remove notification marker");
                    }
                }
                counter!("notifications_total", 1, "template" => event.template_key.to_string(), "outcome" => "failed");
                Err(e)
            }
        }
    }
}
