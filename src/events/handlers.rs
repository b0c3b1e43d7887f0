use super::{BookingSummary, FulfillmentEvent, PostCommitHandler, SideEffectError};
use crate::{
    db::DbPool,
    entities::provider::Entity as ProviderEntity,
    escrow::{CreditIssue, EscrowService, PackageCreditService},
    fulfillment::booking_writer::{BookingWriter, SideEffectFlag},
    fulfillment::fees::display_amount,
    notifications::{
        reminder_job_key, reminder_run_at, JobScheduler, NotificationDispatcher,
        NotificationEvent, RecipientRole, TemplateKey,
    },
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sea_orm::EntityTrait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

async fn flag_booking(
    db: &DbPool,
    bookings: &BookingWriter,
    booking_id: Uuid,
    flag: SideEffectFlag,
) {
    if let Err(e) = bookings.mark_side_effect_failure(db, booking_id, flag).await {
        warn!(%booking_id, flag = %flag, error = %e, "Failed to flag booking for follow-up");
    }
}

/// Opens the escrow hold for every confirmed booking.
pub struct EscrowHandler {
    db_pool: Arc<DbPool>,
    escrow: Arc<EscrowService>,
    bookings: Arc<BookingWriter>,
}

impl EscrowHandler {
    pub fn new(db_pool: Arc<DbPool>, escrow: Arc<EscrowService>, bookings: Arc<BookingWriter>) -> Self {
        Self {
            db_pool,
            escrow,
            bookings,
        }
    }
}

#[async_trait]
impl PostCommitHandler for EscrowHandler {
    fn name(&self) -> &'static str {
        "escrow"
    }

    async fn handle(&self, event: &FulfillmentEvent) -> Result<(), SideEffectError> {
        let FulfillmentEvent::BookingConfirmed(booking) = event else {
            return Ok(());
        };
        if let Err(e) = self
            .escrow
            .open_hold(
                booking.booking_id,
                &booking.payment_intent_id,
                booking.amount_paid_cents,
                &booking.currency,
            )
            .await
        {
            flag_booking(&self.db_pool, &self.bookings, booking.booking_id, SideEffectFlag::Escrow).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Issues prepaid credits for multi-session packages.
pub struct PackageCreditHandler {
    db_pool: Arc<DbPool>,
    credits: Arc<PackageCreditService>,
    bookings: Arc<BookingWriter>,
}

impl PackageCreditHandler {
    pub fn new(
        db_pool: Arc<DbPool>,
        credits: Arc<PackageCreditService>,
        bookings: Arc<BookingWriter>,
    ) -> Self {
        Self {
            db_pool,
            credits,
            bookings,
        }
    }
}

#[async_trait]
impl PostCommitHandler for PackageCreditHandler {
    fn name(&self) -> &'static str {
        "package_credits"
    }

    async fn handle(&self, event: &FulfillmentEvent) -> Result<(), SideEffectError> {
        let FulfillmentEvent::BookingConfirmed(booking) = event else {
            return Ok(());
        };
        if booking.total_sessions <= 1 {
            return Ok(());
        }

        let issue = CreditIssue {
            guardian_id: booking.guardian_id,
            provider_id: booking.provider_id,
            booking_id: Some(booking.booking_id),
            package_type: booking.package_type,
            total_sessions: booking.total_sessions,
            price_per_session_cents: booking.amount_paid_cents / i64::from(booking.total_sessions),
            amount_paid_cents: booking.amount_paid_cents,
            payment_intent_id: booking.payment_intent_id.clone(),
        };
        if let Err(e) = self.credits.issue_credits(issue).await {
            flag_booking(&self.db_pool, &self.bookings, booking.booking_id, SideEffectFlag::Credits).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Tells providers, guardians and admins about bookings and orders.
pub struct NotificationHandler {
    db_pool: Arc<DbPool>,
    dispatcher: Arc<NotificationDispatcher>,
    admin_email: String,
}

impl NotificationHandler {
    pub fn new(db_pool: Arc<DbPool>, dispatcher: Arc<NotificationDispatcher>, admin_email: impl Into<String>) -> Self {
        Self {
            db_pool,
            dispatcher,
            admin_email: admin_email.into(),
        }
    }

    async fn booking_notifications(
        &self,
        booking: &BookingSummary,
    ) -> Result<Vec<NotificationEvent>, SideEffectError> {
        let subject = format!("booking:{}", booking.booking_id);
        let provider = ProviderEntity::find_by_id(booking.provider_id)
            .one(&*self.db_pool)
            .await?;

        let payload = json!({
            "booking_number": booking.booking_number,
            "guardian_name": booking.guardian_name,
            "participants": booking.minor_names,
            "package_type": booking.package_type,
            "total_sessions": booking.total_sessions,
            "amount_paid": display_amount(booking.amount_paid_cents, &booking.currency),
            "provider_payout": display_amount(booking.provider_payout_cents, &booking.currency),
            "session_start": booking.session_start,
            "provider_name": provider.as_ref().map(|p| p.display_name.clone()),
        });

        let mut out = Vec::with_capacity(2);
        match provider {
            Some(p) => out.push(NotificationEvent {
                recipient_role: RecipientRole::Provider,
                template_key: TemplateKey::ProviderNewBooking,
                recipient_address: p.email,
                subject: Some(subject.clone()),
                payload: payload.clone(),
            }),
            None => warn!(provider_id = %booking.provider_id, "Provider not found; skipping provider notification"),
        }
        out.push(NotificationEvent {
            recipient_role: RecipientRole::Guardian,
            template_key: TemplateKey::GuardianBookingConfirmed,
            recipient_address: booking.guardian_email.clone(),
            subject: Some(subject),
            payload,
        });
        Ok(out)
    }
}

#[async_trait]
impl PostCommitHandler for NotificationHandler {
    fn name(&self) -> &'static str {
        "notifications"
    }

    async fn handle(&self, event: &FulfillmentEvent) -> Result<(), SideEffectError> {
        let notifications = match event {
            FulfillmentEvent::BookingConfirmed(booking) => self.booking_notifications(booking).await?,
            FulfillmentEvent::OrderCreated(order) => vec![NotificationEvent {
                recipient_role: RecipientRole::Admin,
                template_key: TemplateKey::AdminNewOrder,
                recipient_address: self.admin_email.clone(),
                subject: Some(format!("order:{}", order.order_id)),
                payload: json!({
                    "order_number": order.order_number,
                    "guardian_name": order.guardian_name,
                    "guardian_email": order.guardian_email,
                    "total": display_amount(order.total_cents, &order.currency),
                }),
            }],
            FulfillmentEvent::RetailOrderFailed {
                payment_intent_id,
                guardian_name,
                guardian_email,
                total_cents,
                currency,
                reason,
            } => vec![NotificationEvent {
                recipient_role: RecipientRole::Admin,
                template_key: TemplateKey::AdminOrderFallback,
                recipient_address: self.admin_email.clone(),
                subject: Some(format!("payment:{payment_intent_id}")),
                payload: json!({
                    "payment_intent_id": payment_intent_id,
                    "guardian_name": guardian_name,
                    "guardian_email": guardian_email,
                    "total": display_amount(*total_cents, currency),
                    "reason": reason,
                }),
            }],
        };

        let mut errors = Vec::new();
        for notification in notifications {
            let template = notification.template_key;
            if let Err(e) = self.dispatcher.emit(notification).await {
                errors.push(format!("{template}: {e}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SideEffectError::Multiple(errors.join("; ")))
        }
    }
}

/// Schedules the guardian's reminder before the first session.
pub struct ReminderHandler {
    scheduler: Arc<dyn JobScheduler>,
    lead: Duration,
}

impl ReminderHandler {
    pub fn new(scheduler: Arc<dyn JobScheduler>, lead_hours: u32) -> Self {
        Self {
            scheduler,
            lead: Duration::hours(i64::from(lead_hours)),
        }
    }
}

#[async_trait]
impl PostCommitHandler for ReminderHandler {
    fn name(&self) -> &'static str {
        "reminders"
    }

    async fn handle(&self, event: &FulfillmentEvent) -> Result<(), SideEffectError> {
        let FulfillmentEvent::BookingConfirmed(booking) = event else {
            return Ok(());
        };
        let Some(run_at) = reminder_run_at(booking.session_start, Utc::now(), self.lead) else {
            debug!(booking_id = %booking.booking_id, "No upcoming session; reminder not scheduled");
            return Ok(());
        };

        let reminder = NotificationEvent {
            recipient_role: RecipientRole::Guardian,
            template_key: TemplateKey::GuardianSessionReminder,
            recipient_address: booking.guardian_email.clone(),
            subject: None,
            payload: json!({
                "booking_number": booking.booking_number,
                "participants": booking.minor_names,
                "session_start": booking.session_start,
            }),
        };
        self.scheduler
            .schedule_at(run_at, &reminder_job_key(booking.booking_id), &reminder)
            .await?;
        Ok(())
    }
}
