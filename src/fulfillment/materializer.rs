use super::booking_writer::{generate_booking_number, BookingStatus, BookingWriter, NewBooking, StoredBooking};
use super::fees;
use super::retail::{RetailOrderRequest, RetailOrderService};
use crate::{
    checkout::{CheckoutDraft, MinorInfo},
    db::DbPool,
    entities::{
        account::{self, Entity as AccountEntity},
        guardian::{self, Entity as GuardianEntity, Model as GuardianModel},
        minor::{self, Entity as MinorEntity, Model as MinorModel},
    },
    errors::ServiceError,
    events::{BookingSummary, FulfillmentEvent, OrderSummary},
    payments::PaymentEvidence,
};
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction,
    EntityTrait, QueryFilter, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const BOOKING_NUMBER_ATTEMPTS: usize = 5;

/// Ids of the records a payment turned into.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentIds {
    pub order_id: Option<Uuid>,
    pub booking_id: Option<Uuid>,
    pub booking_number: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Materialized {
    pub ids: FulfillmentIds,
    pub events: Vec<FulfillmentEvent>,
}

/// Turns a paid checkout draft into durable records.
#[derive(Clone)]
pub struct Materializer {
    db_pool: Arc<DbPool>,
    retail: Arc<dyn RetailOrderService>,
    bookings: Arc<BookingWriter>,
    platform_fee_bps: u32,
}

impl Materializer {
    pub fn new(
        db_pool: Arc<DbPool>,
        retail: Arc<dyn RetailOrderService>,
        bookings: Arc<BookingWriter>,
        platform_fee_bps: u32,
    ) -> Self {
        Self {
            db_pool,
            retail,
            bookings,
            platform_fee_bps,
        }
    }

    #[instrument(skip(self, draft, evidence), fields(session_token = %draft.session_token, payment_intent_id = %evidence.intent_id))]
    pub async fn materialize(
        &self,
        draft: &CheckoutDraft,
        evidence: &PaymentEvidence,
    ) -> Result<Materialized, ServiceError> {
        let (guardian, minors) = self.upsert_people(draft).await?;
        let mut ids = FulfillmentIds::default();
        let mut events = Vec::new();

        if draft.has_cart() {
            let request = RetailOrderRequest {
                guardian_id: guardian.id,
                buyer_email: guardian.email.clone(),
                buyer_name: guardian.full_name(),
                participant_names: minors.iter().map(MinorModel::full_name).collect(),
                lines: draft.cart.clone(),
                fee_lines: draft.fees.clone(),
                currency: draft.currency.clone(),
                payment_reference: evidence.intent_id.clone(),
            };
            match self.retail.create_order(request).await {
                Ok(receipt) => {
                    ids.order_id = Some(receipt.order_id);
                    events.push(FulfillmentEvent::OrderCreated(OrderSummary {
                        order_id: receipt.order_id,
                        order_number: receipt.order_number,
                        guardian_name: guardian.full_name(),
                        guardian_email: guardian.email.clone(),
                        total_cents: receipt.total_cents,
                        currency: draft.currency.clone(),
                        payment_intent_id: evidence.intent_id.clone(),
                    }));
                }
                Err(e) => {
                    error!(error = %e, "Retail order creation failed; continuing with booking");
                    counter!("fulfillment_retail_order_failures_total", 1);
                    events.push(FulfillmentEvent::RetailOrderFailed {
                        payment_intent_id: evidence.intent_id.clone(),
                        guardian_name: guardian.full_name(),
                        guardian_email: guardian.email.clone(),
                        total_cents: draft.breakdown.order_total_cents,
                        currency: draft.currency.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if let Some(training) = draft.bookable_training() {
            let amount = draft.breakdown.training_total_cents;
            let booking = match self
                .bookings
                .find_by_payment_intent(&*self.db_pool, &evidence.intent_id)
                .await?
            {
                Some(existing) => {
                    info!(booking_id = %existing.id, "Reusing booking already written for this payment");
                    existing
                }
                None => {
                    let split = fees::split(amount, self.platform_fee_bps);
                    let sessions = training.package_type.sessions();
                    let new_booking = NewBooking {
                        id: Uuid::new_v4(),
                        booking_number: String::new(),
                        provider_id: training.provider_id,
                        guardian_id: guardian.id,
                        minor_ids: minors.iter().map(|m| m.id).collect(),
                        package_type: training.package_type,
                        total_sessions: sessions,
                        sessions_remaining: sessions,
                        split,
                        currency: draft.currency.clone(),
                        payment_intent_id: evidence.intent_id.clone(),
                        status: BookingStatus::Confirmed,
                        session_start: training.session_start,
                        created_at: Utc::now(),
                    };
                    self.insert_booking(new_booking).await?
                }
            };

            let split = fees::FeeSplit {
                amount_paid_cents: booking.amount_paid_cents,
                platform_fee_cents: booking.platform_fee_cents,
                provider_payout_cents: booking.provider_payout_cents,
                fee_rate_bps: self.platform_fee_bps,
            };
            ids.booking_id = Some(booking.id);
            ids.booking_number = Some(booking.booking_number.clone());
            events.push(FulfillmentEvent::BookingConfirmed(BookingSummary {
                booking_id: booking.id,
                booking_number: booking.booking_number,
                provider_id: training.provider_id,
                guardian_id: guardian.id,
                guardian_name: guardian.full_name(),
                guardian_email: guardian.email.clone(),
                minor_names: minors.iter().map(MinorModel::full_name).collect(),
                package_type: training.package_type,
                total_sessions: booking.total_sessions,
                amount_paid_cents: split.amount_paid_cents,
                platform_fee_cents: split.platform_fee_cents,
                provider_payout_cents: split.provider_payout_cents,
                currency: draft.currency.clone(),
                payment_intent_id: evidence.intent_id.clone(),
                session_start: training.session_start,
            }));
        }

        counter!("fulfillment_materialized_total", 1);
        Ok(Materialized { ids, events })
    }

    /// Ids of records already written for a payment whose draft is gone, e.g. after
    /// a run that committed its records but never got them into the ledger.
    #[instrument(skip(self))]
    pub async fn recover(&self, payment_intent_id: &str) -> Result<Option<FulfillmentIds>, ServiceError> {
        let order = self.retail.find_by_payment_reference(payment_intent_id).await?;
        let booking = self
            .bookings
            .find_by_payment_intent(&*self.db_pool, payment_intent_id)
            .await?;
        if order.is_none() && booking.is_none() {
            return Ok(None);
        }
        Ok(Some(FulfillmentIds {
            order_id: order.map(|o| o.order_id),
            booking_id: booking.as_ref().map(|b| b.id),
            booking_number: booking.map(|b| b.booking_number),
        }))
    }

    /// Writes the booking, drawing a fresh booking number on collision. A collision on
    /// the payment intent means another writer got there first; its booking is reused.
    async fn insert_booking(&self, mut booking: NewBooking) -> Result<StoredBooking, ServiceError> {
        for attempt in 1..=BOOKING_NUMBER_ATTEMPTS {
            booking.booking_number = generate_booking_number(booking.created_at);
            match self.bookings.insert(&*self.db_pool, &booking).await {
                Ok(()) => {
                    info!(booking_id = %booking.id, booking_number = %booking.booking_number, "Booking created");
                    return self
                        .bookings
                        .fetch(&*self.db_pool, booking.id)
                        .await?
                        .ok_or_else(|| ServiceError::InternalError("booking vanished after insert".to_string()));
                }
                Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                    if let Some(existing) = self
                        .bookings
                        .find_by_payment_intent(&*self.db_pool, &booking.payment_intent_id)
                        .await?
                    {
                        return Ok(existing);
                    }
                    warn!(attempt, booking_number = %booking.booking_number, "Booking number collision; retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::InternalError(
            "could not allocate a unique booking number".to_string(),
        ))
    }

    async fn upsert_people(
        &self,
        draft: &CheckoutDraft,
    ) -> Result<(GuardianModel, Vec<MinorModel>), ServiceError> {
        let txn = self.db_pool.begin().await?;
        let guardian = upsert_guardian(&txn, draft).await?;
        let mut minors = Vec::with_capacity(draft.minors.len());
        for info in &draft.minors {
            minors.push(upsert_minor(&txn, &guardian, info).await?);
        }
        txn.commit().await?;
        Ok((guardian, minors))
    }
}

async fn upsert_guardian(
    txn: &DatabaseTransaction,
    draft: &CheckoutDraft,
) -> Result<GuardianModel, ServiceError> {
    let now = Utc::now();
    let email = draft.guardian.email.trim().to_lowercase();
    let display_name = draft.guardian.full_name();

    AccountEntity::insert(account::ActiveModel {
        id: Set(Uuid::new_v4()),
        email: Set(email.clone()),
        display_name: Set(display_name),
        created_at: Set(now),
        updated_at: Set(now),
    })
    .on_conflict(OnConflict::column(account::Column::Email).do_nothing().to_owned())
    .exec_without_returning(txn)
    .await?;
    let account = AccountEntity::find()
        .filter(account::Column::Email.eq(email.as_str()))
        .one(txn)
        .await?
        .ok_or_else(|| ServiceError::InternalError(format!("account for {email} missing after upsert")))?;

    let contact = draft.emergency_contact.as_ref();
    match GuardianEntity::find()
        .filter(guardian::Column::Email.eq(email.as_str()))
        .one(txn)
        .await?
    {
        Some(existing) => {
            let mut active: guardian::ActiveModel = existing.into();
            active.first_name = Set(draft.guardian.first_name.clone());
            active.last_name = Set(draft.guardian.last_name.clone());
            if draft.guardian.phone.is_some() {
                active.phone = Set(draft.guardian.phone.clone());
            }
            if let Some(c) = contact {
                active.emergency_contact_name = Set(Some(c.name.clone()));
                active.emergency_contact_phone = Set(Some(c.phone.clone()));
                active.emergency_contact_relationship = Set(c.relationship.clone());
            }
            if draft.medical_notes.is_some() {
                active.medical_notes = Set(draft.medical_notes.clone());
            }
            active.updated_at = Set(now);
            Ok(active.update(txn).await?)
        }
        None => {
            let created = guardian::ActiveModel {
                id: Set(Uuid::new_v4()),
                account_id: Set(account.id),
                first_name: Set(draft.guardian.first_name.clone()),
                last_name: Set(draft.guardian.last_name.clone()),
                email: Set(email),
                phone: Set(draft.guardian.phone.clone()),
                emergency_contact_name: Set(contact.map(|c| c.name.clone())),
                emergency_contact_phone: Set(contact.map(|c| c.phone.clone())),
                emergency_contact_relationship: Set(contact.and_then(|c| c.relationship.clone())),
                medical_notes: Set(draft.medical_notes.clone()),
                created_at: Set(now),
                updated_at: Set(now),
            };
            Ok(created.insert(txn).await?)
        }
    }
}

/// Reuses the minor named by `existing_id` when it belongs to this guardian, else one
/// with the same name, else creates a new one.
async fn upsert_minor<C: ConnectionTrait>(
    conn: &C,
    guardian: &GuardianModel,
    info: &MinorInfo,
) -> Result<MinorModel, ServiceError> {
    let now = Utc::now();
    let siblings = MinorEntity::find()
        .filter(minor::Column::GuardianId.eq(guardian.id))
        .all(conn)
        .await?;

    let by_id = info
        .existing_id
        .and_then(|id| siblings.iter().find(|m| m.id == id));
    let matched = by_id.or_else(|| {
        siblings.iter().find(|m| {
            m.first_name.eq_ignore_ascii_case(&info.first_name)
                && m.last_name.eq_ignore_ascii_case(&info.last_name)
        })
    });

    match matched {
        Some(existing) => {
            let mut active: minor::ActiveModel = existing.clone().into();
            if info.date_of_birth.is_some() {
                active.date_of_birth = Set(info.date_of_birth);
            }
            if info.shirt_size.is_some() {
                active.shirt_size = Set(info.shirt_size.clone());
            }
            if info.team.is_some() {
                active.team = Set(info.team.clone());
            }
            if info.position.is_some() {
                active.position = Set(info.position.clone());
            }
            active.updated_at = Set(now);
            Ok(active.update(conn).await?)
        }
        None => {
            if let Some(id) = info.existing_id {
                warn!(minor_id = %id, guardian_id = %guardian.id, "Selected minor does not belong to guardian; creating a new record");
            }
            let created = minor::ActiveModel {
                id: Set(Uuid::new_v4()),
                guardian_id: Set(guardian.id),
                first_name: Set(info.first_name.clone()),
                last_name: Set(info.last_name.clone()),
                date_of_birth: Set(info.date_of_birth),
                shirt_size: Set(info.shirt_size.clone()),
                team: Set(info.team.clone()),
                position: Set(info.position.clone()),
                created_at: Set(now),
                updated_at: Set(now),
            };
            Ok(created.insert(conn).await?)
        }
    }
}
