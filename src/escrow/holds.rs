use crate::{
    db::DbPool,
    entities::escrow_hold::{
        ActiveModel as HoldActiveModel, Column, Entity as HoldEntity, HoldState, Model as HoldModel,
    },
    errors::ServiceError,
};
use chrono::Utc;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, EntityTrait, QueryFilter, Set,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Escrow holds keep a booking's payment until the sessions are delivered.
#[derive(Clone)]
pub struct EscrowService {
    db_pool: Arc<DbPool>,
}

impl EscrowService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    /// Opens the hold for a booking. A booking has at most one hold; opening again
    /// returns the existing one.
    #[instrument(skip(self))]
    pub async fn open_hold(
        &self,
        booking_id: Uuid,
        payment_intent_id: &str,
        amount_cents: i64,
        currency: &str,
    ) -> Result<Uuid, ServiceError> {
        if amount_cents <= 0 {
            return Err(ServiceError::InvalidInput(
                "escrow amount must be positive".to_string(),
            ));
        }

        let hold = HoldActiveModel {
            id: Set(Uuid::new_v4()),
            booking_id: Set(booking_id),
            payment_intent_id: Set(payment_intent_id.to_string()),
            amount_cents: Set(amount_cents),
            currency: Set(currency.to_lowercase()),
            state: Set(HoldState::Held.to_string()),
            created_at: Set(Utc::now()),
            released_at: Set(None),
            refunded_at: Set(None),
        };
        HoldEntity::insert(hold)
            .on_conflict(OnConflict::column(Column::BookingId).do_nothing().to_owned())
            .exec_without_returning(&*self.db_pool)
            .await?;

        let stored = self.find_by_booking(booking_id).await?.ok_or_else(|| {
            ServiceError::InternalError(format!("escrow hold for booking {booking_id} vanished"))
        })?;
        if stored.amount_cents != amount_cents {
            warn!(
                hold_id = %stored.id,
                stored = stored.amount_cents,
                requested = amount_cents,
                "Existing escrow hold amount differs from booking amount"
            );
        }
        info!(hold_id = %stored.id, %booking_id, amount_cents, "Escrow hold open");
        Ok(stored.id)
    }

    pub async fn find_by_booking(&self, booking_id: Uuid) -> Result<Option<HoldModel>, ServiceError> {
        Ok(HoldEntity::find()
            .filter(Column::BookingId.eq(booking_id))
            .one(&*self.db_pool)
            .await?)
    }

    /// Pays the held amount out to the provider.
    pub async fn release_hold(&self, hold_id: Uuid) -> Result<HoldModel, ServiceError> {
        self.settle(hold_id, HoldState::Released).await
    }

    /// Returns the held amount to the buyer.
    pub async fn refund_hold(&self, hold_id: Uuid) -> Result<HoldModel, ServiceError> {
        self.settle(hold_id, HoldState::Refunded).await
    }

    #[instrument(skip(self))]
    async fn settle(&self, hold_id: Uuid, target: HoldState) -> Result<HoldModel, ServiceError> {
        let now = Utc::now();
        let timestamp_column = match target {
            HoldState::Released => Column::ReleasedAt,
            HoldState::Refunded => Column::RefundedAt,
            HoldState::Held => {
                return Err(ServiceError::InvalidOperation(
                    "a hold cannot be moved back to held".to_string(),
                ))
            }
        };

        let result = HoldEntity::update_many()
            .col_expr(Column::State, Expr::value(target.to_string()))
            .col_expr(timestamp_column, Expr::value(Some(now)))
            .filter(Column::Id.eq(hold_id))
            .filter(Column::State.eq(HoldState::Held.to_string()))
            .exec(&*self.db_pool)
            .await?;

        let hold = HoldEntity::find_by_id(hold_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("escrow hold {hold_id} not found")))?;

        if result.rows_affected == 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "escrow hold {} is already {}",
                hold_id, hold.state
            )));
        }

        metrics::counter!("escrow_holds_settled_total", 1, "outcome" => target.to_string());
        info!(%hold_id, state = %hold.state, "Escrow hold settled");
        Ok(hold)
    }
}
