use super::{
    session_alias_key, ClaimOutcome, ClaimToken, FulfillmentRecord, IdempotencyLedger,
    LedgerError,
};
use crate::entities::fulfillment_claim::{
    ActiveModel as ClaimActiveModel, Column, Entity as ClaimEntity, Model as ClaimModel,
    STATE_DONE, STATE_IN_FLIGHT,
};
use chrono::Utc;
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_CLAIM_ROUNDS: usize = 3;

/// Durable ledger backed by the `fulfillment_claims` table. Every state change is a
/// single conditional statement, so concurrent processes sharing the database agree
/// on one holder.
#[derive(Clone)]
pub struct DatabaseLedger {
    db: Arc<DatabaseConnection>,
}

impl DatabaseLedger {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    async fn try_insert(&self, claim: &ClaimToken, ttl: Duration) -> Result<bool, LedgerError> {
        let now = Utc::now();
        let row = ClaimActiveModel {
            claim_key: Set(claim.key.clone()),
            state: Set(STATE_IN_FLIGHT.to_string()),
            claim_token: Set(claim.token.clone()),
            expires_at: Set(now + lease(ttl)),
            order_id: Set(None),
            booking_id: Set(None),
            booking_number: Set(None),
            session_token: Set(None),
            client_secret_hash: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let inserted = ClaimEntity::insert(row)
            .on_conflict(OnConflict::column(Column::ClaimKey).do_nothing().to_owned())
            .exec_without_returning(&*self.db)
            .await?;
        Ok(inserted == 1)
    }

    /// Replaces an expired in-flight claim, provided nobody else replaced it first.
    async fn try_take_over(
        &self,
        stale: &ClaimModel,
        claim: &ClaimToken,
        ttl: Duration,
    ) -> Result<bool, LedgerError> {
        let now = Utc::now();
        let result = ClaimEntity::update_many()
            .col_expr(Column::ClaimToken, Expr::value(claim.token.clone()))
            .col_expr(Column::ExpiresAt, Expr::value(now + lease(ttl)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::ClaimKey.eq(stale.claim_key.clone()))
            .filter(Column::ClaimToken.eq(stale.claim_token.clone()))
            .filter(Column::State.eq(STATE_IN_FLIGHT))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn write_alias<C: ConnectionTrait>(
        conn: &C,
        token: &str,
        claim_token: &str,
        record: &FulfillmentRecord,
    ) -> Result<(), LedgerError> {
        let alias = ClaimActiveModel {
            claim_key: Set(session_alias_key(token)),
            state: Set(STATE_DONE.to_string()),
            claim_token: Set(claim_token.to_string()),
            expires_at: Set(record.completed_at),
            order_id: Set(record.order_id),
            booking_id: Set(record.booking_id),
            booking_number: Set(record.booking_number.clone()),
            session_token: Set(record.session_token.clone()),
            client_secret_hash: Set(record.client_secret_hash.clone()),
            created_at: Set(record.completed_at),
            updated_at: Set(record.completed_at),
        };
        ClaimEntity::insert(alias)
            .on_conflict(
                OnConflict::column(Column::ClaimKey)
                    .update_columns([
                        Column::State,
                        Column::ClaimToken,
                        Column::OrderId,
                        Column::BookingId,
                        Column::BookingNumber,
                        Column::SessionToken,
                        Column::ClientSecretHash,
                        Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await?;
        Ok(())
    }
}

fn lease(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(120))
}

fn record_from(model: ClaimModel) -> FulfillmentRecord {
    FulfillmentRecord {
        order_id: model.order_id,
        booking_id: model.booking_id,
        booking_number: model.booking_number,
        session_token: model.session_token,
        client_secret_hash: model.client_secret_hash,
        completed_at: model.updated_at,
    }
}

#[async_trait::async_trait]
impl IdempotencyLedger for DatabaseLedger {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, LedgerError> {
        let claim = ClaimToken::issue(key);

        for _ in 0..MAX_CLAIM_ROUNDS {
            if self.try_insert(&claim, ttl).await? {
                return Ok(ClaimOutcome::Claimed(claim));
            }

            let Some(existing) = ClaimEntity::find_by_id(key.to_string())
                .one(&*self.db)
                .await?
            else {
                // Released between our insert and read; try again.
                continue;
            };

            match existing.state.as_str() {
                STATE_DONE => return Ok(ClaimOutcome::AlreadyDone(record_from(existing))),
                STATE_IN_FLIGHT if existing.expires_at > Utc::now() => {
                    return Ok(ClaimOutcome::InFlight)
                }
                STATE_IN_FLIGHT => {
                    if self.try_take_over(&existing, &claim, ttl).await? {
                        debug!(key, "took over expired fulfillment claim");
                        return Ok(ClaimOutcome::Claimed(claim));
                    }
                    return Ok(ClaimOutcome::InFlight);
                }
                other => {
                    return Err(LedgerError::Corrupt {
                        key: key.to_string(),
                        reason: format!("unknown state '{other}'"),
                    })
                }
            }
        }

        Ok(ClaimOutcome::InFlight)
    }

    async fn complete(
        &self,
        claim: &ClaimToken,
        record: &FulfillmentRecord,
    ) -> Result<(), LedgerError> {
        let txn = self.db.begin().await?;

        let updated = ClaimEntity::update_many()
            .col_expr(Column::State, Expr::value(STATE_DONE))
            .col_expr(Column::OrderId, Expr::value(record.order_id))
            .col_expr(Column::BookingId, Expr::value(record.booking_id))
            .col_expr(Column::BookingNumber, Expr::value(record.booking_number.clone()))
            .col_expr(Column::SessionToken, Expr::value(record.session_token.clone()))
            .col_expr(
                Column::ClientSecretHash,
                Expr::value(record.client_secret_hash.clone()),
            )
            .col_expr(Column::UpdatedAt, Expr::value(record.completed_at))
            .filter(Column::ClaimKey.eq(claim.key.clone()))
            .filter(Column::ClaimToken.eq(claim.token.clone()))
            .filter(Column::State.eq(STATE_IN_FLIGHT))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            warn!(key = %claim.key, "claim no longer held at completion");
        }

        if let Some(token) = &record.session_token {
            Self::write_alias(&txn, token, &claim.token, record).await?;
        }

        txn.commit().await?;
        Ok(())
    }

    async fn release(&self, claim: &ClaimToken) -> Result<(), LedgerError> {
        ClaimEntity::delete_many()
            .filter(Column::ClaimKey.eq(claim.key.clone()))
            .filter(Column::ClaimToken.eq(claim.token.clone()))
            .filter(Column::State.eq(STATE_IN_FLIGHT))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<Option<FulfillmentRecord>, LedgerError> {
        let row = ClaimEntity::find()
            .filter(Column::ClaimKey.eq(key))
            .filter(Column::State.eq(STATE_DONE))
            .one(&*self.db)
            .await?;
        Ok(row.map(record_from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_migrations;
    use assert_matches::assert_matches;
    use uuid::Uuid;

    async fn ledger() -> DatabaseLedger {
        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        DatabaseLedger::new(Arc::new(db))
    }

    #[tokio::test]
    async fn claim_complete_and_alias() {
        let ledger = ledger().await;
        let ttl = Duration::from_secs(60);

        let claim = assert_matches!(
            ledger.claim("intent:pi_9", ttl).await.unwrap(),
            ClaimOutcome::Claimed(c) => c
        );
        assert_eq!(
            ledger.claim("intent:pi_9", ttl).await.unwrap(),
            ClaimOutcome::InFlight
        );
        assert_eq!(ledger.lookup("intent:pi_9").await.unwrap(), None);

        let booking_id = Uuid::new_v4();
        let record = FulfillmentRecord {
            order_id: None,
            booking_id: Some(booking_id),
            booking_number: Some("BK-20260101-QWERTY".into()),
            session_token: Some("cs_9".into()),
            client_secret_hash: Some("abc".into()),
            completed_at: Utc::now(),
        };
        ledger.complete(&claim, &record).await.unwrap();

        let done = assert_matches!(
            ledger.claim("intent:pi_9", ttl).await.unwrap(),
            ClaimOutcome::AlreadyDone(r) => r
        );
        assert_eq!(done.booking_id, Some(booking_id));

        let alias = ledger.lookup("session:cs_9").await.unwrap().unwrap();
        assert_eq!(alias.booking_number.as_deref(), Some("BK-20260101-QWERTY"));
    }

    #[tokio::test]
    async fn expired_claim_can_be_taken_over_once() {
        let ledger = ledger().await;
        let stale = assert_matches!(
            ledger.claim("intent:pi_s", Duration::from_millis(1)).await.unwrap(),
            ClaimOutcome::Claimed(c) => c
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fresh = assert_matches!(
            ledger.claim("intent:pi_s", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Claimed(c) => c
        );
        assert_ne!(fresh.token, stale.token);

        // The stale holder's release must not free the new holder's claim.
        ledger.release(&stale).await.unwrap();
        assert_eq!(
            ledger
                .claim("intent:pi_s", Duration::from_secs(60))
                .await
                .unwrap(),
            ClaimOutcome::InFlight
        );
    }

    #[tokio::test]
    async fn release_frees_the_key() {
        let ledger = ledger().await;
        let ttl = Duration::from_secs(60);
        let claim = assert_matches!(
            ledger.claim("intent:pi_r", ttl).await.unwrap(),
            ClaimOutcome::Claimed(c) => c
        );
        ledger.release(&claim).await.unwrap();
        assert_matches!(
            ledger.claim("intent:pi_r", ttl).await.unwrap(),
            ClaimOutcome::Claimed(_)
        );
    }
}
