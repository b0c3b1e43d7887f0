use crate::{
    checkout::PackageType,
    db::DbPool,
    entities::package_credit::{
        ActiveModel as CreditActiveModel, Column, Entity as CreditEntity, Model as CreditModel,
    },
    errors::ServiceError,
};
use chrono::{Duration, Utc};
use sea_orm::{
    sea_query::{Expr, OnConflict},
    ColumnTrait, EntityTrait, QueryFilter, Set,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Inputs for issuing the prepaid credits of a multi-session package.
#[derive(Debug, Clone)]
pub struct CreditIssue {
    pub guardian_id: Uuid,
    pub provider_id: Uuid,
    pub booking_id: Option<Uuid>,
    pub package_type: PackageType,
    pub total_sessions: i32,
    pub price_per_session_cents: i64,
    pub amount_paid_cents: i64,
    pub payment_intent_id: String,
}

#[derive(Clone)]
pub struct PackageCreditService {
    db_pool: Arc<DbPool>,
    expiry: Duration,
}

impl PackageCreditService {
    pub fn new(db_pool: Arc<DbPool>, expiry_days: u32) -> Self {
        Self {
            db_pool,
            expiry: Duration::days(i64::from(expiry_days)),
        }
    }

    /// Issues credits for a package. The first session is consumed by the booking
    /// itself, so `remaining` starts at `total - 1`. One credit row per payment.
    #[instrument(skip(self, issue), fields(payment_intent_id = %issue.payment_intent_id))]
    pub async fn issue_credits(&self, issue: CreditIssue) -> Result<Uuid, ServiceError> {
        if issue.total_sessions < 2 {
            return Err(ServiceError::InvalidInput(format!(
                "package credits need at least 2 sessions, got {}",
                issue.total_sessions
            )));
        }

        let now = Utc::now();
        let credit = CreditActiveModel {
            id: Set(Uuid::new_v4()),
            guardian_id: Set(issue.guardian_id),
            provider_id: Set(issue.provider_id),
            booking_id: Set(issue.booking_id),
            package_type: Set(issue.package_type.to_string()),
            total_credits: Set(issue.total_sessions),
            remaining: Set(issue.total_sessions - 1),
            price_per_session_cents: Set(issue.price_per_session_cents),
            amount_paid_cents: Set(issue.amount_paid_cents),
            payment_intent_id: Set(issue.payment_intent_id.clone()),
            expires_at: Set(now + self.expiry),
            created_at: Set(now),
            updated_at: Set(now),
        };
        CreditEntity::insert(credit)
            .on_conflict(OnConflict::column(Column::PaymentIntentId).do_nothing().to_owned())
            .exec_without_returning(&*self.db_pool)
            .await?;

        let stored = CreditEntity::find()
            .filter(Column::PaymentIntentId.eq(issue.payment_intent_id.as_str()))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError("issued package credit not found".to_string())
            })?;
        info!(credit_id = %stored.id, remaining = stored.remaining, "Package credits issued");
        Ok(stored.id)
    }

    /// Consumes one credit. Fails when none remain or the credit has expired.
    #[instrument(skip(self))]
    pub async fn redeem_credit(&self, credit_id: Uuid) -> Result<CreditModel, ServiceError> {
        let now = Utc::now();
        let result = CreditEntity::update_many()
            .col_expr(Column::Remaining, Expr::col(Column::Remaining).sub(1))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(credit_id))
            .filter(Column::Remaining.gt(0))
            .filter(Column::ExpiresAt.gt(now))
            .exec(&*self.db_pool)
            .await?;

        let credit = self.get(credit_id).await?;
        if result.rows_affected == 0 {
            return Err(if credit.is_expired(now) {
                ServiceError::InvalidOperation(format!("package credit {credit_id} has expired"))
            } else {
                ServiceError::InvalidOperation(format!(
                    "package credit {credit_id} has no sessions left"
                ))
            });
        }
        Ok(credit)
    }

    pub async fn get(&self, credit_id: Uuid) -> Result<CreditModel, ServiceError> {
        CreditEntity::find_by_id(credit_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("package credit {credit_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_migrations;
    use assert_matches::assert_matches;

    async fn service(expiry_days: u32) -> PackageCreditService {
        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        PackageCreditService::new(Arc::new(db), expiry_days)
    }

    fn issue(intent: &str, total: i32) -> CreditIssue {
        CreditIssue {
            guardian_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            booking_id: Some(Uuid::new_v4()),
            package_type: PackageType::ThreePack,
            total_sessions: total,
            price_per_session_cents: 3_000,
            amount_paid_cents: 9_000,
            payment_intent_id: intent.to_string(),
        }
    }

    #[tokio::test]
    async fn issuance_consumes_first_session_and_dedupes() {
        let credits = service(365).await;
        let id = credits.issue_credits(issue("pi_c1", 3)).await.unwrap();
        let again = credits.issue_credits(issue("pi_c1", 3)).await.unwrap();
        assert_eq!(id, again);

        let credit = credits.get(id).await.unwrap();
        assert_eq!(credit.total_credits, 3);
        assert_eq!(credit.remaining, 2);
        let horizon = credit.expires_at - credit.created_at;
        assert_eq!(horizon.num_days(), 365);
    }

    #[tokio::test]
    async fn redeem_never_goes_negative() {
        let credits = service(365).await;
        let id = credits.issue_credits(issue("pi_c2", 3)).await.unwrap();

        assert_eq!(credits.redeem_credit(id).await.unwrap().remaining, 1);
        assert_eq!(credits.redeem_credit(id).await.unwrap().remaining, 0);
        assert_matches!(
            credits.redeem_credit(id).await,
            Err(ServiceError::InvalidOperation(_))
        );
        assert_eq!(credits.get(id).await.unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn single_session_packages_get_no_credits() {
        let credits = service(365).await;
        assert_matches!(
            credits.issue_credits(issue("pi_c3", 1)).await,
            Err(ServiceError::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn expired_credit_cannot_be_redeemed() {
        let credits = service(0).await;
        let id = credits.issue_credits(issue("pi_c4", 5)).await.unwrap();
        assert_matches!(
            credits.redeem_credit(id).await,
            Err(ServiceError::InvalidOperation(msg)) if msg.contains("expired")
        );
    }
}
