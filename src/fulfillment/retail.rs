//! Retail order collaborator. Paid carts become orders through [`RetailOrderService`];
//! the crate ships a table-backed implementation.

use crate::{
    checkout::{CartLine, FeeLine},
    db::DbPool,
    entities::order::{self, ActiveModel as OrderActiveModel, Entity as OrderEntity},
    entities::order_item::{ActiveModel as OrderItemActiveModel},
    errors::ServiceError,
};
use chrono::Utc;
use rand::Rng;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumString};
use tracing::{error, info, instrument};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Fulfilled,
    Cancelled,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetailOrderRequest {
    pub guardian_id: Uuid,
    pub buyer_email: String,
    pub buyer_name: String,
    pub participant_names: Vec<String>,
    pub lines: Vec<CartLine>,
    /// May contain negative amounts (discounts).
    pub fee_lines: Vec<FeeLine>,
    pub currency: String,
    pub payment_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetailOrderReceipt {
    pub order_id: Uuid,
    pub order_number: String,
    pub total_cents: i64,
}

#[async_trait::async_trait]
pub trait RetailOrderService: Send + Sync {
    /// Creates the order for a payment. Repeating the call for the same payment
    /// reference returns the existing order.
    async fn create_order(&self, request: RetailOrderRequest) -> Result<RetailOrderReceipt, ServiceError>;

    async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<RetailOrderReceipt>, ServiceError>;

    async fn update_status(&self, order_id: Uuid, status: &str) -> Result<(), ServiceError>;
}

#[derive(Clone)]
pub struct DbRetailOrders {
    db_pool: Arc<DbPool>,
}

impl DbRetailOrders {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<order::Model>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::PaymentReference.eq(reference))
            .one(&*self.db_pool)
            .await?)
    }
}

fn generate_order_number() -> String {
    let n: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("ORD-{}-{:06}", Utc::now().format("%Y%m%d"), n)
}

fn receipt(model: &order::Model) -> RetailOrderReceipt {
    RetailOrderReceipt {
        order_id: model.id,
        order_number: model.order_number.clone(),
        total_cents: model.total_cents,
    }
}

#[async_trait::async_trait]
impl RetailOrderService for DbRetailOrders {
    #[instrument(skip(self, request), fields(payment_reference = %request.payment_reference))]
    async fn create_order(&self, request: RetailOrderRequest) -> Result<RetailOrderReceipt, ServiceError> {
        if let Some(existing) = self.find_by_reference(&request.payment_reference).await? {
            info!(order_id = %existing.id, "Order already exists for payment");
            return Ok(receipt(&existing));
        }

        let subtotal: i64 = request.lines.iter().map(CartLine::line_total_cents).sum();
        let fees: i64 = request.fee_lines.iter().map(|f| f.amount_cents).sum();
        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let notes = (!request.participant_names.is_empty())
            .then(|| format!("Participants: {}", request.participant_names.join(", ")));

        let txn = self.db_pool.begin().await?;

        let order = OrderActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number()),
            guardian_id: Set(request.guardian_id),
            payment_reference: Set(request.payment_reference.clone()),
            status: Set(OrderStatus::Confirmed.to_string()),
            payment_status: Set("paid".to_string()),
            subtotal_cents: Set(subtotal),
            fees_cents: Set(fees),
            total_cents: Set(subtotal + fees),
            currency: Set(request.currency.to_lowercase()),
            buyer_email: Set(request.buyer_email.clone()),
            notes: Set(notes),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let inserted = match order.insert(&txn).await {
            Ok(model) => model,
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                txn.rollback().await?;
                // A concurrent caller created the order for this payment first.
                return match self.find_by_reference(&request.payment_reference).await? {
                    Some(existing) => Ok(receipt(&existing)),
                    None => Err(ServiceError::DatabaseError(e)),
                };
            }
            Err(e) => {
                error!(error = %e, "Failed to insert retail order");
                return Err(e.into());
            }
        };

        let product_items = request.lines.iter().map(|line| OrderItemActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            kind: Set("product".to_string()),
            sku: Set(line.sku.clone()),
            name: Set(line.name.clone()),
            quantity: Set(line.quantity),
            unit_price_cents: Set(line.unit_price_cents),
            line_total_cents: Set(line.line_total_cents()),
            created_at: Set(now),
        });
        let fee_items = request.fee_lines.iter().map(|fee| OrderItemActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            kind: Set("fee".to_string()),
            sku: Set(None),
            name: Set(fee.label.clone()),
            quantity: Set(1),
            unit_price_cents: Set(fee.amount_cents),
            line_total_cents: Set(fee.amount_cents),
            created_at: Set(now),
        });
        for item in product_items.chain(fee_items) {
            item.insert(&txn).await?;
        }

        txn.commit().await?;
        metrics::counter!("retail_orders_created_total", 1);
        info!(order_id = %order_id, order_number = %inserted.order_number, total_cents = inserted.total_cents, "Retail order created");
        Ok(receipt(&inserted))
    }

    async fn find_by_payment_reference(
        &self,
        reference: &str,
    ) -> Result<Option<RetailOrderReceipt>, ServiceError> {
        Ok(self.find_by_reference(reference).await?.as_ref().map(receipt))
    }

    #[instrument(skip(self))]
    async fn update_status(&self, order_id: Uuid, status: &str) -> Result<(), ServiceError> {
        let status = OrderStatus::from_str(status)
            .map_err(|_| ServiceError::InvalidInput(format!("unknown order status '{status}'")))?;
        let existing = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("order {order_id} not found")))?;

        let mut active: OrderActiveModel = existing.into();
        active.status = Set(status.to_string());
        active.updated_at = Set(Utc::now());
        active.update(&*self.db_pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::run_migrations;
    use crate::entities::order_item;
    use sea_orm::{EntityTrait, PaginatorTrait};

    async fn service() -> (DbRetailOrders, Arc<DbPool>) {
        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        let db = Arc::new(db);
        (DbRetailOrders::new(db.clone()), db)
    }

    fn request(reference: &str) -> RetailOrderRequest {
        RetailOrderRequest {
            guardian_id: Uuid::new_v4(),
            buyer_email: "pat@example.com".into(),
            buyer_name: "Pat Lee".into(),
            participant_names: vec!["Sam Lee".into()],
            lines: vec![CartLine {
                sku: Some("CAMP-WK1".into()),
                name: "Week 1 day camp".into(),
                quantity: 1,
                unit_price_cents: 12_000,
            }],
            fee_lines: vec![FeeLine {
                label: "Early bird".into(),
                amount_cents: -1_000,
            }],
            currency: "USD".into(),
            payment_reference: reference.into(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_payment_reference() {
        let (svc, db) = service().await;
        let first = svc.create_order(request("pi_retail")).await.unwrap();
        let second = svc.create_order(request("pi_retail")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.total_cents, 11_000);
        assert!(first.order_number.starts_with("ORD-"));
        assert_eq!(OrderEntity::find().count(&*db).await.unwrap(), 1);
        assert_eq!(order_item::Entity::find().count(&*db).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_status_rejects_unknown_values() {
        let (svc, _) = service().await;
        let receipt = svc.create_order(request("pi_status")).await.unwrap();

        svc.update_status(receipt.order_id, "fulfilled").await.unwrap();
        let err = svc.update_status(receipt.order_id, "teleported").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidInput(_)));
    }
}
