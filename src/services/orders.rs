use crate::{
    entities::{
        order::{self, OrderStatus, PaymentMethod, PaymentStatus, ShippingAddress},
        order_item, payment,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::{DateTime, Utc};
use metrics::counter;
use rand::{distributions::Uniform, Rng};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

const ORDER_SUFFIX_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// `ORD-YYYYMMDD-XXXXXX`, date in UTC.
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let pick = Uniform::from(0..ORDER_SUFFIX_ALPHABET.len());
    let suffix: String = (0..6)
        .map(|_| ORDER_SUFFIX_ALPHABET[rng.sample(pick)] as char)
        .collect();
    format!("ORD-{}-{}", now.format("%Y%m%d"), suffix)
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
}

impl From<order_item::Model> for OrderItemView {
    fn from(i: order_item::Model) -> Self {
        Self {
            product_id: i.product_id,
            product_name: i.product_name,
            unit_price: i.unit_price,
            quantity: i.quantity,
            line_total: i.line_total,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderView {
    pub id: Uuid,
    pub order_number: String,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub discount_amount: Decimal,
    pub total: Decimal,
    pub coupon_code: Option<String>,
    pub shipping_address: ShippingAddress,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<OrderItemView>,
}

impl OrderView {
    pub fn new(order: order::Model, items: Vec<order_item::Model>) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number,
            status: order.status,
            payment_method: order.payment_method,
            payment_status: order.payment_status,
            subtotal: order.subtotal,
            shipping_fee: order.shipping_fee,
            discount_amount: order.discount_amount,
            total: order.total,
            coupon_code: order.coupon_code,
            shipping_address: order.shipping_address,
            note: order.note,
            created_at: order.created_at,
            items: items.into_iter().map(OrderItemView::from).collect(),
        }
    }
}

/// Read and cancel a shopper's own orders
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Newest first, without line items.
    pub async fn list_for_user(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<OrderView>, u64), ServiceError> {
        let paginator = order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((
            orders
                .into_iter()
                .map(|o| OrderView::new(o, Vec::new()))
                .collect(),
            total,
        ))
    }

    pub async fn find_owned(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))
    }

    pub async fn get_for_user(
        &self,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderView, ServiceError> {
        let order = self.find_owned(user_id, order_id).await?;
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;
        Ok(OrderView::new(order, items))
    }

    /// Cancel a pending, unpaid order and close any open QR session.
    ///
    /// A coupon used by the order stays redeemed.
    #[instrument(skip(self))]
    pub async fn cancel(&self, user_id: Uuid, order_id: Uuid) -> Result<OrderView, ServiceError> {
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        if !order.status.is_cancellable() {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} can no longer be cancelled",
                order.order_number
            )));
        }
        if order.payment_status == PaymentStatus::Paid {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is already paid; contact support for a refund",
                order.order_number
            )));
        }

        let now = Utc::now();
        payment::Entity::update_many()
            .col_expr(
                payment::Column::Status,
                Expr::value(payment::PaymentRecordStatus::Cancelled),
            )
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Status.eq(payment::PaymentRecordStatus::Pending))
            .exec(&txn)
            .await?;

        let coupon_id = order.coupon_id;
        let mut active = order.into_active_model();
        active.status = Set(OrderStatus::Cancelled);
        active.payment_status = Set(PaymentStatus::Cancelled);
        active.updated_at = Set(now);
        let cancelled = active.update(&txn).await?;

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(cancelled.id))
            .all(&txn)
            .await?;
        txn.commit().await?;

        counter!("fashion_store.orders.cancelled", 1);
        info!(order_number = %cancelled.order_number, "order cancelled");
        self.event_sender
            .send_or_log(Event::OrderCancelled {
                order_id: cancelled.id,
                coupon_id,
            })
            .await;

        Ok(OrderView::new(cancelled, items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn order_number_has_date_and_six_char_suffix() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 23, 59, 0).unwrap();
        let number = generate_order_number(now);
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ORD");
        assert_eq!(parts[1], "20240309");
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2]
            .bytes()
            .all(|b| ORDER_SUFFIX_ALPHABET.contains(&b)));
    }

    #[test]
    fn only_pending_orders_are_cancellable() {
        assert!(OrderStatus::Pending.is_cancellable());
        assert!(!OrderStatus::Confirmed.is_cancellable());
        assert!(!OrderStatus::Cancelled.is_cancellable());
    }
}
