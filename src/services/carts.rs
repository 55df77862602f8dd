use crate::{
    entities::{cart, cart_item, product},
    errors::ServiceError,
    services::coupons::{CartContext, CartLine},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

pub const MAX_LINE_QUANTITY: i32 = 99;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CartItemView {
    pub product_id: Uuid,
    pub category_id: Uuid,
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
    /// False when the product has been withdrawn since it was added
    pub available: bool,
}

/// Priced snapshot of a user's cart
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CartView {
    pub cart_id: Option<Uuid>,
    pub items: Vec<CartItemView>,
    /// Sum of the available lines
    pub subtotal: Decimal,
    pub item_count: i32,
}

impl CartView {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_unavailable_items(&self) -> bool {
        self.items.iter().any(|i| !i.available)
    }

    /// The slice of the cart that coupon rules look at
    pub fn coupon_context(&self) -> CartContext {
        let lines: Vec<CartLine> = self
            .items
            .iter()
            .filter(|i| i.available)
            .map(|i| CartLine {
                product_id: i.product_id,
                category_id: i.category_id,
            })
            .collect();
        CartContext::from_lines(self.subtotal, &lines)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct AddCartItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 99))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct UpdateCartItemRequest {
    /// Zero removes the line
    #[validate(range(min = 0, max = 99))]
    pub quantity: i32,
}

/// Per-user shopping cart
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn get_cart(&self, user_id: Uuid) -> Result<CartView, ServiceError> {
        Self::load_cart(&*self.db, user_id).await
    }

    /// Read and price the cart on any connection (checkout passes its
    /// transaction here).
    pub async fn load_cart<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let Some(cart) = cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(db)
            .await?
        else {
            return Ok(CartView::default());
        };

        let rows = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .find_also_related(product::Entity)
            .all(db)
            .await?;

        let mut view = CartView {
            cart_id: Some(cart.id),
            ..Default::default()
        };

        for (item, product) in rows {
            let Some(product) = product else { continue };
            let line_total = product.price * Decimal::from(item.quantity);
            if product.is_active {
                view.subtotal += line_total;
                view.item_count += item.quantity;
            }
            view.items.push(CartItemView {
                product_id: product.id,
                category_id: product.category_id,
                product_name: product.name,
                unit_price: product.price,
                quantity: item.quantity,
                line_total,
                available: product.is_active,
            });
        }

        Ok(view)
    }

    async fn get_or_create_cart(&self, user_id: Uuid) -> Result<cart::Model, ServiceError> {
        if let Some(existing) = cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;
        info!(cart_id = %cart.id, %user_id, "cart created");
        Ok(cart)
    }

    /// Add a product, merging with an existing line for the same product.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        user_id: Uuid,
        request: AddCartItemRequest,
    ) -> Result<CartView, ServiceError> {
        let product = product::Entity::find_by_id(request.product_id)
            .one(&*self.db)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", request.product_id))
            })?;

        let cart = self.get_or_create_cart(user_id).await?;
        let now = Utc::now();

        match Self::find_line(&*self.db, cart.id, product.id).await? {
            Some(line) => {
                let quantity = line.quantity + request.quantity;
                if quantity > MAX_LINE_QUANTITY {
                    return Err(ServiceError::InvalidInput(format!(
                        "At most {MAX_LINE_QUANTITY} of one product per order"
                    )));
                }
                let mut line = line.into_active_model();
                line.quantity = Set(quantity);
                line.updated_at = Set(now);
                line.update(&*self.db).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    product_id: Set(product.id),
                    quantity: Set(request.quantity),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&*self.db)
                .await?;
            }
        }

        self.get_cart(user_id).await
    }

    #[instrument(skip(self))]
    pub async fn update_quantity(
        &self,
        user_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity == 0 {
            return self.remove_item(user_id, product_id).await;
        }
        if !(1..=MAX_LINE_QUANTITY).contains(&quantity) {
            return Err(ServiceError::InvalidInput(format!(
                "quantity must be between 0 and {MAX_LINE_QUANTITY}"
            )));
        }

        let line = self.require_line(user_id, product_id).await?;
        let mut line = line.into_active_model();
        line.quantity = Set(quantity);
        line.updated_at = Set(Utc::now());
        line.update(&*self.db).await?;

        self.get_cart(user_id).await
    }

    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let line = self.require_line(user_id, product_id).await?;
        cart_item::Entity::delete_by_id(line.id)
            .exec(&*self.db)
            .await?;
        self.get_cart(user_id).await
    }

    pub async fn clear(&self, user_id: Uuid) -> Result<(), ServiceError> {
        Self::clear_on(&*self.db, user_id).await
    }

    /// Empty the cart on the given connection
    pub async fn clear_on<C: ConnectionTrait>(db: &C, user_id: Uuid) -> Result<(), ServiceError> {
        if let Some(cart) = cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(db)
            .await?
        {
            cart_item::Entity::delete_many()
                .filter(cart_item::Column::CartId.eq(cart.id))
                .exec(db)
                .await?;
        }
        Ok(())
    }

    async fn find_line<C: ConnectionTrait>(
        db: &C,
        cart_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<cart_item::Model>, ServiceError> {
        Ok(cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::ProductId.eq(product_id))
            .one(db)
            .await?)
    }

    async fn require_line(
        &self,
        user_id: Uuid,
        product_id: Uuid,
    ) -> Result<cart_item::Model, ServiceError> {
        let not_found = || ServiceError::NotFound(format!("Product {product_id} is not in the cart"));
        let cart = cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or_else(not_found)?;
        Self::find_line(&*self.db, cart.id, product_id)
            .await?
            .ok_or_else(not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn item(price: Decimal, available: bool) -> CartItemView {
        CartItemView {
            product_id: Uuid::new_v4(),
            category_id: Uuid::new_v4(),
            product_name: "Áo thun".to_string(),
            unit_price: price,
            quantity: 1,
            line_total: price,
            available,
        }
    }

    #[test]
    fn coupon_context_ignores_unavailable_lines() {
        let kept = item(dec!(150000), true);
        let gone = item(dec!(90000), false);
        let view = CartView {
            cart_id: Some(Uuid::new_v4()),
            items: vec![kept.clone(), gone.clone()],
            subtotal: dec!(150000),
            item_count: 1,
        };

        let ctx = view.coupon_context();
        assert_eq!(ctx.subtotal, dec!(150000));
        assert_eq!(ctx.product_ids, vec![kept.product_id]);
        assert!(!ctx.category_ids.contains(&gone.category_id));
        assert!(view.has_unavailable_items());
    }
}
