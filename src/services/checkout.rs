//! Checkout: turns the live cart into a priced order.
//!
//! `review` and `place_order` run the same pipeline. `place_order` runs it
//! inside one transaction together with the order insert, the coupon ledger
//! write and the cart clear, so an order never exists without its
//! redemption (or vice versa).

use crate::{
    entities::{
        coupon,
        order::{self, OrderStatus, PaymentMethod, PaymentStatus, ShippingAddress},
        order_item,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        addresses::{AddressInput, AddressService},
        carts::{CartItemView, CartService, CartView},
        coupons::{compute_discount, round_vnd, CouponService, CouponSummary, Redemption, UsageLedger},
        orders::{generate_order_number, OrderView},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectionTrait, DatabaseConnection, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Pluggable shipping fee
#[async_trait]
pub trait ShippingFeeCalculator: Send + Sync {
    async fn fee(
        &self,
        address: Option<&ShippingAddress>,
        cart: &CartView,
    ) -> Result<Decimal, ServiceError>;
}

/// Same fee for every order. The shop currently runs with zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatShippingFee(pub Decimal);

#[async_trait]
impl ShippingFeeCalculator for FlatShippingFee {
    async fn fee(
        &self,
        _address: Option<&ShippingAddress>,
        _cart: &CartView,
    ) -> Result<Decimal, ServiceError> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct CheckoutRequest {
    /// A saved address; takes precedence over `address`
    pub address_id: Option<Uuid>,
    /// Inline delivery address
    #[validate]
    pub address: Option<AddressInput>,
    pub coupon_code: Option<String>,
    #[serde(default = "default_payment_method")]
    pub payment_method: PaymentMethod,
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

fn default_payment_method() -> PaymentMethod {
    PaymentMethod::Cod
}

/// Priced checkout, nothing persisted
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutReview {
    pub items: Vec<CartItemView>,
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub discount_amount: Decimal,
    pub total: Decimal,
    pub coupon: Option<CouponSummary>,
    pub shipping_address: Option<ShippingAddress>,
}

/// Result of pricing the cart
struct Quote {
    cart: CartView,
    coupon: Option<coupon::Model>,
    address: Option<ShippingAddress>,
    shipping_fee: Decimal,
    discount: Decimal,
    total: Decimal,
}

impl Quote {
    fn into_review(self) -> CheckoutReview {
        CheckoutReview {
            subtotal: self.cart.subtotal,
            items: self.cart.items,
            shipping_fee: self.shipping_fee,
            discount_amount: self.discount,
            total: self.total,
            coupon: self.coupon.as_ref().map(CouponSummary::from),
            shipping_address: self.address,
        }
    }
}

/// `subtotal + shipping - discount`, never below zero.
pub fn order_total(subtotal: Decimal, shipping_fee: Decimal, discount: Decimal) -> Decimal {
    round_vnd((subtotal + shipping_fee - discount).max(Decimal::ZERO))
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    shipping: Arc<dyn ShippingFeeCalculator>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        shipping: Arc<dyn ShippingFeeCalculator>,
    ) -> Self {
        Self {
            db,
            event_sender,
            shipping,
        }
    }

    #[instrument(skip(self, request))]
    pub async fn review(
        &self,
        user_id: Uuid,
        request: &CheckoutRequest,
        now: DateTime<Utc>,
    ) -> Result<CheckoutReview, ServiceError> {
        request.validate()?;
        let quote = self
            .quote(&*self.db, user_id, request, now, false)
            .await?;
        Ok(quote.into_review())
    }

    #[instrument(skip(self, request), fields(coupon = ?request.coupon_code))]
    pub async fn place_order(
        &self,
        user_id: Uuid,
        request: &CheckoutRequest,
        now: DateTime<Utc>,
    ) -> Result<OrderView, ServiceError> {
        request.validate()?;
        let txn = self.db.begin().await?;

        let quote = self.quote(&txn, user_id, request, now, true).await?;
        let address = quote.address.clone().ok_or_else(|| {
            ServiceError::InvalidInput("A shipping address is required".to_string())
        })?;
        if request.payment_method == PaymentMethod::Sepay && quote.total.is_zero() {
            return Err(ServiceError::InvalidOperation(
                "Nothing to pay by transfer; choose cash on delivery".to_string(),
            ));
        }

        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_number: Set(generate_order_number(now)),
            user_id: Set(user_id),
            status: Set(OrderStatus::Pending),
            payment_method: Set(request.payment_method),
            payment_status: Set(PaymentStatus::Unpaid),
            subtotal: Set(quote.cart.subtotal),
            shipping_fee: Set(quote.shipping_fee),
            discount_amount: Set(quote.discount),
            total: Set(quote.total),
            coupon_id: Set(quote.coupon.as_ref().map(|c| c.id)),
            coupon_code: Set(quote.coupon.as_ref().map(|c| c.code.clone())),
            shipping_address: Set(address),
            note: Set(request
                .note
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(quote.cart.items.len());
        for line in &quote.cart.items {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(line.product_id),
                category_id: Set(line.category_id),
                product_name: Set(line.product_name.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                line_total: Set(line.line_total),
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        if let Some(coupon) = &quote.coupon {
            UsageLedger::record_redemption(
                &txn,
                Redemption {
                    coupon_id: coupon.id,
                    user_id,
                    order_id: order.id,
                    discount_amount: quote.discount,
                    applied_at: now,
                },
            )
            .await?;
        }

        CartService::clear_on(&txn, user_id).await?;
        txn.commit().await?;

        counter!("fashion_store.orders.created", 1, "payment_method" => payment_label(order.payment_method));
        info!(
            order_number = %order.order_number,
            total = %order.total,
            discount = %order.discount_amount,
            "order placed"
        );

        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: order.id,
                order_number: order.order_number.clone(),
                user_id,
                total: order.total,
            })
            .await;
        if let Some(coupon) = &quote.coupon {
            self.event_sender
                .send_or_log(Event::CouponRedeemed {
                    coupon_id: coupon.id,
                    order_id: order.id,
                    user_id,
                    discount_amount: quote.discount,
                })
                .await;
        }

        Ok(OrderView::new(order, items))
    }

    async fn quote<C: ConnectionTrait>(
        &self,
        db: &C,
        user_id: Uuid,
        request: &CheckoutRequest,
        now: DateTime<Utc>,
        require_address: bool,
    ) -> Result<Quote, ServiceError> {
        let cart = CartService::load_cart(db, user_id).await?;
        if cart.is_empty() {
            return Err(ServiceError::InvalidOperation("Cart is empty".to_string()));
        }
        if cart.has_unavailable_items() {
            return Err(ServiceError::InvalidOperation(
                "Some products in the cart are no longer available".to_string(),
            ));
        }

        // Always re-evaluated against the live cart.
        let coupon = match request
            .coupon_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
        {
            Some(code) => Some(
                CouponService::evaluate_on(db, code, Some(user_id), &cart.coupon_context(), now)
                    .await?,
            ),
            None => None,
        };

        let address = self.resolve_address(db, user_id, request).await?;
        if require_address && address.is_none() {
            return Err(ServiceError::InvalidInput(
                "A shipping address is required".to_string(),
            ));
        }

        let shipping_fee = round_vnd(self.shipping.fee(address.as_ref(), &cart).await?);
        let discount = coupon
            .as_ref()
            .map(|c| compute_discount(c, cart.subtotal))
            .unwrap_or(Decimal::ZERO);
        let total = order_total(cart.subtotal, shipping_fee, discount);

        Ok(Quote {
            cart,
            coupon,
            address,
            shipping_fee,
            discount,
            total,
        })
    }

    /// Saved address, then inline fields, then the user's default.
    async fn resolve_address<C: ConnectionTrait>(
        &self,
        db: &C,
        user_id: Uuid,
        request: &CheckoutRequest,
    ) -> Result<Option<ShippingAddress>, ServiceError> {
        if let Some(id) = request.address_id {
            let saved = AddressService::find_owned(db, user_id, id).await?;
            return Ok(Some(ShippingAddress::from(&saved)));
        }
        if let Some(inline) = &request.address {
            return Ok(Some(ShippingAddress {
                recipient_name: inline.recipient_name.trim().to_string(),
                phone: inline.phone.trim().to_string(),
                province: inline.province.trim().to_string(),
                ward: inline.ward.trim().to_string(),
                street: inline.street.trim().to_string(),
            }));
        }
        Ok(AddressService::find_default(db, user_id)
            .await?
            .map(|a| ShippingAddress::from(&a)))
    }
}

fn payment_label(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::Cod => "cod",
        PaymentMethod::Sepay => "sepay",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn total_is_floored_at_zero() {
        assert_eq!(order_total(dec!(30000), dec!(0), dec!(30000)), dec!(0));
        assert_eq!(order_total(dec!(30000), dec!(0), dec!(50000)), dec!(0));
    }

    #[test]
    fn total_adds_shipping_and_subtracts_discount() {
        assert_eq!(
            order_total(dec!(1000000), dec!(30000), dec!(100000)),
            dec!(930000)
        );
    }

    #[tokio::test]
    async fn flat_fee_ignores_address() {
        let calc = FlatShippingFee(dec!(25000));
        let fee = calc.fee(None, &CartView::default()).await.unwrap();
        assert_eq!(fee, dec!(25000));
    }

    #[test]
    fn payment_method_defaults_to_cod() {
        let req: CheckoutRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.payment_method, PaymentMethod::Cod);
    }
}
