pub mod addresses;
pub mod carts;
pub mod checkout;
pub mod common;
pub mod coupons;
pub mod health;
pub mod orders;
pub mod payments;

use crate::{
    db::DbPool,
    events::EventSender,
    services::{
        addresses::AddressService,
        carts::CartService,
        checkout::{CheckoutService, ShippingFeeCalculator},
        coupons::CouponService,
        orders::OrderService,
        payments::{PaymentGateway, PaymentService, PaymentSettings},
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub coupons: Arc<CouponService>,
    pub carts: Arc<CartService>,
    pub addresses: Arc<AddressService>,
    pub checkout: Arc<CheckoutService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        shipping: Arc<dyn ShippingFeeCalculator>,
        payment_settings: PaymentSettings,
    ) -> Self {
        Self {
            coupons: Arc::new(CouponService::new(db_pool.clone(), event_sender.clone())),
            carts: Arc::new(CartService::new(db_pool.clone())),
            addresses: Arc::new(AddressService::new(db_pool.clone())),
            checkout: Arc::new(CheckoutService::new(
                db_pool.clone(),
                event_sender.clone(),
                shipping,
            )),
            orders: Arc::new(OrderService::new(db_pool.clone(), event_sender.clone())),
            payments: Arc::new(PaymentService::new(
                db_pool,
                event_sender,
                gateway,
                payment_settings,
            )),
        }
    }
}
