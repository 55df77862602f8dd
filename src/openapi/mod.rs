use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fashion Store API",
        version = "0.3.0",
        description = r#"
# Fashion Store storefront API

Carts, saved addresses, coupons, checkout and Sepay QR bank-transfer payments.

## Authentication

Shopper endpoints take a JWT in the Authorization header:

```
Authorization: Bearer <token>
```

Coupon validation and the availability probe also work anonymously; private
coupons then answer `AUTH_REQUIRED_FOR_PRIVATE_COUPON`.

## Errors

Every error body carries a stable machine-readable `code`. Clients should
switch on `code`, never on `message`:

```json
{
  "error": "Unprocessable Entity",
  "code": "MIN_ORDER_NOT_MET",
  "message": "Order subtotal must be at least 500000 (add 100000 more)",
  "request_id": "6f0c...",
  "timestamp": "2024-03-01T08:00:00Z"
}
```

## Money

Amounts are Vietnamese dong, rounded to whole units.
        "#,
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Coupons", description = "Coupon validation, redemption and administration"),
        (name = "Cart", description = "Shopping cart"),
        (name = "Addresses", description = "Saved delivery addresses"),
        (name = "Checkout", description = "Order review and placement"),
        (name = "Orders", description = "Order history and cancellation"),
        (name = "Payments", description = "Sepay QR payments"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        // Coupons
        crate::handlers::coupons::validate_coupon,
        crate::handlers::coupons::apply_coupon,
        crate::handlers::coupons::check_coupon,
        crate::handlers::coupons::available_coupons,
        crate::handlers::coupons::list_coupons,
        crate::handlers::coupons::create_coupon,
        crate::handlers::coupons::get_coupon,
        crate::handlers::coupons::update_coupon,
        crate::handlers::coupons::delete_coupon,

        // Cart
        crate::handlers::carts::get_cart,
        crate::handlers::carts::add_cart_item,
        crate::handlers::carts::update_cart_item,
        crate::handlers::carts::remove_cart_item,
        crate::handlers::carts::clear_cart,

        // Addresses
        crate::handlers::addresses::list_addresses,
        crate::handlers::addresses::create_address,
        crate::handlers::addresses::delete_address,

        // Checkout
        crate::handlers::checkout::review_checkout,
        crate::handlers::checkout::place_order,

        // Orders
        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::cancel_order,

        // Payments
        crate::handlers::payments::start_sepay_payment,
        crate::handlers::payments::payment_status,
        crate::handlers::payments::cancel_payment,
        crate::handlers::payments::watch_payment,
        crate::handlers::payments::sepay_webhook,

        crate::handlers::health::health_check,
    ),
    components(
        schemas(
            crate::errors::ErrorResponse,
            crate::services::coupons::RejectionReason,
            crate::services::payments::SessionStatus,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDocV1;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "Bearer",
            SecurityScheme::Http(
                HttpBuilder::new()
                    .scheme(HttpAuthScheme::Bearer)
                    .bearer_format("JWT")
                    .build(),
            ),
        );
    }
}

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_coupon_and_payment_paths() {
        let json = serde_json::to_string(&ApiDocV1::openapi()).unwrap();
        assert!(json.contains("/api/v1/coupons/validate"));
        assert!(json.contains("/api/v1/payments/{order_id}/sepay"));
        assert!(json.contains("\"Bearer\""));
    }
}
