use crate::{
    auth::AuthUser,
    errors::ApiError,
    handlers::common::{created_response, map_service_error, success_response, validate_input},
    services::{
        checkout::{CheckoutRequest, CheckoutReview},
        orders::OrderView,
    },
    AppState,
};
use axum::{
    extract::{Json, State},
    response::IntoResponse,
    routing::post,
    Router,
};
use chrono::Utc;
use std::sync::Arc;

pub fn checkout_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(place_order))
        .route("/review", post(review_checkout))
}

/// Price the cart with coupon, shipping and address. Nothing is saved.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/review",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Priced checkout", body = CheckoutReview),
        (status = 400, description = "Invalid request or empty cart", body = crate::errors::ErrorResponse),
        (status = 404, description = "Coupon or address not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Coupon usage limit reached", body = crate::errors::ErrorResponse),
        (status = 422, description = "Coupon not applicable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn review_checkout(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let review = state
        .services
        .checkout
        .review(user.user_id, &payload, Utc::now())
        .await
        .map_err(map_service_error)?;
    Ok(success_response(review))
}

/// Place the order. The coupon is re-validated and redeemed in the same
/// transaction that creates the order.
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order placed", body = OrderView),
        (status = 400, description = "Invalid request or empty cart", body = crate::errors::ErrorResponse),
        (status = 404, description = "Coupon or address not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Coupon usage limit reached", body = crate::errors::ErrorResponse),
        (status = 422, description = "Coupon not applicable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Checkout"
)]
pub async fn place_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let order = state
        .services
        .checkout
        .place_order(user.user_id, &payload, Utc::now())
        .await
        .map_err(map_service_error)?;
    Ok(created_response(order))
}
