use crate::{
    auth::{AdminUser, AuthUser, MaybeAuthUser},
    entities::coupon,
    errors::ApiError,
    handlers::common::{
        created_response, map_service_error, no_content_response, success_response,
        validate_input, PaginatedResponse, PaginationParams,
    },
    services::coupons::{
        AppliedCoupon, ApplyCouponRequest, CouponFilter, CouponInput, CouponSummary,
        CouponValidation, ValidateCouponRequest,
    },
    AppState,
};
use axum::{
    extract::{Json, Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Storefront and admin coupon endpoints
pub fn coupon_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_coupons).post(create_coupon))
        .route("/validate", post(validate_coupon))
        .route("/apply", post(apply_coupon))
        .route("/available", get(available_coupons))
        .route("/check/:code", get(check_coupon))
        .route(
            "/:id",
            get(get_coupon).put(update_coupon).delete(delete_coupon),
        )
}

/// Check a code against an order value and cart scope.
///
/// Business-rule rejections are a normal answer here, returned as
/// `eligible: false` with the rejection code.
#[utoipa::path(
    post,
    path = "/api/v1/coupons/validate",
    request_body = ValidateCouponRequest,
    responses(
        (status = 200, description = "Eligibility decision", body = CouponValidation),
        (status = 400, description = "Malformed request", body = crate::errors::ErrorResponse),
        (status = 401, description = "Invalid token", body = crate::errors::ErrorResponse),
    ),
    tag = "Coupons"
)]
pub async fn validate_coupon(
    State(state): State<Arc<AppState>>,
    MaybeAuthUser(user): MaybeAuthUser,
    Json(payload): Json<ValidateCouponRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let validation = state
        .services
        .coupons
        .validate(&payload, user.map(|u| u.user_id), Utc::now())
        .await
        .map_err(map_service_error)?;
    Ok(success_response(validation))
}

/// Record the redemption behind an order.
///
/// Checkout already writes the ledger entry, so orders placed through it
/// get 200 with the existing entry; 201 only when the entry was missing.
#[utoipa::path(
    post,
    path = "/api/v1/coupons/apply",
    request_body = ApplyCouponRequest,
    responses(
        (status = 201, description = "Redemption recorded", body = AppliedCoupon),
        (status = 200, description = "Redemption already recorded", body = AppliedCoupon),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order or coupon not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Usage limit reached", body = crate::errors::ErrorResponse),
        (status = 422, description = "Coupon not applicable to the order", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Coupons"
)]
pub async fn apply_coupon(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let applied = state
        .services
        .coupons
        .apply(user.user_id, &payload, Utc::now())
        .await
        .map_err(map_service_error)?;
    Ok(if applied.newly_recorded {
        created_response(applied)
    } else {
        success_response(applied)
    })
}

/// Availability probe without cart context
#[utoipa::path(
    get,
    path = "/api/v1/coupons/check/{code}",
    params(("code" = String, Path, description = "Coupon code, case-insensitive")),
    responses(
        (status = 200, description = "Coupon is usable", body = CouponSummary),
        (status = 401, description = "Private coupon needs sign-in", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown code", body = crate::errors::ErrorResponse),
        (status = 409, description = "Usage limit reached", body = crate::errors::ErrorResponse),
        (status = 422, description = "Coupon not usable", body = crate::errors::ErrorResponse),
    ),
    tag = "Coupons"
)]
pub async fn check_coupon(
    State(state): State<Arc<AppState>>,
    MaybeAuthUser(user): MaybeAuthUser,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let coupon = state
        .services
        .coupons
        .check(&code, user.map(|u| u.user_id), Utc::now())
        .await
        .map_err(map_service_error)?;
    Ok(success_response(CouponSummary::from(&coupon)))
}

#[utoipa::path(
    get,
    path = "/api/v1/coupons/available",
    responses(
        (status = 200, description = "Coupons the caller can use now", body = [CouponSummary]),
    ),
    tag = "Coupons"
)]
pub async fn available_coupons(
    State(state): State<Arc<AppState>>,
    MaybeAuthUser(user): MaybeAuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let coupons = state
        .services
        .coupons
        .available(user.map(|u| u.user_id), Utc::now())
        .await
        .map_err(map_service_error)?;
    let summaries: Vec<CouponSummary> = coupons.iter().map(CouponSummary::from).collect();
    Ok(success_response(summaries))
}

#[utoipa::path(
    get,
    path = "/api/v1/coupons",
    params(CouponFilter, PaginationParams),
    responses(
        (status = 200, description = "Coupons", body = PaginatedResponse<coupon::Model>),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Coupons"
)]
pub async fn list_coupons(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Query(filter): Query<CouponFilter>,
    Query(pagination): Query<PaginationParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (page, per_page) = pagination.normalized();
    let (coupons, total) = state
        .services
        .coupons
        .list(&filter, page, per_page)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(PaginatedResponse::new(
        coupons, page, per_page, total,
    )))
}

#[utoipa::path(
    post,
    path = "/api/v1/coupons",
    request_body = CouponInput,
    responses(
        (status = 201, description = "Coupon created", body = coupon::Model),
        (status = 400, description = "Invalid coupon", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse),
        (status = 409, description = "Code already in use", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Coupons"
)]
pub async fn create_coupon(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Json(payload): Json<CouponInput>,
) -> Result<impl IntoResponse, ApiError> {
    let coupon = state
        .services
        .coupons
        .create(payload)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(coupon))
}

#[utoipa::path(
    get,
    path = "/api/v1/coupons/{id}",
    params(("id" = Uuid, Path, description = "Coupon id")),
    responses(
        (status = 200, description = "Coupon", body = coupon::Model),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Coupons"
)]
pub async fn get_coupon(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let coupon = state
        .services
        .coupons
        .get(id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(coupon))
}

#[utoipa::path(
    put,
    path = "/api/v1/coupons/{id}",
    params(("id" = Uuid, Path, description = "Coupon id")),
    request_body = CouponInput,
    responses(
        (status = 200, description = "Coupon updated", body = coupon::Model),
        (status = 400, description = "Invalid coupon", body = crate::errors::ErrorResponse),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Code already in use", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Coupons"
)]
pub async fn update_coupon(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<CouponInput>,
) -> Result<impl IntoResponse, ApiError> {
    let coupon = state
        .services
        .coupons
        .update(id, payload)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(coupon))
}

/// Only never-redeemed coupons can be deleted; deactivate the rest.
#[utoipa::path(
    delete,
    path = "/api/v1/coupons/{id}",
    params(("id" = Uuid, Path, description = "Coupon id")),
    responses(
        (status = 204, description = "Coupon deleted"),
        (status = 403, description = "Admin only", body = crate::errors::ErrorResponse),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Coupon has redemptions", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Coupons"
)]
pub async fn delete_coupon(
    State(state): State<Arc<AppState>>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .services
        .coupons
        .delete(id)
        .await
        .map_err(map_service_error)?;
    Ok(no_content_response())
}
