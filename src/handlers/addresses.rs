use crate::{
    auth::AuthUser,
    errors::ApiError,
    handlers::common::{created_response, map_service_error, no_content_response, success_response, validate_input},
    services::addresses::{AddressInput, AddressView},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    response::IntoResponse,
    routing::{delete, get},
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

pub fn address_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_addresses).post(create_address))
        .route("/:id", delete(delete_address))
}

#[utoipa::path(
    get,
    path = "/api/v1/addresses",
    responses(
        (status = 200, description = "Saved addresses, default first", body = [AddressView]),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Addresses"
)]
pub async fn list_addresses(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> Result<impl IntoResponse, ApiError> {
    let addresses = state
        .services
        .addresses
        .list(user.user_id)
        .await
        .map_err(map_service_error)?;
    let views: Vec<AddressView> = addresses.into_iter().map(AddressView::from).collect();
    Ok(success_response(views))
}

#[utoipa::path(
    post,
    path = "/api/v1/addresses",
    request_body = AddressInput,
    responses(
        (status = 201, description = "Address saved", body = AddressView),
        (status = 400, description = "Invalid address", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Addresses"
)]
pub async fn create_address(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(payload): Json<AddressInput>,
) -> Result<impl IntoResponse, ApiError> {
    validate_input(&payload)?;
    let address = state
        .services
        .addresses
        .create(user.user_id, payload)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(AddressView::from(address)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/addresses/{id}",
    params(("id" = Uuid, Path, description = "Address id")),
    responses(
        (status = 204, description = "Address removed"),
        (status = 404, description = "Not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Addresses"
)]
pub async fn delete_address(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .services
        .addresses
        .delete(user.user_id, id)
        .await
        .map_err(map_service_error)?;
    Ok(no_content_response())
}
