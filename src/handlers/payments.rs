use crate::{
    auth::AuthUser,
    errors::ApiError,
    handlers::common::{created_response, map_service_error, success_response},
    services::payments::{
        MonitorEvent, PaymentSessionView, PaymentStatusView, PaymentWatch, SepayWebhookPayload,
        WebhookAck,
    },
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    http::{header::AUTHORIZATION, HeaderMap},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Router,
};
use chrono::Utc;
use futures::stream::{self, Stream};
use std::sync::Arc;
use uuid::Uuid;

pub fn payment_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sepay/webhook", post(sepay_webhook))
        .route("/:order_id/sepay", post(start_sepay_payment))
        .route("/:order_id/status", get(payment_status))
        .route("/:order_id/cancel", post(cancel_payment))
        .route("/:order_id/watch", get(watch_payment))
}

/// Open a QR session, or return the live one.
#[utoipa::path(
    post,
    path = "/api/v1/payments/{order_id}/sepay",
    params(("order_id" = Uuid, Path, description = "Order to pay")),
    responses(
        (status = 201, description = "QR session", body = PaymentSessionView),
        (status = 400, description = "Order is not payable by transfer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already paid", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn start_sepay_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .services
        .payments
        .start(user.user_id, order_id, Utc::now())
        .await
        .map_err(map_service_error)?;
    Ok(created_response(session))
}

/// Manual "check status"; also what the poller calls.
#[utoipa::path(
    get,
    path = "/api/v1/payments/{order_id}/status",
    params(("order_id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Session state", body = PaymentStatusView),
        (status = 404, description = "No session for the order", body = crate::errors::ErrorResponse),
        (status = 502, description = "Bank lookup failed", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn payment_status(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .services
        .payments
        .status(user.user_id, order_id, Utc::now())
        .await
        .map_err(map_service_error)?;
    Ok(success_response(status))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/{order_id}/cancel",
    params(("order_id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Session cancelled", body = PaymentStatusView),
        (status = 400, description = "No open session", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already paid", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn cancel_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .services
        .payments
        .cancel(user.user_id, order_id, Utc::now())
        .await
        .map_err(map_service_error)?;
    Ok(success_response(status))
}

/// Server-sent countdown and status events until the session settles.
/// Closing the connection stops the monitor.
#[utoipa::path(
    get,
    path = "/api/v1/payments/{order_id}/watch",
    params(("order_id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "text/event-stream of monitor events"),
        (status = 404, description = "No session for the order", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "Payments"
)]
pub async fn watch_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(order_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let watch = state
        .services
        .payments
        .watch(user.user_id, order_id)
        .await
        .map_err(map_service_error)?;
    Ok(Sse::new(monitor_stream(watch)).keep_alive(KeepAlive::default()))
}

/// The stream owns the monitor handle, so dropping the response cancels it.
fn monitor_stream(
    watch: PaymentWatch,
) -> impl Stream<Item = Result<SseEvent, axum::Error>> {
    let PaymentWatch { handle, events } = watch;
    stream::unfold((events, handle), |(mut events, handle)| async move {
        let event: MonitorEvent = events.recv().await?;
        let sse = SseEvent::default().event(event.name()).json_data(&event);
        Some((sse, (events, handle)))
    })
}

/// Sepay pushes every account movement here with `Authorization: Apikey <key>`.
#[utoipa::path(
    post,
    path = "/api/v1/payments/sepay/webhook",
    request_body = SepayWebhookPayload,
    responses(
        (status = 200, description = "Acknowledged", body = WebhookAck),
        (status = 401, description = "Bad API key", body = crate::errors::ErrorResponse),
    ),
    tag = "Payments"
)]
pub async fn sepay_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<SepayWebhookPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let authorization = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let ack = state
        .services
        .payments
        .webhook(authorization, &payload, Utc::now())
        .await
        .map_err(map_service_error)?;
    Ok(success_response(ack))
}
